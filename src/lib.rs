pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod util;
