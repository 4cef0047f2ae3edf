pub mod factory;
pub mod message;
