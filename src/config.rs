use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Which wire transport the session talks over. Selected once at startup and
/// immutable for the session's lifetime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportKind,
    /// already resolved to a numeric address
    pub host: IpAddr,
    pub port: u16,

    /// how long one datagram transmission attempt waits for its CONFIRM
    pub udp_confirm_timeout: Duration,
    /// retransmissions after the first attempt, i.e. `retries + 1` attempts total
    pub udp_max_retries: u8,
}

impl ClientConfig {
    pub fn new(transport: TransportKind, host: IpAddr) -> ClientConfig {
        ClientConfig {
            transport,
            host,
            port: 4567,
            udp_confirm_timeout: Duration::from_millis(250),
            udp_max_retries: 3,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
