use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::ValueEnum;
use tracing::{debug, Level};

use ipk25_chat::config::{ClientConfig, TransportKind};
use ipk25_chat::session::Session;
use ipk25_chat::transport::tcp::TcpClient;
use ipk25_chat::transport::udp::UdpClient;
use ipk25_chat::transport::Transport;

/// Client for the IPK25-CHAT protocol over TCP or UDP.
#[derive(Parser)]
struct Args {
    /// Transport protocol used for the connection
    #[clap(short = 't', value_enum)]
    transport: TransportArg,

    /// Server IP or hostname
    #[clap(short = 's')]
    server: String,

    /// Server port
    #[clap(short = 'p', default_value_t = 4567)]
    port: u16,

    /// UDP confirmation timeout in milliseconds
    #[clap(short = 'd', default_value_t = 250)]
    timeout: u64,

    /// Maximum number of UDP retransmissions
    #[clap(short = 'r', default_value_t = 3)]
    retries: u8,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Tcp,
    Udp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::WARN,
    };
    // stdout is reserved for the operator-visible protocol output
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let host = resolve_ipv4(&args.server, args.port).await?;
    debug!(server = %args.server, %host, "resolved server address");

    let mut config = ClientConfig::new(
        match args.transport {
            TransportArg::Tcp => TransportKind::Tcp,
            TransportArg::Udp => TransportKind::Udp,
        },
        host,
    );
    config.port = args.port;
    config.udp_confirm_timeout = Duration::from_millis(args.timeout);
    config.udp_max_retries = args.retries;

    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Tcp => Arc::new(TcpClient::connect(config.server_addr()).await?),
        TransportKind::Udp => Arc::new(
            UdpClient::new(
                config.server_addr(),
                config.udp_confirm_timeout,
                config.udp_max_retries,
            )
            .await?,
        ),
    };

    let session = Session::new(transport);
    session.run().await?;

    // a blocking stdin read cannot be cancelled; exit directly so runtime
    // shutdown does not wait for one still in flight
    std::process::exit(0);
}

async fn resolve_ipv4(host: &str, port: u16) -> anyhow::Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .find(|a| a.is_ipv4())
        .map(|a| a.ip())
        .ok_or_else(|| anyhow!("no IPv4 address found for {}", host))
}
