use clap::Parser;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use descent::cache::CacheConfig;
use descent::resolver::{DEFAULT_ROOT, ResolverConfig};
use descent::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "descent")]
#[command(about = "Caching iterative DNS resolver", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    /// Root server every resolution starts from
    #[arg(short, long, default_value_t = DEFAULT_ROOT)]
    root: Ipv4Addr,

    /// Port used for the root and every authoritative server
    #[arg(long, default_value = "53")]
    upstream_port: u16,

    /// Deadline for a whole resolution, in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Referrals a resolution may follow
    #[arg(long, default_value = "10")]
    max_hops: u8,

    /// Concurrent resolutions before new queries are refused
    #[arg(long, default_value = "4096")]
    max_resolutions: usize,

    /// Drop abandoned resolutions silently instead of replying SERVFAIL
    #[arg(long)]
    no_servfail: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(self.bind), self.port),
            resolver: ResolverConfig {
                root: SocketAddr::new(IpAddr::V4(self.root), self.upstream_port),
                upstream_port: self.upstream_port,
                timeout: Duration::from_millis(self.timeout_ms),
                max_hops: self.max_hops,
                max_resolutions: self.max_resolutions,
                servfail_on_failure: !self.no_servfail,
                cache: CacheConfig::default(),
            },
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, server::run(args.into_config()))
}
