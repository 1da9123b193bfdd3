//! Server orchestration.
//!
//! Binds the transport, hands it a resolver and reports statistics.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::resolver::{Resolver, ResolverConfig};
use crate::stats::Stats;
use crate::transport::udp::UdpTransport;

/// Interval between statistics reports.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the resolver server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    pub resolver: ResolverConfig,
}

/// Bind and start serving on the current `LocalSet`.
///
/// Returns the address the server is listening on.
pub async fn start(config: ServerConfig) -> io::Result<SocketAddr> {
    let stats = Arc::new(Stats::new());
    let transport = UdpTransport::bind(config.bind_addr).await?;
    let local_addr = transport.local_addr()?;

    info!(
        listen = %local_addr,
        root = %config.resolver.root,
        timeout_ms = config.resolver.timeout.as_millis() as u64,
        max_hops = config.resolver.max_hops,
        "resolver listening"
    );

    transport.start(Resolver::new(config.resolver, stats.clone()));
    tokio::task::spawn_local(report_stats(stats));

    Ok(local_addr)
}

/// Run the server until the process exits.
pub async fn run(config: ServerConfig) -> io::Result<()> {
    start(config).await?;
    std::future::pending::<()>().await;
    Ok(())
}

async fn report_stats(stats: Arc<Stats>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // first tick is immediate
    loop {
        interval.tick().await;
        let snapshot = stats.snapshot_and_reset();
        info!(
            requests = snapshot.requests,
            resolved = snapshot.resolved,
            cached = snapshot.cached,
            ptr = snapshot.ptr,
            failed = snapshot.failed,
            avg_response_ms = %format!("{:.2}", snapshot.avg_response_ms),
            cache = snapshot.cache_entries,
            in_flight = snapshot.in_flight,
            "stats"
        );
    }
}
