//! UDP transport.
//!
//! One socket faces clients, a second ephemeral socket talks to root and
//! authoritative servers. A single task owns the engine and multiplexes
//! both sockets plus a sweep tick with `select!`, so engine state is never
//! shared across tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::classify::Source;
use crate::codec;
use crate::resolver::Resolver;
use crate::responder::{Outgoing, Responder};

use super::MAX_DNS_PACKET_SIZE;

/// How often expired resolutions and cache entries are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// UDP transport for the resolver.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    upstream_socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the client-facing socket on `addr` and an ephemeral socket for
    /// upstream traffic.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let upstream_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        Ok(Self {
            socket,
            upstream_socket,
        })
    }

    /// Address clients should send queries to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the event loop on the current `LocalSet`.
    pub fn start(self, resolver: Resolver) {
        tokio::task::spawn_local(run(self.socket, self.upstream_socket, resolver));
    }
}

async fn run(socket: Arc<UdpSocket>, upstream: Arc<UdpSocket>, mut resolver: Resolver) {
    let responder = Responder::new(socket.clone(), upstream.clone());
    let mut client_buf = [0u8; MAX_DNS_PACKET_SIZE];
    let mut upstream_buf = [0u8; MAX_DNS_PACKET_SIZE];
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        let out = tokio::select! {
            result = socket.recv_from(&mut client_buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "UDP recv error");
                        continue;
                    }
                };
                dispatch(&mut resolver, &client_buf[..len], Source::Client, src)
            }
            result = upstream.recv_from(&mut upstream_buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "UDP upstream recv error");
                        continue;
                    }
                };
                dispatch(&mut resolver, &upstream_buf[..len], Source::Upstream, src)
            }
            _ = sweep.tick() => resolver.sweep(Instant::now()),
        };

        for outgoing in &out {
            responder.send(outgoing).await;
        }
    }
}

fn dispatch(
    resolver: &mut Resolver,
    bytes: &[u8],
    source: Source,
    from: SocketAddr,
) -> Vec<Outgoing> {
    match codec::decode(bytes) {
        Ok(message) => resolver.handle(message, source, from, Instant::now()),
        Err(e) => {
            debug!(error = %e, from = %from, len = bytes.len(), "dropping undecodable datagram");
            Vec::new()
        }
    }
}
