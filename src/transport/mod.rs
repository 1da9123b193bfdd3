//! Transport layer for the resolver.
//!
//! Receives datagrams from clients and upstream servers, feeds them to the
//! resolution engine and sends whatever it produces.

pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
