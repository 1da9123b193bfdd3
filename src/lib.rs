//! Descent - a caching iterative DNS resolver.
//!
//! Answers A queries by walking the delegation chain from a root server,
//! answers PTR queries locally, and caches final answers by TTL. The engine
//! in [`resolver`] is a synchronous state machine; [`transport`] drives it
//! over UDP.

pub mod cache;
pub mod classify;
pub mod codec;
pub mod dns;
pub mod error;
pub mod pending;
pub mod resolver;
pub mod responder;
pub mod server;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
