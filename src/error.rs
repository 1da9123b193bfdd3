//! Error types for the resolver.

use thiserror::Error;

/// Result type alias for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving. None of them is fatal to the process.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed packet; dropped without a reply.
    #[error("failed to decode DNS message: {0}")]
    DecodeFailure(String),

    #[error("failed to encode DNS message: {0}")]
    EncodeFailure(String),

    /// A lookup for this authority is already in flight.
    #[error("address lookup for {0} is already pending")]
    Conflict(String),

    #[error("resolution timed out")]
    Timeout,

    /// The delegation chain ran out of hops or the authority has no address.
    #[error("no usable delegation for {0}")]
    UnresolvableDelegation(String),

    /// Every upstream transaction id is taken by a query in flight.
    #[error("no free upstream transaction id")]
    IdsExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
