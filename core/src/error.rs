//! Typed error taxonomy for the CoAP client core.
//!
//! Every variant maps directly onto the error kinds in the protocol
//! design: callers match on kind rather than parsing message strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure: timeout, socket error, non-2.xx response.
    #[error("network error: {0}")]
    Network(String),

    /// The `/sys/dev/sync` handshake returned nothing parseable.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An operation that requires a counter was attempted before `sync()`.
    #[error("session is not synced")]
    NotSynced,

    /// Inbound frame failed length/hex/padding/UTF-8 checks.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame authentication failed.
    #[error("digest mismatch")]
    DigestMismatch,

    /// JSON parsed but the envelope shape was unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Device rejected a write after the retry budget was exhausted.
    #[error("write rejected after retries")]
    WriteRejected,
}

pub type Result<T> = std::result::Result<T, Error>;
