//! Error types.

use thiserror::Error;

/// Errors surfaced through the public API.
///
/// Datapath faults (packet loss, reorder, bad magic) never appear here:
/// loss is absorbed by retransmission and malformed packets are dropped
/// and counted. The only runtime failure an application observes is a
/// continuation delivered with [`RespStatus::SessionReset`].
///
/// [`RespStatus::SessionReset`]: crate::rpc::RespStatus::SessionReset
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal failure while constructing a transport or endpoint.
    #[error("transport creation failed: {0}")]
    TransportCreation(String),

    /// The pinned-buffer allocator is out of memory.
    #[error("pinned buffer allocation failed")]
    BufferExhausted,

    /// Message exceeds the maximum encodable size.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MsgTooLarge { size: usize, max: usize },

    /// No session with this number exists on the endpoint.
    #[error("session {0} not found")]
    SessionNotFound(u16),

    /// The session is not in the Connected state.
    #[error("session {0} not connected")]
    SessionNotConnected(u16),

    /// The endpoint's session table is full.
    #[error("too many sessions")]
    TooManySessions,

    /// The remote address could not be parsed or resolved.
    #[error("invalid remote endpoint {0:?}")]
    InvalidRemote(String),

    /// Invalid packet type value on the wire.
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    /// Header magic mismatch.
    #[error("invalid magic: expected {expected:#x}, got {got:#x}")]
    InvalidMagic { expected: u8, got: u8 },

    /// A buffer was too small for the requested operation.
    #[error("buffer too small: required {required} bytes, available {available} bytes")]
    BufferTooSmall { required: usize, available: usize },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error from the session-management socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
