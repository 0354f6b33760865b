//! Error types for trpc.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all trpc operations.
///
/// Variants follow the connection-fatal vs. peer-visible split: handshake and
/// transport errors end a connection, everything else travels back to the
/// caller as the error text of a response header.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (handshake and JSON codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (truncated or garbled frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A header or body segment exceeded the configured limit.
    #[error("Frame segment too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    /// The peer sent a handshake with the wrong magic number.
    #[error("invalid magic number {actual:#x} (expected {expected:#x})")]
    InvalidMagicNumber { expected: u32, actual: u32 },

    /// The peer asked for a codec this side does not implement.
    #[error("unknown codec type: {0}")]
    UnknownCodec(String),

    /// Any other handshake failure (oversized or malformed option record).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Dialing plus handshake did not finish in time.
    #[error("connect timeout: expected within {0:?}")]
    ConnectTimeout(Duration),

    /// Method name is not of the form `Service.Method`.
    #[error("service/method request ill-formed: {0}")]
    IllFormedMethod(String),

    /// No service registered under this name.
    #[error("unknown service {0}")]
    UnknownService(String),

    /// The service exists but has no such method.
    #[error("unknown method {0}")]
    UnknownMethod(String),

    /// A service with this name is already registered.
    #[error("service already defined: {0}")]
    DuplicateService(String),

    /// Service name is not an exported identifier.
    #[error("{0} is not a valid service name")]
    InvalidServiceName(String),

    /// Error text received from the server in a response header.
    #[error("{0}")]
    Remote(String),

    /// The handler itself returned an error.
    #[error("{0}")]
    Handler(String),

    /// The handler did not finish before the negotiated handle timeout.
    #[error("request handle timeout: expected within {0:?}")]
    HandleTimeout(Duration),

    /// The response body could not be decoded into the reply type.
    #[error("reading body {0}")]
    ReadingBody(String),

    /// The client is closing or already shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection failed while the call was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Connection closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A completion queue was requested with zero capacity.
    #[error("completion queue must have non-zero capacity")]
    UnbufferedCompletion,

    /// The caller's deadline elapsed before the response arrived.
    #[error("call timeout: expected within {0:?}")]
    CallTimeout(Duration),

    /// Address given to `xdial` is not `protocol@address`.
    #[error("invalid dial address: {0}")]
    InvalidAddress(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
