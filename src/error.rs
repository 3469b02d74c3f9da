use thiserror::Error;

/// Errors surfaced by the Socket.IO core.
///
/// Malformed inbound frames are reported by the codec and dropped by the
/// connection driver; everything else is returned from emit-class operations.
#[derive(Error, Debug)]
pub enum SocketIoError {
    /// The underlying transport has been closed; no frame was produced.
    #[error("socket has disconnected")]
    Disconnected,

    /// A write to a live transport failed. The transport is closed as a
    /// side effect and the connection is evicted.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A frame could not be parsed. The frame is dropped and the reader
    /// continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Payload serialization failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The client did not acknowledge within the configured window.
    #[error("acknowledgement timed out")]
    AckTimeout,
}

pub type SocketIoResult<T> = Result<T, SocketIoError>;
