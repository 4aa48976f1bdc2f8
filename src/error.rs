use thiserror::Error;

use crate::SendableError;

/// Reasons a connection is torn down.
///
/// Application-level failures (unknown route, bad content type, handler
/// status codes) never surface here: they are answered with an HTTP error
/// page and the connection survives. Everything in this enum ends the
/// connection once already-queued output has been flushed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("POST request without Content-Length")]
    MissingContentLength,

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("POST body of {0} bytes exceeds the 16 MiB ceiling")]
    PostTooLarge(usize),

    #[error("failed to allocate {0} bytes")]
    Alloc(usize),

    #[error("invalid websocket frame: {0}")]
    InvalidFrame(&'static str),

    /// Returned to a [`WebSocketSender`](crate::WebSocketSender) whose
    /// connection is already gone.
    #[error("websocket connection is closed")]
    Closed,

    #[error("handler failed: {0}")]
    Handler(SendableError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
