//! Error types for the transport and the message bus

use thiserror::Error;

/// Errors raised while establishing or driving a connection
#[derive(Error, Debug)]
pub enum TransportError {
    /// URL scheme is not ws or wss
    #[error("unsupported url scheme in '{0}': expected ws or wss")]
    UnsupportedScheme(String),

    /// URL could not be parsed
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Socket-level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The forwarding proxy refused the CONNECT request
    #[error("proxy refused connection: {0}")]
    ProxyConnect(String),

    /// The peer closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// Definite outcome of a [`Transport::send`](crate::transport::Transport::send)
///
/// `NotConnected` is the bus's cue to buffer; the other variants are
/// send-level failures that enter the retry path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The transport is not in the Connected state
    #[error("transport is not connected")]
    NotConnected,

    /// Frame exceeds the configured size limit
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// The outbound queue is full
    #[error("outbound queue is full")]
    QueueFull,
}
