/// Errors that can occur on router and request sockets.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] simac_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] simac_frame::FrameError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No reply arrived in time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A request socket was used out of its send/receive order.
    #[error("invalid socket state: {0}")]
    State(&'static str),

    /// A received message lacked the empty delimiter frame.
    #[error("malformed message: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, SocketError>;
