/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x534D \"SM\")")]
    InvalidMagic,

    /// The frame header carries flag bits this codec does not know.
    #[error("unknown frame flags 0x{0:04x}")]
    UnknownFlags(u16),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A message carried more parts than allowed.
    #[error("too many message parts (max {max})")]
    TooManyParts { max: usize },

    /// A zero-part message was submitted for sending.
    #[error("message must contain at least one part")]
    EmptyMessage,

    /// A control frame showed up where a data message was expected, or the reverse.
    #[error("unexpected {found} frame")]
    UnexpectedKind { found: &'static str },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

pub(crate) fn from_transport(err: simac_transport::TransportError) -> FrameError {
    use simac_transport::TransportError;
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
