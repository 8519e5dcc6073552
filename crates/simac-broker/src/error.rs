use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by the broker, the request client and device handles.
#[derive(Debug, thiserror::Error)]
pub enum MacError {
    /// Transport-level error (bind, connect).
    #[error("transport error: {0}")]
    Transport(#[from] simac_transport::TransportError),

    /// Socket-level error (handshake, request/reply).
    #[error("socket error: {0}")]
    Socket(#[from] simac_socket::SocketError),

    /// An envelope operation ran out of frames.
    #[error("empty envelope")]
    EmptyEnvelope,

    /// A device identifier is already in the service registry.
    #[error("{0} is already registered")]
    AlreadyRegistered(String),

    /// The device is not registered or its backend has not signalled readiness.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// A reply arrived without a body frame.
    #[error("empty reply from {0}")]
    EmptyReply(String),

    /// The backend executable could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The broker loop did not answer its startup ping in time.
    #[error("broker loop did not start within {0:?}")]
    StartupTimeout(Duration),

    /// The broker loop has exited.
    #[error("broker is not running")]
    BrokerStopped,

    /// Thread creation or other local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MacError>;
