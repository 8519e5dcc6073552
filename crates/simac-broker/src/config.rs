use std::path::PathBuf;
use std::time::Duration;

use simac_frame::FrameConfig;
use simac_socket::HandshakeConfig;
use simac_transport::Endpoint;

/// Default client-facing endpoint.
pub const DEFAULT_CLIENT_ADDRESS: &str = "ipc:///opt/siming/zmq/mac.client";
/// Default worker-facing endpoint; spawned backends receive it through
/// [`BACKEND_ADDRESS_ENV`].
pub const DEFAULT_WORKER_ADDRESS: &str = "ipc:///opt/siming/zmq/mac.rpc";
/// Default executable for the LoRaMac-node backend.
pub const DEFAULT_LORA_MAC_EXECUTABLE: &str = "/opt/siming/bin/loRaMac-node";
/// Environment variable carrying the worker address to spawned backends.
pub const BACKEND_ADDRESS_ENV: &str = "MAC_RPC_BACKEND_ADDRESS";

/// Broker endpoints and limits.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub client_address: Endpoint,
    pub worker_address: Endpoint,
    pub handshake: HandshakeConfig,
    /// Frame limits for established connections on both endpoints. The
    /// write timeout bounds how long one stalled peer can hold up the loop.
    pub frames: FrameConfig,
    /// How long [`crate::Broker::run`] waits for the loop to answer its ping.
    pub startup_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(client_address: Endpoint, worker_address: Endpoint) -> Self {
        Self {
            client_address,
            worker_address,
            handshake: HandshakeConfig::default(),
            frames: FrameConfig {
                write_timeout: Some(Duration::from_secs(5)),
                ..FrameConfig::default()
            },
            startup_timeout: Duration::from_secs(5),
        }
    }

    /// Both endpoints as sockets inside `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(
            Endpoint::from_path(dir.join("mac.client")),
            Endpoint::from_path(dir.join("mac.rpc")),
        )
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(
            Endpoint::from_path(DEFAULT_CLIENT_ADDRESS.trim_start_matches("ipc://")),
            Endpoint::from_path(DEFAULT_WORKER_ADDRESS.trim_start_matches("ipc://")),
        )
    }
}

/// Request client options.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Upper bound on one round trip. `None` waits for as long as it takes.
    pub reply_timeout: Option<Duration>,
    pub handshake: HandshakeConfig,
}

/// Per-device options shared by every handle a directory creates.
#[derive(Debug, Clone)]
pub struct MacConfig {
    pub client: ClientConfig,
    /// How long `stop` waits for a backend to exit before giving up on it.
    pub stop_grace: Duration,
    /// Executable used by [`crate::MacDirectory::start_lora_mac`].
    pub lora_mac_executable: PathBuf,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            stop_grace: Duration::from_secs(2),
            lora_mac_executable: PathBuf::from(DEFAULT_LORA_MAC_EXECUTABLE),
        }
    }
}
