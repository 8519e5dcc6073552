//! MAC device broker.
//!
//! A [`Broker`] owns two router endpoints. Request clients connect to the
//! client endpoint and address commands to a device identifier; backends
//! connect to the worker endpoint under that identifier, announce readiness
//! with a one-byte sentinel, then answer commands. The broker swaps the
//! routing envelope in both directions and tracks readiness in a
//! [`ServiceRegistry`].
//!
//! On top of that:
//! - [`Mac`] manages one device: registration, backend launch (a thread or a
//!   spawned executable), fail-fast requests and shutdown.
//! - [`MacDirectory`] owns a running broker and every device started on it.
//! - [`Worker`] implements the backend side of the protocol.
//!
//! ```no_run
//! use simac_broker::{BrokerConfig, MacConfig, MacDirectory, Worker, echo_reply};
//!
//! # fn main() -> simac_broker::Result<()> {
//! let directory = MacDirectory::start(BrokerConfig::in_dir("/tmp/simac"), MacConfig::default())?;
//! directory.start_inproc("0000000000000001", |deveui, address| {
//!     if let Ok(worker) = Worker::connect(deveui, address) {
//!         let id = deveui.to_string();
//!         let _ = worker.serve(|command| echo_reply(&id, command));
//!     }
//! })?;
//! directory.wait_ready(std::time::Duration::from_secs(5));
//!
//! if let Some(mac) = directory.get("0000000000000001") {
//!     println!("{}", mac.request("PING")?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod mac;
pub mod registry;
pub mod worker;

pub use broker::{Broker, BrokerHandle};
pub use client::{Interrupter, RequestClient};
pub use config::{
    BrokerConfig, ClientConfig, MacConfig, BACKEND_ADDRESS_ENV, DEFAULT_CLIENT_ADDRESS,
    DEFAULT_LORA_MAC_EXECUTABLE, DEFAULT_WORKER_ADDRESS,
};
pub use directory::MacDirectory;
pub use envelope::{BACKEND_READY, BACKEND_SHUTDOWN};
pub use error::{MacError, Result};
pub use mac::{Backend, InProcFn, Mac};
pub use registry::{RegisteredService, ServiceRegistry};
pub use worker::{echo_reply, ServeExit, Worker};

pub use simac_transport::Endpoint;
