//! Local socket transport for simac.
//!
//! The broker's client and worker endpoints are Unix domain sockets addressed
//! with `ipc://` URLs, as ZeroMQ's ipc transport names them. This crate
//! provides:
//! - [`Endpoint`] parsing of `ipc://<path>` addresses
//! - [`UnixDomainSocket`] bind/accept/connect with stale-socket cleanup
//! - [`IpcStream`], the connected byte stream every higher layer builds on

pub mod address;
pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use address::Endpoint;
pub use error::{Result, TransportError};
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
