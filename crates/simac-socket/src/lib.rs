//! Identity-routed sockets over framed local streams.
//!
//! Two socket kinds, modelled on ZeroMQ's ROUTER and REQ:
//! - [`RouterListener`] accepts many peers, tags every incoming message with
//!   the sender's identity and lets the owner address replies by identity.
//! - [`ReqSocket`] connects to a router and enforces strict send/receive
//!   alternation with an empty delimiter frame in front of each message.
//!
//! Both sides open with a JSON handshake on a CONTROL frame that names the
//! protocol, version, role and (optionally) the requested identity.

pub mod error;
pub mod handshake;
pub mod req;
pub mod router;

pub use error::{Result, SocketError};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, HandshakeRequest, HandshakeResponse,
    HandshakeResult, Role, MAX_IDENTITY_LEN,
};
pub use req::{ReqConfig, ReqSocket};
pub use router::{RouterConnection, RouterListener, RouterReader, RouterWriter};
