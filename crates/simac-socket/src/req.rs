use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use simac_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, Multipart};
use simac_transport::{Endpoint, IpcStream, UnixDomainSocket};
use tracing::trace;

use crate::error::{Result, SocketError};
use crate::handshake::{handshake_client, HandshakeConfig, Role};

/// Options for [`ReqSocket::connect_with_config`].
#[derive(Debug, Clone)]
pub struct ReqConfig {
    /// Role announced in the handshake.
    pub role: Role,
    /// Requested routing identity. `None` lets the listener pick one.
    pub identity: Option<String>,
    /// How long [`ReqSocket::recv`] waits. `None` blocks until a reply or EOF.
    pub reply_timeout: Option<Duration>,
    pub handshake: HandshakeConfig,
    pub frames: FrameConfig,
}

impl ReqConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            identity: None,
            reply_timeout: None,
            handshake: HandshakeConfig::default(),
            frames: FrameConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    Idle,
    AwaitingReply,
}

/// Strict request/reply socket.
///
/// Sends and receives alternate, starting with a send. Every outgoing
/// message is preceded by an empty delimiter frame and every incoming one
/// has everything up to and including its first empty frame removed.
pub struct ReqSocket {
    identity: String,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    state: ReqState,
    reply_timeout: Option<Duration>,
}

impl ReqSocket {
    /// Connect with default settings.
    pub fn connect(endpoint: &Endpoint, role: Role, identity: Option<&str>) -> Result<Self> {
        let mut config = ReqConfig::new(role);
        config.identity = identity.map(str::to_string);
        Self::connect_with_config(endpoint, &config)
    }

    /// Connect with explicit configuration.
    pub fn connect_with_config(endpoint: &Endpoint, config: &ReqConfig) -> Result<Self> {
        let stream = UnixDomainSocket::connect_endpoint(endpoint)?;
        let reader_stream = stream.try_clone()?;

        let handshake_frames = FrameConfig {
            max_payload_size: config.handshake.max_handshake_payload,
            read_timeout: Some(config.handshake.timeout),
            write_timeout: Some(config.handshake.timeout),
            ..config.frames.clone()
        };
        let mut reader = FrameReader::with_config_ipc(reader_stream, handshake_frames.clone())?;
        let mut writer = FrameWriter::with_config_ipc(stream, handshake_frames)?;

        let handshake = handshake_client(
            &mut reader,
            &mut writer,
            config.role,
            config.identity.as_deref(),
            &config.handshake,
        )?;
        // Handshake uses a tighter pre-auth budget; restore runtime limits.
        reader.set_max_payload_size(config.frames.max_payload_size);
        writer.set_max_payload_size(config.frames.max_payload_size);
        reader.set_read_timeout(config.reply_timeout)?;
        writer.set_write_timeout(config.frames.write_timeout)?;

        Ok(Self {
            identity: handshake.identity,
            reader,
            writer,
            state: ReqState::Idle,
            reply_timeout: config.reply_timeout,
        })
    }

    /// Routing identity the listener knows this socket by.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send a request. Fails if the previous request has not been answered.
    pub fn send<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> Result<()> {
        if self.state == ReqState::AwaitingReply {
            return Err(SocketError::State("send while a reply is outstanding"));
        }
        let mut framed: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        framed.push(&[]);
        framed.extend(parts.iter().map(AsRef::as_ref));
        self.writer.send_message(&framed)?;
        self.state = ReqState::AwaitingReply;
        trace!(identity = %self.identity, parts = parts.len(), "request sent");
        Ok(())
    }

    /// Receive the reply to the last request, without the delimiter.
    ///
    /// On timeout the socket stays in the awaiting state and can only be
    /// discarded.
    pub fn recv(&mut self) -> Result<Multipart> {
        if self.state == ReqState::Idle {
            return Err(SocketError::State("recv without a pending request"));
        }
        let mut parts = match self.reader.read_message() {
            Ok(parts) => parts,
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                return Err(SocketError::Timeout(
                    self.reply_timeout.unwrap_or_default(),
                ));
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(SocketError::Disconnected(
                    "connection closed while awaiting reply".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        let Some(delimiter) = parts.iter().position(Bytes::is_empty) else {
            return Err(SocketError::Malformed(format!(
                "reply of {} parts has no delimiter",
                parts.len()
            )));
        };
        parts.drain(..=delimiter);
        self.state = ReqState::Idle;
        Ok(parts)
    }

    /// Send a request and wait for its reply.
    pub fn request<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> Result<Multipart> {
        self.send(parts)?;
        self.recv()
    }

    /// Close the connection in both directions.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.writer.get_ref().shutdown()?)
    }

    /// A second handle on the connection. Shutting it down from another
    /// thread makes a blocked [`ReqSocket::recv`] return
    /// [`SocketError::Disconnected`].
    pub fn interrupt_handle(&self) -> Result<IpcStream> {
        Ok(self.writer.get_ref().try_clone()?)
    }
}

impl std::fmt::Debug for ReqSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqSocket")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("reply_timeout", &self.reply_timeout)
            .finish_non_exhaustive()
    }
}
