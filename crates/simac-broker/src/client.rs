use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use simac_socket::{ReqConfig, ReqSocket, Role};
use simac_transport::{Endpoint, IpcStream};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{MacError, Result};

/// Synchronous request/reply client bound to the broker's client endpoint.
///
/// Connects on first use. A failed round trip (timeout included) discards
/// the connection so the next call starts from a clean request state.
#[derive(Debug)]
pub struct RequestClient {
    address: Endpoint,
    config: ClientConfig,
    socket: Option<ReqSocket>,
    interrupter: Interrupter,
}

/// Closes a [`RequestClient`]'s broker connection from another thread.
///
/// A caller blocked waiting for a reply gets an error instead. Usable
/// without access to the client itself.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    stream: Arc<Mutex<Option<IpcStream>>>,
}

impl Interrupter {
    /// Close the current connection. Returns `false` when none was open.
    pub fn interrupt(&self) -> bool {
        let Some(stream) = self.slot().take() else {
            return false;
        };
        let _ = stream.shutdown();
        true
    }

    fn arm(&self, stream: IpcStream) {
        *self.slot() = Some(stream);
    }

    fn disarm(&self) {
        self.slot().take();
    }

    fn slot(&self) -> MutexGuard<'_, Option<IpcStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RequestClient {
    pub fn new(address: Endpoint) -> Self {
        Self::with_config(address, ClientConfig::default())
    }

    pub fn with_config(address: Endpoint, config: ClientConfig) -> Self {
        Self {
            address,
            config,
            socket: None,
            interrupter: Interrupter::default(),
        }
    }

    /// Handle for breaking a blocked [`RequestClient::send`] from elsewhere.
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Send `command` to the device `target` and wait for its reply.
    pub fn send(&mut self, target: &str, command: &str) -> Result<String> {
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.connect()?,
        };

        trace!(deveui = target, command, "request");
        match socket.request(&[target.as_bytes(), b"", command.as_bytes()]) {
            Ok(reply) => {
                self.socket = Some(socket);
                let body = reply
                    .first()
                    .ok_or_else(|| MacError::EmptyReply(target.to_string()))?;
                let reply = String::from_utf8_lossy(body).into_owned();
                trace!(deveui = target, %reply, "reply");
                Ok(reply)
            }
            Err(err) => {
                debug!(deveui = target, error = %err, "request failed; dropping connection");
                self.interrupter.disarm();
                let _ = socket.shutdown();
                Err(err.into())
            }
        }
    }

    /// Whether a broker connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Drop the broker connection, if any.
    pub fn disconnect(&mut self) {
        self.interrupter.disarm();
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown();
        }
    }

    pub fn address(&self) -> &Endpoint {
        &self.address
    }

    fn connect(&self) -> Result<ReqSocket> {
        let config = ReqConfig {
            reply_timeout: self.config.reply_timeout,
            handshake: self.config.handshake.clone(),
            ..ReqConfig::new(Role::Client)
        };
        let socket = ReqSocket::connect_with_config(&self.address, &config)?;
        self.interrupter.arm(socket.interrupt_handle()?);
        debug!(address = %self.address, identity = socket.identity(), "request client connected");
        Ok(socket)
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
