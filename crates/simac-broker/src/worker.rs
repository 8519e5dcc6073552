use simac_socket::{ReqSocket, Role, SocketError};
use simac_transport::Endpoint;
use tracing::{debug, info};

use crate::envelope::{self, BACKEND_READY};
use crate::error::Result;

/// Why [`Worker::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The broker delivered the shutdown sentinel.
    Shutdown,
    /// The broker closed the connection.
    Disconnected,
}

/// Backend side of the broker protocol.
///
/// Connects to the worker endpoint under the device identifier, announces
/// readiness, then answers one request at a time.
#[derive(Debug)]
pub struct Worker {
    deveui: String,
    socket: ReqSocket,
}

impl Worker {
    /// Connect as `deveui` and send the readiness sentinel.
    pub fn connect(deveui: &str, address: &Endpoint) -> Result<Self> {
        let mut socket = ReqSocket::connect(address, Role::Worker, Some(deveui))?;
        socket.send(&[BACKEND_READY])?;
        debug!(deveui, %address, "worker connected");
        Ok(Self {
            deveui: deveui.to_string(),
            socket,
        })
    }

    pub fn deveui(&self) -> &str {
        &self.deveui
    }

    /// Answer requests with `handler` until shutdown or disconnect.
    pub fn serve<F>(mut self, mut handler: F) -> Result<ServeExit>
    where
        F: FnMut(&str) -> String,
    {
        loop {
            let message = match self.socket.recv() {
                Ok(message) => message,
                Err(SocketError::Disconnected(_)) => {
                    info!(deveui = %self.deveui, "broker connection closed");
                    return Ok(ServeExit::Disconnected);
                }
                Err(err) => return Err(err.into()),
            };

            if envelope::is_shutdown(&message) {
                info!(deveui = %self.deveui, "shutdown requested");
                return Ok(ServeExit::Shutdown);
            }

            let (client, body) = envelope::unwrap(message)?;
            let command = body
                .first()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let reply = handler(&command);
            self.socket
                .send(&[client.as_ref(), b"", reply.as_bytes()])?;
        }
    }
}

/// Reply `"<command> from <deveui>"`.
pub fn echo_reply(deveui: &str, command: &str) -> String {
    format!("{command} from {deveui}")
}
