use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use simac_frame::{FrameConfig, FrameReader, FrameWriter, Multipart};
use simac_transport::{Endpoint, IpcStream, UnixDomainSocket};
use tracing::debug;

use crate::error::Result;
use crate::handshake::{handshake_server, HandshakeConfig, Role};

/// Listening half of an identity-routed endpoint.
///
/// Every accepted connection gets a unique connection id and a routing
/// identity, either the one the peer asked for in its handshake or an
/// auto-generated `peer-N`. Incoming messages are prefixed with that
/// identity; outgoing messages are written without it.
pub struct RouterListener {
    socket: UnixDomainSocket,
    role: Role,
    handshake_config: HandshakeConfig,
    frame_config: FrameConfig,
    next_conn_id: AtomicU64,
}

impl RouterListener {
    /// Bind to an endpoint that accepts peers of the given role.
    pub fn bind(endpoint: &Endpoint, role: Role) -> Result<Self> {
        let socket = UnixDomainSocket::bind_endpoint(endpoint)?;
        Ok(Self {
            socket,
            role,
            handshake_config: HandshakeConfig::default(),
            frame_config: FrameConfig::default(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Override the frame limits used once a connection is established.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Accept the next connection and run the handshake on it.
    pub fn accept(&self) -> Result<RouterConnection> {
        let stream = self.accept_stream()?;
        self.handshake(stream)
    }

    /// Accept the next raw connection without handshaking.
    ///
    /// Lets callers move the handshake off the accepting thread.
    pub fn accept_stream(&self) -> Result<IpcStream> {
        Ok(self.socket.accept()?)
    }

    /// Run the listening side of the handshake on an accepted stream.
    pub fn handshake(&self, stream: IpcStream) -> Result<RouterConnection> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer_pid = stream.peer_credentials().map(|(_, _, pid)| pid);
        let reader_stream = stream.try_clone()?;

        let handshake_frames = FrameConfig {
            max_payload_size: self.handshake_config.max_handshake_payload,
            read_timeout: Some(self.handshake_config.timeout),
            write_timeout: Some(self.handshake_config.timeout),
            ..self.frame_config.clone()
        };
        let mut reader = FrameReader::with_config_ipc(reader_stream, handshake_frames.clone())?;
        let mut writer = FrameWriter::with_config_ipc(stream, handshake_frames)?;

        let result = handshake_server(
            &mut reader,
            &mut writer,
            self.role,
            &format!("peer-{id}"),
            &self.handshake_config,
        )?;

        // Handshake uses a tighter pre-auth budget; restore runtime limits.
        reader.set_max_payload_size(self.frame_config.max_payload_size);
        writer.set_max_payload_size(self.frame_config.max_payload_size);
        reader.set_read_timeout(self.frame_config.read_timeout)?;
        writer.set_write_timeout(self.frame_config.write_timeout)?;

        debug!(
            conn_id = id,
            identity = %result.identity,
            role = %self.role,
            ?peer_pid,
            "router connection established"
        );

        Ok(RouterConnection {
            id,
            identity: Bytes::from(result.identity.into_bytes()),
            peer_pid,
            reader,
            writer,
        })
    }

    /// The role of peers this listener accepts.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Bound endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.socket.endpoint()
    }
}

/// One handshaken connection on a router endpoint.
pub struct RouterConnection {
    id: u64,
    identity: Bytes,
    peer_pid: Option<u32>,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
}

impl RouterConnection {
    /// Listener-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Routing identity of the peer.
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    /// Process id of the peer, where the platform reports it.
    pub fn peer_pid(&self) -> Option<u32> {
        self.peer_pid
    }

    /// Split into independently owned receive and send halves.
    pub fn into_split(self) -> (RouterReader, RouterWriter) {
        (
            RouterReader {
                identity: self.identity,
                reader: self.reader,
            },
            RouterWriter {
                writer: self.writer,
            },
        )
    }
}

/// Receive half of a router connection.
pub struct RouterReader {
    identity: Bytes,
    reader: FrameReader<IpcStream>,
}

impl RouterReader {
    /// Receive the next message, prefixed with the peer's identity frame.
    pub fn recv(&mut self) -> Result<Multipart> {
        let mut parts = self.reader.read_message()?;
        parts.insert(0, self.identity.clone());
        Ok(parts)
    }
}

/// Send half of a router connection.
pub struct RouterWriter {
    writer: FrameWriter<IpcStream>,
}

impl RouterWriter {
    /// Write a message to the peer as-is. The caller has already removed
    /// the routing identity.
    pub fn send<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> Result<()> {
        self.writer.send_message(parts)?;
        Ok(())
    }

    /// Close the connection in both directions; the paired reader sees EOF.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.writer.get_ref().shutdown()?)
    }
}

impl std::fmt::Debug for RouterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterConnection")
            .field("id", &self.id)
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("peer_pid", &self.peer_pid)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for RouterWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use crate::error::SocketError;
    use crate::req::ReqSocket;

    fn make_endpoint(tag: &str) -> (PathBuf, Endpoint) {
        let dir = std::env::temp_dir().join(format!(
            "simac-router-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let endpoint = Endpoint::from_path(dir.join("router.sock"));
        (dir, endpoint)
    }

    #[test]
    fn accepted_connections_get_sequential_ids() {
        let (dir, endpoint) = make_endpoint("ids");
        let listener = RouterListener::bind(&endpoint, Role::Client).expect("bind");

        let server = thread::spawn(move || {
            let first = listener.accept().expect("first accept");
            let second = listener.accept().expect("second accept");
            (first.id(), first.identity().clone(), second.id())
        });

        let _c1 = ReqSocket::connect(&endpoint, Role::Client, None).expect("first client");
        let _c2 = ReqSocket::connect(&endpoint, Role::Client, None).expect("second client");
        let (first_id, first_identity, second_id) = server.join().expect("server thread");

        assert_eq!(first_id, 1);
        assert_eq!(first_identity.as_ref(), b"peer-1");
        assert_eq!(second_id, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn recv_prefixes_identity_and_send_strips_nothing() {
        let (dir, endpoint) = make_endpoint("route");
        let listener = RouterListener::bind(&endpoint, Role::Worker).expect("bind");

        let server = thread::spawn(move || {
            let conn = listener.accept().expect("accept");
            let (mut reader, mut writer) = conn.into_split();
            let msg = reader.recv().expect("recv");
            writer
                .send(&[&b""[..], b"client-9", b"", b"hello"])
                .expect("send");
            msg
        });

        let mut worker = ReqSocket::connect(&endpoint, Role::Worker, Some("dev-1")).expect("connect");
        worker.send(&[b"\x01"]).expect("send ready");
        let request = worker.recv().expect("recv request");
        let ready = server.join().expect("server thread");

        assert_eq!(ready.len(), 3);
        assert_eq!(ready[0].as_ref(), b"dev-1");
        assert!(ready[1].is_empty());
        assert_eq!(ready[2].as_ref(), b"\x01");

        assert_eq!(request.len(), 3);
        assert_eq!(request[0].as_ref(), b"client-9");
        assert_eq!(request[2].as_ref(), b"hello");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wrong_role_is_refused() {
        let (dir, endpoint) = make_endpoint("role");
        let listener = RouterListener::bind(&endpoint, Role::Client).expect("bind");

        let server = thread::spawn(move || listener.accept().map(|conn| conn.id()));

        let client = ReqSocket::connect(&endpoint, Role::Worker, Some("dev-1"));
        assert!(client.is_err());
        assert!(matches!(
            server.join().expect("server thread"),
            Err(SocketError::HandshakeFailed(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn shutdown_wakes_paired_reader() {
        let (dir, endpoint) = make_endpoint("shutdown");
        let listener = RouterListener::bind(&endpoint, Role::Client).expect("bind");

        let server = thread::spawn(move || {
            let conn = listener.accept().expect("accept");
            let (mut reader, writer) = conn.into_split();
            let blocked = thread::spawn(move || reader.recv());
            writer.shutdown().expect("shutdown");
            blocked.join().expect("reader thread")
        });

        let _client = ReqSocket::connect(&endpoint, Role::Client, None).expect("connect");
        let result = server.join().expect("server thread");
        assert!(matches!(
            result,
            Err(SocketError::Frame(simac_frame::FrameError::ConnectionClosed))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
