use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use simac_frame::{FrameError, FrameReader, FrameWriter};

use crate::error::{Result, SocketError};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
/// Identities longer than this are refused, as are empty ones.
pub const MAX_IDENTITY_LEN: usize = 255;

/// Which endpoint a connecting socket expects to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A requester on the frontend.
    Client,
    /// A service worker on the backend.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Handshake request sent by the connecting side as a CONTROL frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. Must be `simac` by default.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
    /// The role the connecting side plays.
    pub role: Role,
    /// Requested routing identity; the listener assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Handshake response sent by the listening side as a CONTROL frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Negotiated protocol version.
    pub version: String,
    /// Routing identity the listener will use for this connection.
    pub identity: String,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Routing identity of the connecting side.
    pub identity: String,
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Role the connecting side declared.
    pub role: Role,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "simac".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// Perform the connecting side of the handshake.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: Role,
    identity: Option<&str>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    if let Some(identity) = identity {
        validate_identity(identity)?;
    }

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        role,
        identity: identity.map(str::to_string),
    };
    send_control_json(writer, &req)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_control_payload(
        reader,
        deadline,
        config.timeout,
        config.max_handshake_payload,
    )?;
    let resp: HandshakeResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;
    validate_identity(&resp.identity)?;

    if resp.protocol != config.protocol_name {
        return Err(SocketError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(SocketError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    if let Some(requested) = identity {
        if requested != resp.identity {
            return Err(SocketError::HandshakeFailed(format!(
                "listener assigned identity '{}' instead of '{requested}'",
                resp.identity
            )));
        }
    }

    Ok(HandshakeResult {
        identity: resp.identity,
        protocol_version: resp.version,
        role,
    })
}

/// Perform the listening side of the handshake.
///
/// `fallback_identity` is used when the connecting side did not ask for one.
/// A connecting side declaring a role other than `expected_role` is refused.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    expected_role: Role,
    fallback_identity: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_identity(fallback_identity)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_control_payload(
        reader,
        deadline,
        config.timeout,
        config.max_handshake_payload,
    )?;
    let req: HandshakeRequest = serde_json::from_slice(&payload)?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;

    if req.protocol != config.protocol_name {
        return Err(SocketError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&req.version, &config.protocol_version)? {
        return Err(SocketError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )));
    }

    if req.role != expected_role {
        return Err(SocketError::HandshakeFailed(format!(
            "{} connected to a {expected_role} endpoint",
            req.role
        )));
    }

    let identity = match req.identity {
        Some(identity) => {
            validate_identity(&identity)?;
            identity
        }
        None => fallback_identity.to_string(),
    };

    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        identity: identity.clone(),
    };
    send_control_json(writer, &resp)?;

    Ok(HandshakeResult {
        identity,
        protocol_version: config.protocol_version.clone(),
        role: req.role,
    })
}

fn send_control_json<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.send_control(&payload)?;
    Ok(())
}

fn recv_control_payload<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
    max_handshake_payload: usize,
) -> Result<Vec<u8>> {
    loop {
        if Instant::now() >= deadline {
            return Err(SocketError::Timeout(timeout));
        }

        match reader.read_control() {
            Ok(frame) => {
                if frame.payload.len() > max_handshake_payload {
                    return Err(SocketError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        max_handshake_payload
                    )));
                }
                return Ok(frame.payload.to_vec());
            }
            Err(FrameError::UnexpectedKind { found }) => {
                return Err(SocketError::HandshakeFailed(format!(
                    "expected CONTROL frame, got {found} frame"
                )));
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(SocketError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(SocketError::Frame(err)),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(SocketError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(SocketError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(SocketError::HandshakeFailed(format!(
            "invalid identity length: {}",
            identity.len()
        )));
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |what: &str| {
        SocketError::HandshakeFailed(format!("invalid version '{version}': {what}"))
    };
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    if minor.contains('.') {
        return Err(invalid("expected '<major>.<minor>'"));
    }
    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, ErrorKind, Read};
    use std::thread;
    use std::time::Duration;

    use simac_transport::IpcStream;

    use super::*;

    fn split(stream: IpcStream) -> (FrameReader<IpcStream>, FrameWriter<IpcStream>) {
        (
            FrameReader::new(stream.try_clone().unwrap()),
            FrameWriter::new(stream),
        )
    }

    fn serve(
        stream: IpcStream,
        role: Role,
        fallback: &'static str,
        config: HandshakeConfig,
    ) -> thread::JoinHandle<Result<HandshakeResult>> {
        thread::spawn(move || {
            let (mut reader, mut writer) = split(stream);
            handshake_server(&mut reader, &mut writer, role, fallback, &config)
        })
    }

    #[test]
    fn requested_identity_is_kept() {
        let (left, right) = IpcStream::pair().unwrap();
        let server = serve(left, Role::Worker, "peer-1", HandshakeConfig::default());

        let (mut reader, mut writer) = split(right);
        let client = handshake_client(
            &mut reader,
            &mut writer,
            Role::Worker,
            Some("0102030405060708"),
            &HandshakeConfig::default(),
        )
        .unwrap();
        let server = server.join().unwrap().unwrap();

        assert_eq!(client.identity, "0102030405060708");
        assert_eq!(server.identity, "0102030405060708");
        assert_eq!(server.role, Role::Worker);
        assert_eq!(client.protocol_version, "1.0");
    }

    #[test]
    fn anonymous_client_gets_fallback_identity() {
        let (left, right) = IpcStream::pair().unwrap();
        let server = serve(left, Role::Client, "peer-7", HandshakeConfig::default());

        let (mut reader, mut writer) = split(right);
        let client = handshake_client(
            &mut reader,
            &mut writer,
            Role::Client,
            None,
            &HandshakeConfig::default(),
        )
        .unwrap();

        assert_eq!(client.identity, "peer-7");
        assert_eq!(server.join().unwrap().unwrap().identity, "peer-7");
    }

    #[test]
    fn role_mismatch_is_refused() {
        let (left, right) = IpcStream::pair().unwrap();
        let server = serve(left, Role::Client, "peer-1", HandshakeConfig::default());

        let (mut reader, mut writer) = split(right);
        let client = handshake_client(
            &mut reader,
            &mut writer,
            Role::Worker,
            Some("dev-1"),
            &HandshakeConfig::default(),
        );

        assert!(matches!(client, Err(SocketError::Disconnected(_))));
        assert!(matches!(
            server.join().unwrap(),
            Err(SocketError::HandshakeFailed(msg)) if msg.contains("worker connected to a client endpoint")
        ));
    }

    #[test]
    fn wrong_protocol_name_rejected() {
        let (left, right) = IpcStream::pair().unwrap();
        let server = serve(left, Role::Client, "peer-1", HandshakeConfig::default());

        let (mut reader, mut writer) = split(right);
        let cfg = HandshakeConfig {
            protocol_name: "zmtp".to_string(),
            ..HandshakeConfig::default()
        };
        let client = handshake_client(&mut reader, &mut writer, Role::Client, None, &cfg);

        assert!(matches!(client, Err(SocketError::Disconnected(_))));
        assert!(matches!(
            server.join().unwrap(),
            Err(SocketError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn version_mismatch() {
        let (left, right) = IpcStream::pair().unwrap();
        let server_cfg = HandshakeConfig {
            protocol_version: "2.0".to_string(),
            ..HandshakeConfig::default()
        };
        let server = serve(left, Role::Client, "peer-1", server_cfg);

        let (mut reader, mut writer) = split(right);
        let client = handshake_client(
            &mut reader,
            &mut writer,
            Role::Client,
            None,
            &HandshakeConfig::default(),
        );

        assert!(matches!(client, Err(SocketError::Disconnected(_))));
        assert!(matches!(
            server.join().unwrap(),
            Err(SocketError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn invalid_json_rejected() {
        let (left, right) = IpcStream::pair().unwrap();
        FrameWriter::new(left).send_control(b"{not-json").unwrap();

        let (mut reader, mut writer) = split(right);
        let result = handshake_server(
            &mut reader,
            &mut writer,
            Role::Client,
            "peer-1",
            &HandshakeConfig::default(),
        );
        assert!(matches!(result, Err(SocketError::Json(_))));
    }

    #[test]
    fn data_frame_before_handshake_rejected() {
        let (left, right) = IpcStream::pair().unwrap();
        FrameWriter::new(left).send_message(&[b"hello"]).unwrap();

        let (mut reader, mut writer) = split(right);
        let result = handshake_server(
            &mut reader,
            &mut writer,
            Role::Client,
            "peer-1",
            &HandshakeConfig::default(),
        );
        assert!(matches!(result, Err(SocketError::HandshakeFailed(_))));
    }

    #[test]
    fn empty_identity_rejected_locally() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let result = handshake_client(
            &mut reader,
            &mut writer,
            Role::Worker,
            Some(""),
            &HandshakeConfig::default(),
        );
        assert!(matches!(result, Err(SocketError::HandshakeFailed(_))));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn oversized_identity_rejected_by_listener() {
        let (left, right) = IpcStream::pair().unwrap();
        let request = HandshakeRequest {
            protocol: "simac".to_string(),
            version: "1.0".to_string(),
            role: Role::Worker,
            identity: Some("x".repeat(MAX_IDENTITY_LEN + 1)),
        };
        FrameWriter::new(left)
            .send_control(&serde_json::to_vec(&request).unwrap())
            .unwrap();

        let (mut reader, mut writer) = split(right);
        let result = handshake_server(
            &mut reader,
            &mut writer,
            Role::Worker,
            "peer-1",
            &HandshakeConfig::default(),
        );
        assert!(matches!(result, Err(SocketError::HandshakeFailed(_))));
    }

    #[test]
    fn handshake_timeout() {
        let mut reader = FrameReader::new(AlwaysTimedOutReader);
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };

        let result = handshake_client(&mut reader, &mut writer, Role::Client, None, &cfg);
        assert!(matches!(result, Err(SocketError::Timeout(_))));
    }

    #[test]
    fn request_json_shape() {
        let request = HandshakeRequest {
            protocol: "simac".to_string(),
            version: "1.0".to_string(),
            role: Role::Client,
            identity: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"protocol": "simac", "version": "1.0", "role": "client"})
        );
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("1.0").unwrap(), (1, 0));
        assert_eq!(parse_version("12.34").unwrap(), (12, 34));
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.0.0").is_err());
        assert!(parse_version("a.b").is_err());
        assert!(is_version_compatible("1.2", "1.0").unwrap());
        assert!(!is_version_compatible("1.0", "1.2").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
    }

    struct AlwaysTimedOutReader;

    impl Read for AlwaysTimedOutReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
