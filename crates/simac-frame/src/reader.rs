use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use simac_transport::IpcStream;

use crate::codec::{decode_frame, Frame, FrameConfig, Multipart};
use crate::error::{from_transport, FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames and multipart messages from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read the next complete multipart message (blocking).
    ///
    /// Frames are collected until one arrives without the `MORE` flag.
    /// A control frame anywhere in the sequence is a protocol error.
    pub fn read_message(&mut self) -> Result<Multipart> {
        let mut parts = Multipart::new();
        loop {
            let frame = self.read_frame()?;
            if frame.is_control() {
                return Err(FrameError::UnexpectedKind { found: "control" });
            }
            if parts.len() == self.config.max_parts {
                return Err(FrameError::TooManyParts {
                    max: self.config.max_parts,
                });
            }
            let more = frame.has_more();
            parts.push(frame.payload);
            if !more {
                return Ok(parts);
            }
        }
    }

    /// Read a single control frame (used during the handshake).
    pub fn read_control(&mut self) -> Result<Frame> {
        let frame = self.read_frame()?;
        if !frame.is_control() {
            return Err(FrameError::UnexpectedKind { found: "data" });
        }
        Ok(frame)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(from_transport)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout of the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(from_transport)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, CONTROL, MAGIC, MORE};

    #[test]
    fn read_single_frame() {
        let mut wire = BytesMut::new();
        encode_frame(0, b"hello", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let frame = reader.read_frame().unwrap();

        assert!(!frame.has_more());
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_envelope_message() {
        let mut wire = BytesMut::new();
        encode_frame(MORE, b"0102030405060708", &mut wire).unwrap();
        encode_frame(MORE, b"", &mut wire).unwrap();
        encode_frame(0, b"uplink", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let msg = reader.read_message().unwrap();

        assert_eq!(msg.len(), 3);
        assert_eq!(msg[0].as_ref(), b"0102030405060708");
        assert!(msg[1].is_empty());
        assert_eq!(msg[2].as_ref(), b"uplink");
    }

    #[test]
    fn messages_are_delimited_by_more_flag() {
        let mut wire = BytesMut::new();
        encode_frame(MORE, b"a", &mut wire).unwrap();
        encode_frame(0, b"b", &mut wire).unwrap();
        encode_frame(0, b"c", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert_eq!(reader.read_message().unwrap().len(), 2);
        assert_eq!(reader.read_message().unwrap().len(), 1);
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn control_frame_inside_message_is_rejected() {
        let mut wire = BytesMut::new();
        encode_frame(MORE, b"a", &mut wire).unwrap();
        encode_frame(CONTROL, b"{}", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::UnexpectedKind { found: "control" })
        ));
    }

    #[test]
    fn read_control_rejects_data_frame() {
        let mut wire = BytesMut::new();
        encode_frame(0, b"data", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert!(matches!(
            reader.read_control(),
            Err(FrameError::UnexpectedKind { found: "data" })
        ));
    }

    #[test]
    fn too_many_parts() {
        let mut wire = BytesMut::new();
        for _ in 0..4 {
            encode_frame(MORE, b"x", &mut wire).unwrap();
        }
        encode_frame(0, b"x", &mut wire).unwrap();

        let cfg = FrameConfig {
            max_parts: 4,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire.to_vec()), cfg);
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::TooManyParts { max: 4 })
        ));
    }

    #[test]
    fn partial_read_handling() {
        let mut wire = BytesMut::new();
        encode_frame(MORE, b"slow", &mut wire).unwrap();
        encode_frame(0, b"reply", &mut wire).unwrap();

        let byte_reader = ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let msg = reader.read_message().unwrap();
        assert_eq!(msg[0].as_ref(), b"slow");
        assert_eq!(msg[1].as_ref(), b"reply");
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u32_le(16);
        partial.put_u16_le(0);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_message() {
        let mut wire = BytesMut::new();
        encode_frame(MORE, b"client", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn interrupted_read_retries() {
        let mut wire = BytesMut::new();
        encode_frame(0, b"ok", &mut wire).unwrap();

        let reader = InterruptedThenData {
            interrupted: false,
            bytes: wire.to_vec(),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn applies_read_timeout_for_ipc_stream() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(20)),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_ipc(left, cfg).unwrap();

        let err = reader.read_message().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        ));
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
