use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use simac_transport::IpcStream;

use crate::codec::{encode_frame, FrameConfig, CONTROL, MORE};
use crate::error::{from_transport, FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames and multipart messages to any `Write` stream.
///
/// A multipart message is encoded into one buffer and written in a single
/// pass, so a message is never interleaved with another from the same writer.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Send a multipart message. Every part but the last carries `MORE`.
    pub fn send_message<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> Result<()> {
        if parts.is_empty() {
            return Err(FrameError::EmptyMessage);
        }
        if parts.len() > self.config.max_parts {
            return Err(FrameError::TooManyParts {
                max: self.config.max_parts,
            });
        }

        self.buf.clear();
        let last = parts.len() - 1;
        for (idx, part) in parts.iter().enumerate() {
            let part = part.as_ref();
            self.check_size(part)?;
            let flags = if idx == last { 0 } else { MORE };
            encode_frame(flags, part, &mut self.buf)?;
        }
        self.write_buffered()
    }

    /// Send a single control frame.
    pub fn send_control(&mut self, payload: &[u8]) -> Result<()> {
        self.check_size(payload)?;
        self.buf.clear();
        encode_frame(CONTROL, payload, &mut self.buf)?;
        self.write_buffered()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn check_size(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        self.flush()
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(from_transport)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the write timeout of the underlying stream.
    pub fn set_write_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(from_transport)?;
        self.config.write_timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::{decode_frame, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
    use crate::reader::FrameReader;

    #[test]
    fn send_message_sets_more_on_all_but_last() {
        let mut writer = FrameWriter::new(Vec::new());
        writer
            .send_message(&[&b"svc"[..], b"", b"client", b"", b"body"])
            .unwrap();

        let mut wire = BytesMut::from(writer.into_inner().as_slice());
        let mut flags = Vec::new();
        while let Some(frame) = decode_frame(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap() {
            flags.push(frame.flags);
        }
        assert_eq!(flags, vec![MORE, MORE, MORE, MORE, 0]);
    }

    #[test]
    fn empty_message_is_rejected() {
        let mut writer = FrameWriter::new(Vec::new());
        let parts: [&[u8]; 0] = [];
        assert!(matches!(
            writer.send_message(&parts),
            Err(FrameError::EmptyMessage)
        ));
        assert!(writer.get_ref().is_empty());
    }

    #[test]
    fn oversized_part_writes_nothing() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Vec::new(), cfg);
        let err = writer
            .send_message(&[&b"ok"[..], b"too-long"])
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 8, max: 4 }));
        assert!(writer.get_ref().is_empty());
    }

    #[test]
    fn too_many_parts_rejected_before_encoding() {
        let cfg = FrameConfig {
            max_parts: 2,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Vec::new(), cfg);
        let err = writer.send_message(&[b"a", b"b", b"c"]).unwrap_err();
        assert!(matches!(err, FrameError::TooManyParts { max: 2 }));
    }

    #[test]
    fn control_frame_on_the_wire() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.send_control(b"{}").unwrap();

        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(reader.read_control().unwrap().is_control());
    }

    #[test]
    fn message_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send_message(&[&b""[..], b"\x01"]).unwrap();
        writer.send_message(&[b"ping"]).unwrap();

        let ready = reader.read_message().unwrap();
        assert!(ready[0].is_empty());
        assert_eq!(ready[1].as_ref(), b"\x01");
        assert_eq!(reader.read_message().unwrap()[0].as_ref(), b"ping");
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let reader_thread = std::thread::spawn(move || {
            for i in 0..64 {
                let msg = reader.read_message().unwrap();
                assert_eq!(msg.len(), 3);
                assert_eq!(msg[2].as_ref(), format!("msg-{i}").as_bytes());
            }
        });

        for i in 0..64 {
            let body = format!("msg-{i}");
            writer
                .send_message(&[&b"client"[..], b"", body.as_bytes()])
                .unwrap();
        }

        reader_thread.join().unwrap();
    }

    #[test]
    fn write_to_closed_peer_fails() {
        let (left, right) = IpcStream::pair().unwrap();
        drop(right);
        let mut writer = FrameWriter::new(left);
        // The first write may land in the kernel buffer; keep going until EPIPE.
        let mut failed = false;
        for _ in 0..16 {
            if writer.send_message(&[vec![0u8; 64 * 1024]]).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
