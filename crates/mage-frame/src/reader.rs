use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use mage_transport::NetStream;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// A read timeout (`WouldBlock`/`TimedOut`) surfaces as [`FrameError::Io`]
/// while any partially received frame stays buffered for the next call.
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
        Self::with_buffered(inner, BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY), config)
    }

    /// Create a frame reader that starts from bytes already read off `inner`.
    pub fn with_buffered(inner: T, buffered: BytesMut, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: buffered,
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

    /// Read unframed bytes, draining any buffered read-ahead first.
    ///
    /// Returns `Ok(0)` at EOF. Used by the whole-connection byte mode, which
    /// never mixes with framed reads on the same stream.
    pub fn read_raw(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.len());
            out[..n].copy_from_slice(&self.buf.split_to(n));
            return Ok(n);
        }

        loop {
            match self.inner.read(out) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Number of bytes read off the stream but not yet returned.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
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
    ///
    /// Any buffered read-ahead is discarded; see [`FrameReader::into_parts`].
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Consume the reader and return the inner stream plus buffered read-ahead.
    pub fn into_parts(self) -> (T, BytesMut) {
        (self.inner, self.buf)
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<NetStream> {
    /// Create a frame reader for `NetStream` and apply read timeout from config.
    pub fn with_config_net(inner: NetStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: mage_transport::TransportError) -> FrameError {
    match err {
        mage_transport::TransportError::Io(io) | mage_transport::TransportError::Accept(io) => {
            FrameError::Io(io)
        }
        mage_transport::TransportError::Bind { source, .. }
        | mage_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};
    use mage_transport::TcpTransport;

    use super::*;
    use crate::codec::{encode_frame, Opcode};

    fn wire(frames: &[(u8, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in frames {
            encode_frame(*channel, Opcode::Data, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let mut reader = FrameReader::new(Cursor::new(wire(&[(1, b"hello")])));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 1);
        assert_eq!(frame.opcode, Opcode::Data);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = wire(&[(1, b"one"), (2, b"two"), (3, b"three")]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.channel, f1.payload.as_ref()), (1, b"one".as_ref()));
        assert_eq!((f2.channel, f2.payload.as_ref()), (2, b"two".as_ref()));
        assert_eq!((f3.channel, f3.payload.as_ref()), (3, b"three".as_ref()));
    }

    #[test]
    fn read_frame_with_large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let mut reader = FrameReader::new(Cursor::new(wire(&[(9, &payload)])));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 9);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[(4, b"slow")]),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_u8(2);
        partial.put_u32_le(16);
        partial.put_u8(Opcode::Data as u8);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn unknown_opcode_in_stream() {
        let bytes = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0xEE];
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(0xEE)));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(1);
        bytes.put_u32_le(1024);
        bytes.put_u8(Opcode::Data as u8);

        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes.to_vec()), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn timeout_keeps_partial_frame_buffered() {
        let bytes = wire(&[(7, b"ok")]);
        let reader = WouldBlockMidFrame {
            bytes,
            pos: 0,
            blocked: false,
        };
        let mut framed = FrameReader::new(reader);

        let err = framed.read_frame().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(framed.buffered_len(), 3);

        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.channel, 7);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            state: 0,
            bytes: wire(&[(8, b"ok")]),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.channel, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn into_parts_returns_read_ahead() {
        let mut bytes = wire(&[(1, b"framed")]);
        bytes.extend_from_slice(b"trailing raw bytes");

        let mut reader = FrameReader::new(Cursor::new(bytes));
        reader.read_frame().unwrap();

        let (_inner, rest) = reader.into_parts();
        assert_eq!(rest.as_ref(), b"trailing raw bytes");
    }

    #[test]
    fn read_raw_drains_buffer_then_stream() {
        let mut framed = BytesMut::new();
        encode_frame(1, Opcode::Data, b"x", &mut framed).unwrap();
        let mut bytes = framed.to_vec();
        bytes.extend_from_slice(b"abc");

        let mut reader = FrameReader::new(Cursor::new(bytes));
        reader.read_frame().unwrap();

        let mut out = [0u8; 2];
        assert_eq!(reader.read_raw(&mut out).unwrap(), 2);
        assert_eq!(&out, b"ab");
        assert_eq!(reader.read_raw(&mut out).unwrap(), 1);
        assert_eq!(&out[..1], b"c");
        assert_eq!(reader.read_raw(&mut out).unwrap(), 0);
    }

    #[test]
    fn with_buffered_decodes_seeded_bytes() {
        let seeded = BytesMut::from(wire(&[(3, b"seed")]).as_slice());
        let mut reader =
            FrameReader::with_buffered(Cursor::new(Vec::new()), seeded, FrameConfig::default());
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 3);
        assert_eq!(frame.payload.as_ref(), b"seed");
    }

    #[test]
    fn roundtrip_over_tcp() {
        let (left, right) = TcpTransport::loopback_pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send(1, Opcode::Data, b"ping").unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 1);
        assert_eq!(frame.payload.as_ref(), b"ping");
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = TcpTransport::loopback_pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let reader_thread = std::thread::spawn(move || {
            for expected in 0..64u8 {
                let frame = reader.read_frame().unwrap();
                assert_eq!(frame.channel, expected % 5);
                assert_eq!(frame.payload.as_ref(), format!("msg-{expected}").as_bytes());
            }
        });

        for i in 0..64u8 {
            let payload = format!("msg-{i}");
            writer.send(i % 5, Opcode::Data, payload.as_bytes()).unwrap();
        }

        reader_thread.join().unwrap();
    }

    #[test]
    fn applies_read_timeout_for_net_stream() {
        let (left, _right) = TcpTransport::loopback_pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config_net(left, cfg).unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(err.is_timeout());
    }

    #[derive(Debug)]
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

    struct WouldBlockMidFrame {
        bytes: Vec<u8>,
        pos: usize,
        blocked: bool,
    }

    impl Read for WouldBlockMidFrame {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == 3 && !self.blocked {
                self.blocked = true;
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            let end = if self.pos < 3 { 3 } else { self.bytes.len() };
            let n = (end - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
