use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use mage_transport::NetStream;

use crate::channel::ChannelId;
use crate::codec::{encode_frame, Frame, FrameConfig, Opcode};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// Each frame is encoded into one contiguous buffer and handed to the inner
/// writer in a single `write_all`, so a sealing writer underneath sees whole
/// frames. On a socket with a write timeout, `WouldBlock` surfaces as an
/// error instead of spinning.
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

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.channel, frame.opcode, frame.payload.as_ref())
    }

    /// Encode and send a payload on a channel.
    pub fn send(&mut self, channel: ChannelId, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(channel, opcode, payload, &mut self.buf)?;

        let encoded = std::mem::take(&mut self.buf);
        let result = self.write_all_retrying(&encoded);
        self.buf = encoded;
        result?;

        self.flush()
    }

    /// Write unframed bytes and flush.
    ///
    /// Used by the whole-connection byte mode, which never mixes with
    /// framed writes on the same stream.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all_retrying(bytes)?;
        self.flush()
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

    fn write_all_retrying(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            match self.inner.write(&bytes[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
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

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<NetStream> {
    /// Create a frame writer for `NetStream` and apply write timeout from config.
    pub fn with_config_net(inner: NetStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::BytesMut;
    use mage_transport::TcpTransport;

    use super::*;
    use crate::codec::decode_frame;

    fn decode_all(bytes: Vec<u8>) -> Vec<Frame> {
        let mut wire = BytesMut::from(bytes.as_slice());
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut wire, usize::MAX).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn write_single_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(1, Opcode::Data, b"hello").unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 1);
        assert_eq!(frames[0].opcode, Opcode::Data);
        assert_eq!(frames[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn write_multiple_frames_keeps_order() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(1, Opcode::Data, b"one").unwrap();
        writer.send(0, Opcode::Control, b"two").unwrap();
        writer.send(3, Opcode::Data, b"three").unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        let summary: Vec<(u8, Opcode, &[u8])> = frames
            .iter()
            .map(|f| (f.channel, f.opcode, f.payload.as_ref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, Opcode::Data, b"one".as_ref()),
                (0, Opcode::Control, b"two".as_ref()),
                (3, Opcode::Data, b"three".as_ref()),
            ]
        );
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.send(1, Opcode::Data, b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 4 }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn write_frame_method() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let frame = Frame::new(2, Opcode::Handshake, "abc");
        writer.write_frame(&frame).unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn frame_is_handed_over_in_one_write() {
        let sink = CountingWriter::default();
        let writes = Arc::clone(&sink.writes);
        let mut writer = FrameWriter::new(sink);

        writer.send(1, Opcode::Data, &[7u8; 300]).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send(1, Opcode::Data, b"x").unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn write_raw_passes_bytes_through() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.write_raw(b"not a frame").unwrap();
        assert_eq!(writer.into_inner().into_inner(), b"not a frame");
    }

    #[test]
    fn handles_interrupted_write_and_flush() {
        let writer_impl = InterruptedWriteThenFlush {
            wrote_once: false,
            flush_interrupted: false,
            data: Vec::new(),
        };

        let mut writer = FrameWriter::new(writer_impl);
        writer.send(5, Opcode::Data, b"retry").unwrap();

        let frames = decode_all(writer.into_inner().data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"retry");
    }

    #[test]
    fn would_block_is_reported() {
        let mut writer = FrameWriter::new(WouldBlockWriter);
        let err = writer.send(6, Opcode::Data, b"stall").unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(1, Opcode::Data, b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn applies_write_timeout_for_net_stream() {
        let (left, _right) = TcpTransport::loopback_pair().unwrap();
        let cfg = FrameConfig {
            write_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let writer = FrameWriter::with_config_net(left, cfg);
        assert!(writer.is_ok());
    }

    #[test]
    fn written_bytes_decode_through_reader() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(3, Opcode::Data, b"z").unwrap();

        let wire = writer.into_inner().into_inner();
        let mut framed = crate::reader::FrameReader::new(Cursor::new(wire));
        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.channel, 3);
        assert_eq!(frame.payload.as_ref(), b"z");
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingWriter {
        writes: Arc<AtomicUsize>,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct InterruptedWriteThenFlush {
        wrote_once: bool,
        flush_interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptedWriteThenFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.wrote_once {
                self.wrote_once = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if !self.flush_interrupted {
                self.flush_interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            Ok(())
        }
    }

    struct WouldBlockWriter;

    impl Write for WouldBlockWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
