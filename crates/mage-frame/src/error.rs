/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame header carries an opcode outside the protocol.
    #[error("unknown frame opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the byte stream itself is corrupt and cannot be resynchronized.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::PayloadTooLarge { .. } | FrameError::UnknownOpcode(_)
        )
    }

    /// True for read/write timeouts, which leave any partial frame buffered.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
