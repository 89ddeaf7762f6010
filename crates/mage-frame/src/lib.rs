//! Length-prefixed frame codec with channel multiplexing for mage.
//!
//! Every frame on the wire carries:
//! - A 1-byte channel id
//! - A 4-byte little-endian payload length
//! - A 1-byte opcode (data, control, handshake)
//!
//! Decoding is incremental: partial reads are buffered until a whole
//! frame is available, and malformed headers are reported before any
//! payload memory is reserved.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, ChannelId, CONTROL_CHANNEL};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, Opcode, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
