use mage_frame::ChannelId;
use serde::{Deserialize, Serialize};

/// Connection-level message carried in `Control` frames on channel 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The sender is tearing the connection down.
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The sender consumed `credit` bytes of `channel` and has room for that
    /// many more.
    Window { channel: ChannelId, credit: u32 },
    /// Any message type this side does not know; ignored.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Create a close notice.
    pub fn close() -> Self {
        ControlMessage::Close { reason: None }
    }

    /// Create a close notice carrying a reason.
    pub fn close_with_reason(reason: impl Into<String>) -> Self {
        ControlMessage::Close {
            reason: Some(reason.into()),
        }
    }

    /// Create a flow-control credit grant for `channel`.
    pub fn window(channel: ChannelId, credit: u32) -> Self {
        ControlMessage::Window { channel, credit }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
