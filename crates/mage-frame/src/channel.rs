//! Channel ids.
//!
//! Every id in `0..=255` is an application channel. Channel 0 additionally
//! carries connection-level frames (handshake and control opcodes); the
//! opcode, not the id, tells them apart from channel-0 data.

/// A 1-byte channel identifier.
pub type ChannelId = u8;

/// Channel used for handshake and control frames.
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Returns a human-readable label for a channel id.
pub fn channel_name(id: ChannelId) -> String {
    format!("ch{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed() {
        assert_eq!(channel_name(CONTROL_CHANNEL), "ch0");
        assert_eq!(channel_name(255), "ch255");
    }
}
