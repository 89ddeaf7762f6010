//! Secure multiplexed transport over TCP.
//!
//! mage authenticates both ends of a TCP connection with a pre-shared key,
//! encrypts everything after the handshake, and splits the connection into up
//! to 256 independent byte-stream channels.
//!
//! # Crate Structure
//!
//! - [`transport`]: raw TCP listener, dialer and stream
//! - [`frame`]: length-prefixed frames with 1-byte channel ids
//! - [`crypto`]: key types, key derivation and the sealed record layer
//! - [`peer`]: handshake, connections, channels and propagation loops
//! - [`service`]: handle-based front end owning all of the above

pub mod service;

/// Re-export transport types.
pub mod transport {
    pub use mage_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use mage_frame::*;
}

/// Re-export crypto types.
pub mod crypto {
    pub use mage_crypto::*;
}

/// Re-export peer types.
pub mod peer {
    pub use mage_peer::*;
}

pub use mage_peer::{
    connect, Channel, Connection, Listener, PeerError, PresharedKey, Result, Role, Seed,
};
pub use service::{ChannelHandle, ConnectionHandle, ListenerHandle, Service};
