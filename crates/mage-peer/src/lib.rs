//! Authenticated, multiplexed peer connections.
//!
//! [`Listener`] and [`connect`] run the handshake and hand back a
//! [`Connection`]. A connection is either used as one secure byte stream or
//! split into [`Channel`]s, which a propagation loop moves to and from the
//! socket:
//!
//! ```no_run
//! use mage_peer::{connect, PresharedKey, Seed};
//!
//! let psk = PresharedKey::from_hex(&std::env::var("MAGE_KEY")?)?;
//! let conn = connect("127.0.0.1:5555", &Seed::generate(), &psk)?;
//! let _loops = conn.spawn_loops()?;
//!
//! let channel = conn.get_channel(5)?;
//! channel.write_all(b"hoho!")?;
//! channel.flush()?;
//! conn.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod buffer;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod control;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod propagate;

pub use channel::{Channel, ChannelTable, UnknownChannelPolicy, CHANNEL_WINDOW};
pub use connection::{Connection, ConnectionConfig};
pub use connector::{connect, connect_with_config};
pub use control::ControlMessage;
pub use error::{PeerError, Result};
pub use handshake::{
    run_handshake, Finished, HandshakeConfig, HandshakePhase, HandshakeState, Hello,
};
pub use listener::Listener;
pub use mage_crypto::{PresharedKey, Role, Seed};
pub use propagate::LoopHandles;
