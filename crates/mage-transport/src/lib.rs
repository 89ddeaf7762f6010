//! Raw network transport for mage.
//!
//! Provides a thin, blocking interface over TCP:
//! - [`TcpTransport`] binds, accepts and stops a listening socket
//! - [`NetStream`] is the connected, full-duplex byte stream
//!
//! This is the lowest layer of mage. It performs no cryptography and no
//! framing; everything else builds on top of the [`NetStream`] type.

pub mod error;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use tcp::TcpTransport;
pub use traits::NetStream;
