use mage_crypto::CryptoError;
use mage_frame::{ChannelId, FrameError};
use mage_transport::TransportError;

/// Errors that can occur in peer operations.
///
/// Handshake and framing errors are never retried. Any error returned from a
/// propagation loop has already closed the connection.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Binding the listening socket failed.
    #[error("bind failed: {0}")]
    Bind(#[source] TransportError),

    /// Dialing the remote address failed.
    #[error("dial failed: {0}")]
    Dial(#[source] TransportError),

    /// The handshake broke down before authentication (malformed message,
    /// role or version mismatch, timeout, socket error).
    #[error("handshake failed: {0}")]
    HandshakeIo(String),

    /// The peer does not hold the same pre-shared key.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A post-handshake frame could not be decoded or violates the protocol.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An inbound frame named a channel that is not registered.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The connection was torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// Socket failure after the handshake.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The listener was stopped.
    #[error("listener closed")]
    ListenerClosed,

    /// Direct byte-stream and multiplexed use were mixed on one connection.
    #[error("connection is in {active} mode, cannot use {requested} mode")]
    ModeConflict {
        requested: &'static str,
        active: &'static str,
    },

    /// A service handle is stale or was never issued.
    #[error("invalid handle")]
    InvalidHandle,

    /// A sealed record failed to seal or authenticate.
    #[error("record layer failure: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        if CryptoError::from_io(&err).is_some() {
            if let Some(inner) = err.into_inner() {
                if let Ok(crypto) = inner.downcast::<CryptoError>() {
                    return PeerError::Crypto(*crypto);
                }
            }
            return PeerError::Crypto(CryptoError::OpenFailed);
        }
        PeerError::Io(err)
    }
}

impl From<FrameError> for PeerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => PeerError::ConnectionClosed,
            FrameError::Io(io) => io.into(),
            malformed => PeerError::MalformedFrame(malformed.to_string()),
        }
    }
}

impl PeerError {
    /// True when the error is a local or remote teardown rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(self, PeerError::ConnectionClosed | PeerError::ListenerClosed)
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
