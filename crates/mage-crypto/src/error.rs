/// Errors from key handling, derivation and the sealed record layer.
///
/// Messages never include key material.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Raw key bytes had the wrong length.
    #[error("invalid key length ({actual} bytes, expected {expected})")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Hex-encoded key could not be decoded.
    #[error("invalid hex key: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// HKDF refused the requested output length.
    #[error("key derivation failed")]
    Kdf,

    /// The peer's handshake confirmation tag did not verify.
    #[error("handshake confirmation tag mismatch")]
    TagMismatch,

    /// Sealing a record failed.
    #[error("record seal failed")]
    SealFailed,

    /// A received record failed authentication.
    #[error("record authentication failed")]
    OpenFailed,

    /// A record header announced a length outside the allowed range.
    #[error("record length out of range ({size} bytes, max {max})")]
    RecordLength { size: usize, max: usize },

    /// The per-direction record counter would wrap.
    #[error("record counter exhausted")]
    CounterExhausted,
}

impl CryptoError {
    /// Recover a `CryptoError` carried inside an `io::Error` from the record layer.
    pub fn from_io(err: &std::io::Error) -> Option<&CryptoError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<CryptoError>())
    }

    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
