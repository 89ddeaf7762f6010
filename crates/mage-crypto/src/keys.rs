use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, Result};

/// Length of seeds and pre-shared keys in bytes.
pub const KEY_LEN: usize = 32;

/// Per-connection randomness mixed into the handshake.
///
/// Production callers use [`Seed::generate`]; fixed seeds are for fixtures.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; KEY_LEN]);

impl Seed {
    /// Fill a seed from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(fixed_len(bytes)?))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Seed([redacted])")
    }
}

/// Long-lived secret shared out of band by both peers.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_LEN]);

impl PresharedKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(fixed_len(bytes)?))
    }

    /// Parse a 64-character hex string (surrounding whitespace ignored).
    pub fn from_hex(text: &str) -> Result<Self> {
        let decoded = Zeroizing::new(hex::decode(text.trim())?);
        Self::from_slice(&decoded)
    }

    /// Lowercase hex encoding, for key files and CLI output.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PresharedKey([redacted])")
    }
}

fn fixed_len(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(Seed::generate().as_bytes(), Seed::generate().as_bytes());
        assert_ne!(
            PresharedKey::generate().as_bytes(),
            PresharedKey::generate().as_bytes()
        );
    }

    #[test]
    fn hex_roundtrip() {
        let key = PresharedKey::from_bytes([0xA5; KEY_LEN]);
        let text = key.to_hex();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("a5a5"));

        let parsed = PresharedKey::from_hex(&format!("  {}\n", text.as_str())).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn rejects_bad_hex_and_lengths() {
        assert!(matches!(
            PresharedKey::from_hex("zz"),
            Err(CryptoError::InvalidHex(_))
        ));
        assert!(matches!(
            PresharedKey::from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 2
            })
        ));
        assert!(Seed::from_slice(&[0u8; 31]).is_err());
        assert!(Seed::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn debug_is_redacted() {
        let key = PresharedKey::from_bytes([0x42; KEY_LEN]);
        let seed = Seed::from_bytes([0x42; KEY_LEN]);
        let rendered = format!("{key:?} {seed:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("42"));
        assert!(!rendered.contains("66"));
    }
}
