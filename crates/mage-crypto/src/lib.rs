//! Cryptographic building blocks for mage.
//!
//! - [`Seed`] and [`PresharedKey`]: 32-byte secrets, zeroized on drop, never printed
//! - [`kdf`]: hello nonces, the session key schedule and confirmation tags
//! - [`record`]: the ChaCha20-Poly1305 sealed record layer used after the handshake
//!
//! Primitives are HKDF-SHA256, HMAC-SHA256 and ChaCha20-Poly1305.

pub mod error;
pub mod kdf;
pub mod keys;
pub mod record;

pub use error::{CryptoError, Result};
pub use kdf::{derive_hello_nonce, hkdf_sha256, Role, SessionKeys, NONCE_LEN, TAG_LEN};
pub use keys::{PresharedKey, Seed, KEY_LEN};
pub use record::{SealedReader, SealedWriter, MAX_RECORD_PLAINTEXT};
