//! Handshake key derivation (HKDF-SHA256) and confirmation tags (HMAC-SHA256).

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::keys::{PresharedKey, Seed, KEY_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Length of hello nonces and confirmation tags.
pub const NONCE_LEN: usize = 32;
pub const TAG_LEN: usize = 32;

const HELLO_NONCE_INFO: &[u8] = b"mage/v1 hello nonce";
const SESSION_KEYS_INFO: &[u8] = b"mage/v1 session keys";
const INITIATOR_FINISHED: &[u8] = b"mage/v1 initiator finished";
const RESPONDER_FINISHED: &[u8] = b"mage/v1 responder finished";

/// Which end of the handshake a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The dialing side.
    Initiator,
    /// The accepting side.
    Responder,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }

    fn finished_label(self) -> &'static [u8] {
        match self {
            Role::Initiator => INITIATOR_FINISHED,
            Role::Responder => RESPONDER_FINISHED,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic HKDF-SHA256 (RFC 5869) into a caller-provided buffer.
pub fn hkdf_sha256(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], okm: &mut [u8]) -> Result<()> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, okm)
        .map_err(|_| CryptoError::Kdf)
}

/// Hello nonce sent in the clear: `HKDF(ikm = seed, info = "mage/v1 hello nonce")`.
pub fn derive_hello_nonce(seed: &Seed) -> Result<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    hkdf_sha256(seed.as_bytes(), None, HELLO_NONCE_INFO, &mut nonce)?;
    Ok(nonce)
}

/// Directional traffic keys plus the handshake confirmation key.
pub struct SessionKeys {
    initiator_to_responder: Zeroizing<[u8; KEY_LEN]>,
    responder_to_initiator: Zeroizing<[u8; KEY_LEN]>,
    confirm: Zeroizing<[u8; KEY_LEN]>,
}

impl SessionKeys {
    /// Derive 96 bytes from the pre-shared key salted with both hello nonces.
    pub fn derive(
        psk: &PresharedKey,
        initiator_nonce: &[u8; NONCE_LEN],
        responder_nonce: &[u8; NONCE_LEN],
    ) -> Result<Self> {
        let mut salt = [0u8; NONCE_LEN * 2];
        salt[..NONCE_LEN].copy_from_slice(initiator_nonce);
        salt[NONCE_LEN..].copy_from_slice(responder_nonce);

        let mut okm = Zeroizing::new([0u8; KEY_LEN * 3]);
        hkdf_sha256(psk.as_bytes(), Some(&salt), SESSION_KEYS_INFO, &mut okm[..])?;

        Ok(Self {
            initiator_to_responder: Zeroizing::new(split_key(&okm[..], 0)),
            responder_to_initiator: Zeroizing::new(split_key(&okm[..], 1)),
            confirm: Zeroizing::new(split_key(&okm[..], 2)),
        })
    }

    /// Tag this side sends to prove it holds the same key schedule.
    pub fn finished_tag(&self, role: Role, transcript: &[u8]) -> Result<[u8; TAG_LEN]> {
        let digest = self.finished_mac(role, transcript)?.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest);
        Ok(tag)
    }

    /// Check the peer's tag in constant time.
    pub fn verify_finished_tag(&self, peer: Role, transcript: &[u8], tag: &[u8]) -> Result<()> {
        self.finished_mac(peer, transcript)?
            .verify_slice(tag)
            .map_err(|_| CryptoError::TagMismatch)
    }

    /// Split into `(sealing, opening)` keys for `role`; the confirmation key is dropped.
    pub fn into_traffic_keys(
        self,
        role: Role,
    ) -> (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>) {
        let SessionKeys {
            initiator_to_responder,
            responder_to_initiator,
            ..
        } = self;
        match role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        }
    }

    fn finished_mac(&self, role: Role, transcript: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.confirm[..]).map_err(|_| CryptoError::Kdf)?;
        mac.update(role.finished_label());
        mac.update(transcript);
        Ok(mac)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys([redacted])")
    }
}

fn split_key(okm: &[u8], index: usize) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&okm[index * KEY_LEN..(index + 1) * KEY_LEN]);
    key
}
