use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use mage_crypto::{derive_hello_nonce, CryptoError, PresharedKey, Role, Seed, SessionKeys, NONCE_LEN};
use mage_frame::{FrameError, FrameReader, FrameWriter, Opcode, CONTROL_CHANNEL};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PeerError, Result};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;

/// First handshake message, sent by both sides before either reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Protocol name. Must be `mage` by default.
    pub protocol: String,
    /// Protocol version string (`<major>.<minor>`).
    pub version: String,
    /// Sender's role; must be the opposite of the receiver's.
    pub role: String,
    /// Hex-encoded hello nonce derived from the sender's seed.
    pub nonce: String,
}

/// Second handshake message: proof of key possession over the hello transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finished {
    /// Hex-encoded HMAC tag.
    pub tag: String,
}

/// Configuration for the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Budget for the whole handshake.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version. Peers must share the major version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "mage".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 4 * 1024,
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing sent yet.
    Init,
    /// Hellos exchanged; deriving keys.
    KeyExchange,
    /// Confirmation tags exchanged; verifying the peer's.
    Verify,
    /// Both sides proved possession of the same keys.
    Authenticated,
    /// Terminal failure; the connection must be dropped.
    Failed,
}

/// Handshake state machine for one side of one connection.
///
/// Holds copies of the seed and pre-shared key, which are zeroized when the
/// state is dropped. Session keys leave the state only after authentication.
pub struct HandshakeState {
    role: Role,
    seed: Seed,
    psk: PresharedKey,
    config: HandshakeConfig,
    phase: HandshakePhase,
    keys: Option<SessionKeys>,
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("keys", &self.keys.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HandshakeState {
    pub fn new(role: Role, seed: &Seed, psk: &PresharedKey, config: HandshakeConfig) -> Self {
        Self {
            role,
            seed: seed.clone(),
            psk: psk.clone(),
            config,
            phase: HandshakePhase::Init,
            keys: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Drive the handshake to completion over `reader`/`writer`.
    ///
    /// Any failure moves the state to [`HandshakePhase::Failed`].
    pub fn run<R: Read, W: Write>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()> {
        if self.phase != HandshakePhase::Init {
            return Err(PeerError::HandshakeIo(format!(
                "handshake already in phase {:?}",
                self.phase
            )));
        }

        let result = self.exchange(reader, writer);
        match &result {
            Ok(()) => {
                self.phase = HandshakePhase::Authenticated;
                debug!(role = %self.role, "handshake authenticated");
            }
            Err(err) => {
                self.phase = HandshakePhase::Failed;
                self.keys = None;
                warn!(role = %self.role, error = %err, "handshake failed");
            }
        }
        result
    }

    /// Hand out the session keys once authenticated.
    pub fn into_session_keys(mut self) -> Result<SessionKeys> {
        match (self.phase, self.keys.take()) {
            (HandshakePhase::Authenticated, Some(keys)) => Ok(keys),
            (phase, _) => Err(PeerError::HandshakeIo(format!(
                "session keys unavailable in phase {phase:?}"
            ))),
        }
    }

    fn exchange<R: Read, W: Write>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()> {
        validate_protocol_name(&self.config.protocol_name)?;
        let local_major = parse_major(&self.config.protocol_version)?;
        let deadline = Instant::now() + self.config.timeout;

        let local_nonce = derive_hello_nonce(&self.seed).map_err(handshake_crypto_error)?;
        let hello = Hello {
            protocol: self.config.protocol_name.clone(),
            version: self.config.protocol_version.clone(),
            role: self.role.as_str().to_string(),
            nonce: hex::encode(local_nonce),
        };
        let local_hello = serde_json::to_vec(&hello)
            .map_err(|e| PeerError::HandshakeIo(format!("encode hello: {e}")))?;
        send_handshake(writer, &local_hello)?;

        let peer_hello = self.recv_payload(reader, deadline)?;
        let peer: Hello = serde_json::from_slice(&peer_hello)
            .map_err(|e| PeerError::HandshakeIo(format!("malformed hello: {e}")))?;
        let peer_nonce = self.check_hello(&peer, local_major)?;

        self.phase = HandshakePhase::KeyExchange;
        let (initiator_nonce, responder_nonce, transcript) = match self.role {
            Role::Initiator => (local_nonce, peer_nonce, [local_hello, peer_hello].concat()),
            Role::Responder => (peer_nonce, local_nonce, [peer_hello, local_hello].concat()),
        };
        let keys = SessionKeys::derive(&self.psk, &initiator_nonce, &responder_nonce)
            .map_err(handshake_crypto_error)?;

        self.phase = HandshakePhase::Verify;
        let tag = keys
            .finished_tag(self.role, &transcript)
            .map_err(handshake_crypto_error)?;
        let finished = serde_json::to_vec(&Finished {
            tag: hex::encode(tag),
        })
        .map_err(|e| PeerError::HandshakeIo(format!("encode finished: {e}")))?;
        send_handshake(writer, &finished)?;

        let payload = self.recv_payload(reader, deadline)?;
        let peer_finished: Finished = serde_json::from_slice(&payload)
            .map_err(|e| PeerError::HandshakeIo(format!("malformed finished: {e}")))?;
        let peer_tag = hex::decode(&peer_finished.tag)
            .map_err(|e| PeerError::HandshakeIo(format!("malformed finished tag: {e}")))?;

        keys.verify_finished_tag(self.role.peer(), &transcript, &peer_tag)
            .map_err(|err| match err {
                CryptoError::TagMismatch => PeerError::AuthenticationFailed,
                other => handshake_crypto_error(other),
            })?;

        self.keys = Some(keys);
        Ok(())
    }

    fn check_hello(&self, peer: &Hello, local_major: u16) -> Result<[u8; NONCE_LEN]> {
        validate_protocol_name(&peer.protocol)?;
        if peer.protocol != self.config.protocol_name {
            return Err(PeerError::HandshakeIo(format!(
                "unknown protocol '{}' (expected '{}')",
                peer.protocol, self.config.protocol_name
            )));
        }

        let peer_major = parse_major(&peer.version)?;
        if peer_major != local_major {
            return Err(PeerError::HandshakeIo(format!(
                "incompatible version '{}' (local '{}')",
                peer.version, self.config.protocol_version
            )));
        }

        let expected_role = self.role.peer();
        if peer.role != expected_role.as_str() {
            return Err(PeerError::HandshakeIo(format!(
                "peer announced role '{}' (expected '{}')",
                peer.role, expected_role
            )));
        }

        let nonce = hex::decode(&peer.nonce)
            .map_err(|e| PeerError::HandshakeIo(format!("malformed nonce: {e}")))?;
        nonce.as_slice().try_into().map_err(|_| {
            PeerError::HandshakeIo(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            ))
        })
    }

    fn recv_payload<R: Read>(
        &self,
        reader: &mut FrameReader<R>,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        loop {
            if Instant::now() >= deadline {
                return Err(PeerError::HandshakeIo(format!(
                    "timed out after {:?}",
                    self.config.timeout
                )));
            }

            match reader.read_frame() {
                Ok(frame) => {
                    if frame.channel != CONTROL_CHANNEL || frame.opcode != Opcode::Handshake {
                        return Err(PeerError::HandshakeIo(format!(
                            "expected handshake frame on channel {CONTROL_CHANNEL}, got {} frame on channel {}",
                            frame.opcode.as_str(),
                            frame.channel
                        )));
                    }
                    if frame.payload.len() > self.config.max_handshake_payload {
                        return Err(PeerError::HandshakeIo(format!(
                            "handshake payload too large: {} (max {})",
                            frame.payload.len(),
                            self.config.max_handshake_payload
                        )));
                    }
                    return Ok(frame.payload.to_vec());
                }
                Err(err) if err.is_timeout() => continue,
                Err(FrameError::ConnectionClosed) => {
                    return Err(PeerError::HandshakeIo(
                        "connection closed during handshake".to_string(),
                    ));
                }
                Err(err) => return Err(PeerError::HandshakeIo(err.to_string())),
            }
        }
    }
}

/// Run one side of the handshake and return the authenticated session keys.
pub fn run_handshake<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: Role,
    seed: &Seed,
    psk: &PresharedKey,
    config: &HandshakeConfig,
) -> Result<SessionKeys> {
    let mut state = HandshakeState::new(role, seed, psk, config.clone());
    state.run(reader, writer)?;
    state.into_session_keys()
}

fn send_handshake<W: Write>(writer: &mut FrameWriter<W>, payload: &[u8]) -> Result<()> {
    writer
        .send(CONTROL_CHANNEL, Opcode::Handshake, payload)
        .map_err(|e| PeerError::HandshakeIo(e.to_string()))
}

fn handshake_crypto_error(err: CryptoError) -> PeerError {
    PeerError::HandshakeIo(err.to_string())
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(PeerError::HandshakeIo(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn parse_major(version: &str) -> Result<u16> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(PeerError::HandshakeIo(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }

    let (major, minor) = version.split_once('.').ok_or_else(|| {
        PeerError::HandshakeIo(format!(
            "invalid version '{version}': expected '<major>.<minor>'"
        ))
    })?;

    let major = major.parse::<u16>().map_err(|_| {
        PeerError::HandshakeIo(format!("invalid version '{version}': non-numeric major"))
    })?;
    minor.parse::<u16>().map_err(|_| {
        PeerError::HandshakeIo(format!("invalid version '{version}': non-numeric minor"))
    })?;

    Ok(major)
}
