//! Sealed record layer for the post-handshake byte stream.
//!
//! Wire format per record:
//! ```text
//! ┌────────────────┬──────────────────────────────────┐
//! │ Length (4B LE) │ ChaCha20-Poly1305 ciphertext+tag │
//! └────────────────┴──────────────────────────────────┘
//! ```
//! The nonce is four zero bytes followed by a little-endian record counter.
//! Each direction has its own key and counter, so nonces never repeat under
//! one key. The length header is bound as associated data.

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::keys::KEY_LEN;

/// Largest plaintext carried by one record.
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;
/// Poly1305 tag length.
pub const AEAD_TAG_LEN: usize = 16;
/// Record length prefix.
pub const RECORD_HEADER_LEN: usize = 4;

const MAX_RECORD_BODY: usize = MAX_RECORD_PLAINTEXT + AEAD_TAG_LEN;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// One direction's key and record counter.
struct RecordKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    counter: u64,
}

impl RecordKey {
    fn new(key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { key, counter: 0 }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        let counter = self.counter;
        let Some(next) = counter.checked_add(1) else {
            warn!("record counter exhausted; refusing to reuse a nonce");
            return Err(CryptoError::CounterExhausted);
        };
        self.counter = next;

        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        Ok(nonce)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    fn seal_into(&mut self, plaintext: &[u8], dst: &mut BytesMut) -> Result<()> {
        let nonce = self.next_nonce()?;
        let header = ((plaintext.len() + AEAD_TAG_LEN) as u32).to_le_bytes();
        let sealed = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;

        dst.reserve(RECORD_HEADER_LEN + sealed.len());
        dst.put_slice(&header);
        dst.put_slice(&sealed);
        Ok(())
    }

    fn open(&mut self, header: &[u8; RECORD_HEADER_LEN], body: &[u8]) -> Result<Vec<u8>> {
        let record = self.counter;
        let nonce = self.next_nonce()?;
        self.cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: body,
                    aad: header,
                },
            )
            .map_err(|_| {
                warn!(record, len = body.len(), "sealed record failed authentication");
                CryptoError::OpenFailed
            })
    }
}

/// Seals everything written to it into records on the inner stream.
///
/// Each `write` call is sealed in full (split into records of at most
/// [`MAX_RECORD_PLAINTEXT`]) and handed to the inner writer in one `write_all`.
pub struct SealedWriter<W> {
    inner: W,
    key: RecordKey,
    out: BytesMut,
}

impl<W: Write> SealedWriter<W> {
    pub fn new(inner: W, key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self {
            inner,
            key: RecordKey::new(key),
            out: BytesMut::new(),
        }
    }

    /// Records sealed so far.
    pub fn records_sealed(&self) -> u64 {
        self.key.counter
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for SealedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.out.clear();
        for chunk in buf.chunks(MAX_RECORD_PLAINTEXT) {
            self.key
                .seal_into(chunk, &mut self.out)
                .map_err(CryptoError::into_io)?;
        }
        self.inner.write_all(&self.out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W> std::fmt::Debug for SealedWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedWriter")
            .field("records_sealed", &self.key.counter)
            .finish_non_exhaustive()
    }
}

/// Opens records from the inner stream and yields their plaintext.
///
/// A read timeout on the inner stream (`WouldBlock`/`TimedOut`) is passed
/// through with any partial record kept buffered. Authentication failures
/// surface as `InvalidData` errors carrying a [`CryptoError`].
pub struct SealedReader<R> {
    inner: R,
    key: RecordKey,
    sealed: BytesMut,
    plain: BytesMut,
}

impl<R: Read> SealedReader<R> {
    pub fn new(inner: R, key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self::with_buffered(inner, key, BytesMut::new())
    }

    /// Start from sealed bytes already read off `inner`.
    pub fn with_buffered(inner: R, key: Zeroizing<[u8; KEY_LEN]>, buffered: BytesMut) -> Self {
        Self {
            inner,
            key: RecordKey::new(key),
            sealed: buffered,
            plain: BytesMut::new(),
        }
    }

    /// Records opened so far.
    pub fn records_opened(&self) -> u64 {
        self.key.counter
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Try to open one complete record from the sealed buffer.
    fn open_buffered(&mut self) -> std::io::Result<bool> {
        if self.sealed.len() < RECORD_HEADER_LEN {
            return Ok(false);
        }

        let mut header = [0u8; RECORD_HEADER_LEN];
        header.copy_from_slice(&self.sealed[..RECORD_HEADER_LEN]);
        let body_len = u32::from_le_bytes(header) as usize;
        if !(AEAD_TAG_LEN..=MAX_RECORD_BODY).contains(&body_len) {
            warn!(len = body_len, max = MAX_RECORD_BODY, "sealed record length out of range");
            return Err(CryptoError::RecordLength {
                size: body_len,
                max: MAX_RECORD_BODY,
            }
            .into_io());
        }

        if self.sealed.len() < RECORD_HEADER_LEN + body_len {
            return Ok(false);
        }

        self.sealed.advance(RECORD_HEADER_LEN);
        let body = self.sealed.split_to(body_len);
        let plaintext = self.key.open(&header, &body).map_err(CryptoError::into_io)?;
        self.plain.extend_from_slice(&plaintext);
        Ok(true)
    }
}

impl<R: Read> Read for SealedReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        while self.plain.is_empty() {
            if self.open_buffered()? {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            if read == 0 {
                if self.sealed.is_empty() {
                    return Ok(0);
                }
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside a sealed record",
                ));
            }
            self.sealed.extend_from_slice(&chunk[..read]);
        }

        let n = self.plain.len().min(out.len());
        out[..n].copy_from_slice(&self.plain.split_to(n));
        Ok(n)
    }
}

impl<R> std::fmt::Debug for SealedReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedReader")
            .field("records_opened", &self.key.counter)
            .field("buffered", &self.sealed.len())
            .finish_non_exhaustive()
    }
}
