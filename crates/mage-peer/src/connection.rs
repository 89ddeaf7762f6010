use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use mage_crypto::{PresharedKey, Role, SealedReader, SealedWriter, Seed};
use mage_frame::{
    ChannelId, FrameConfig, FrameReader, FrameWriter, Opcode, CONTROL_CHANNEL,
    DEFAULT_MAX_PAYLOAD,
};
use mage_transport::NetStream;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelTable, OutboundSignal, UnknownChannelPolicy};
use crate::control::ControlMessage;
use crate::error::{PeerError, Result};
use crate::handshake::{run_handshake, HandshakeConfig};

pub(crate) type SecureReader = FrameReader<SealedReader<NetStream>>;
pub(crate) type SecureWriter = FrameWriter<SealedWriter<NetStream>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const MODE_UNSET: u8 = 0;
pub(crate) const MODE_DIRECT: u8 = 1;
pub(crate) const MODE_MULTIPLEXED: u8 = 2;

/// Runtime behavior of an authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of each channel's outbound buffer, in bytes. Inbound
    /// buffering is bounded by [`CHANNEL_WINDOW`](crate::CHANNEL_WINDOW).
    pub channel_buffer_capacity: usize,
    /// Largest data-frame payload the outbound scheduler emits.
    pub max_frame_payload: usize,
    /// Largest inbound frame payload accepted.
    pub max_inbound_payload: usize,
    /// How long the combined loop waits for inbound data per iteration.
    pub poll_interval: Duration,
    /// Inbound frames for unregistered channels.
    pub unknown_channel_policy: UnknownChannelPolicy,
    /// How long `close` waits for an in-flight write before cutting the socket.
    pub close_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_buffer_capacity: 64 * 1024,
            max_frame_payload: 16 * 1024,
            max_inbound_payload: DEFAULT_MAX_PAYLOAD,
            poll_interval: Duration::from_millis(20),
            unknown_channel_policy: UnknownChannelPolicy::AutoRegister,
            close_grace: Duration::from_millis(500),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) role: Role,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) config: ConnectionConfig,
    pub(crate) reader: Mutex<Option<SecureReader>>,
    pub(crate) writer: Mutex<Option<SecureWriter>>,
    pub(crate) channels: ChannelTable,
    pub(crate) outbound: Arc<OutboundSignal>,
    pub(crate) socket: NetStream,
    closed: AtomicBool,
    mode: AtomicU8,
}

/// One authenticated session with a remote peer.
///
/// A `Connection` only exists after a successful handshake. Clones share the
/// same session; closing any clone closes all of them. The connection is used
/// either as one secure byte stream ([`Connection::read`]/[`Connection::write`])
/// or multiplexed into channels ([`Connection::get_channel`] plus a
/// propagation loop), never both.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    /// Run the handshake over a fresh socket and wrap it in the record layer.
    pub(crate) fn establish(
        stream: NetStream,
        role: Role,
        seed: &Seed,
        psk: &PresharedKey,
        handshake_config: &HandshakeConfig,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr().ok();
        let socket = stream.try_clone().map_err(handshake_transport_error)?;
        let reader_stream = stream.try_clone().map_err(handshake_transport_error)?;

        let frame_config = FrameConfig {
            max_payload_size: handshake_config.max_handshake_payload,
            read_timeout: Some(handshake_config.timeout),
            write_timeout: Some(handshake_config.timeout),
        };
        let mut reader = FrameReader::with_config_net(reader_stream, frame_config.clone())
            .map_err(|e| PeerError::HandshakeIo(e.to_string()))?;
        let mut writer = FrameWriter::with_config_net(stream, frame_config)
            .map_err(|e| PeerError::HandshakeIo(e.to_string()))?;

        let keys = match run_handshake(&mut reader, &mut writer, role, seed, psk, handshake_config)
        {
            Ok(keys) => keys,
            Err(err) => {
                let _ = socket.shutdown();
                return Err(err);
            }
        };

        let (reader_stream, read_ahead) = reader.into_parts();
        let writer_stream = writer.into_inner();
        socket.set_read_timeout(None).map_err(handshake_transport_error)?;
        socket.set_write_timeout(None).map_err(handshake_transport_error)?;

        let (seal_key, open_key) = keys.into_traffic_keys(role);
        let runtime_frames = FrameConfig {
            max_payload_size: config.max_inbound_payload,
            ..FrameConfig::default()
        };
        let reader = FrameReader::with_config(
            SealedReader::with_buffered(reader_stream, open_key, read_ahead),
            runtime_frames.clone(),
        );
        let writer = FrameWriter::with_config(SealedWriter::new(writer_stream, seal_key), runtime_frames);

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let outbound = Arc::new(OutboundSignal::new());
        let channels = ChannelTable::new(
            config.channel_buffer_capacity,
            config.unknown_channel_policy,
            Arc::clone(&outbound),
        );

        info!(
            connection = id,
            role = %role,
            peer = ?peer_addr,
            "connection authenticated"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                role,
                peer_addr,
                config,
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                channels,
                outbound,
                socket,
                closed: AtomicBool::new(false),
                mode: AtomicU8::new(MODE_UNSET),
            }),
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Which side of the handshake this end played.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Get (registering on first use) the channel with `id`.
    pub fn get_channel(&self, id: ChannelId) -> Result<Channel> {
        self.ensure_open()?;
        self.claim_mode(MODE_MULTIPLEXED)?;
        self.shared.channels.get_or_create(id)
    }

    /// Look up an already registered channel without registering a new one.
    ///
    /// Unlike [`Connection::get_channel`] this also works after close, so
    /// bytes that arrived before the close can still be drained.
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.shared.channels.get(id)
    }

    /// Ids of all registered channels, in registration order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.shared.channels.ids()
    }

    /// Read from the whole-connection secure byte stream.
    ///
    /// Blocks until data arrives. A remote hangup closes the connection and
    /// reports [`PeerError::ConnectionClosed`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        self.claim_mode(MODE_DIRECT)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let result = {
            let mut guard = lock(&self.shared.reader);
            let reader = guard.as_mut().ok_or(PeerError::ConnectionClosed)?;
            reader.read_raw(buf)
        };

        let outcome = match result {
            Ok(0) => {
                self.close_quietly();
                Err(PeerError::ConnectionClosed)
            }
            Ok(n) => Ok(n),
            Err(_) if self.is_closed() => Err(PeerError::ConnectionClosed),
            Err(err) => {
                let err = PeerError::from(err);
                self.fail(&err);
                Err(err)
            }
        };
        self.release_halves();
        outcome
    }

    /// Write all of `buf` to the whole-connection secure byte stream.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.claim_mode(MODE_DIRECT)?;

        let result = {
            let mut guard = lock(&self.shared.writer);
            let writer = guard.as_mut().ok_or(PeerError::ConnectionClosed)?;
            writer.write_raw(buf)
        };

        let outcome = match result {
            Ok(()) => Ok(buf.len()),
            Err(_) if self.is_closed() => Err(PeerError::ConnectionClosed),
            Err(err) => {
                let err = PeerError::from(err);
                self.fail(&err);
                Err(err)
            }
        };
        self.release_halves();
        outcome
    }

    /// Close the connection. Idempotent.
    ///
    /// Wakes every blocked channel and connection operation, stops the
    /// propagation loops and drops the session keys. In multiplexed mode the
    /// peer is sent a best-effort close notice first.
    pub fn close(&self) {
        self.shutdown(true);
    }

    /// Close without notifying the peer (remote hangup or fatal error).
    pub(crate) fn close_quietly(&self) {
        self.shutdown(false);
    }

    pub(crate) fn fail(&self, err: &PeerError) {
        if !self.is_closed() {
            warn!(connection = self.shared.id, error = %err, "closing connection after fatal error");
        }
        self.close_quietly();
    }

    fn shutdown(&self, notify_peer: bool) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.channels.close_all();

        // A writer stuck on a peer that stopped reading keeps the lock; give
        // it `close_grace` to finish, then cut the socket out from under it.
        match lock_within(&self.shared.writer, self.shared.config.close_grace) {
            Some(mut writer) => {
                if notify_peer && self.shared.mode.load(Ordering::SeqCst) != MODE_DIRECT {
                    let grace = Some(self.shared.config.close_grace);
                    if let Err(err) = self.shared.socket.set_write_timeout(grace) {
                        debug!(connection = self.shared.id, error = %err, "write timeout not set");
                    }
                    if let Some(writer) = writer.as_mut() {
                        if let Err(err) = send_close_notice(writer) {
                            debug!(connection = self.shared.id, error = %err, "close notice not sent");
                        }
                    }
                }
                writer.take();
            }
            None => {
                debug!(connection = self.shared.id, "writer busy, closing without notice");
            }
        }

        if let Err(err) = self.shared.socket.shutdown() {
            debug!(connection = self.shared.id, error = %err, "socket shutdown failed");
        }

        self.release_halves();
        info!(connection = self.shared.id, "connection closed");
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(PeerError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn claim_mode(&self, requested: u8) -> Result<()> {
        match self.shared.mode.compare_exchange(
            MODE_UNSET,
            requested,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(active) if active == requested => Ok(()),
            Err(active) => Err(PeerError::ModeConflict {
                requested: mode_name(requested),
                active: mode_name(active),
            }),
        }
    }

    /// Drop whichever socket halves nobody is using once closed, releasing
    /// their keys; called by close and by loops on exit.
    pub(crate) fn release_halves(&self) {
        if !self.is_closed() {
            return;
        }
        if let Ok(mut reader) = self.shared.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("peer_addr", &self.shared.peer_addr)
            .field("mode", &mode_name(self.shared.mode.load(Ordering::SeqCst)))
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_within<T>(mutex: &Mutex<T>, grace: Duration) -> Option<MutexGuard<'_, T>> {
    let deadline = Instant::now() + grace;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) if Instant::now() >= deadline => return None,
            Err(TryLockError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
        }
    }
}

fn send_close_notice(writer: &mut SecureWriter) -> Result<()> {
    let payload = ControlMessage::close()
        .to_bytes()
        .map_err(|e| PeerError::MalformedFrame(e.to_string()))?;
    writer.send(CONTROL_CHANNEL, Opcode::Control, &payload)?;
    Ok(())
}

fn handshake_transport_error(err: mage_transport::TransportError) -> PeerError {
    PeerError::HandshakeIo(err.to_string())
}

fn mode_name(mode: u8) -> &'static str {
    match mode {
        MODE_DIRECT => "direct",
        MODE_MULTIPLEXED => "multiplexed",
        _ => "unset",
    }
}
