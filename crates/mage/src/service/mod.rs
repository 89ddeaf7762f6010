//! Handle-based front end over listeners, connections and channels.
//!
//! [`Service`] owns every object it creates and hands out small `Copy`
//! handles instead of references. Removing an object bumps its slot
//! generation, so a handle kept past [`Service::close_connection`] or
//! [`Service::stop`] is rejected rather than reaching a different object.

mod handle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mage_frame::ChannelId;
use mage_peer::{
    connect_with_config, Channel, Connection, ConnectionConfig, HandshakeConfig, Listener,
    PeerError, PresharedKey, Result, Seed,
};
use tracing::{debug, info};

pub use handle::{Handle, HandleTable};

pub type ListenerHandle = Handle<Listener>;
pub type ConnectionHandle = Handle<Connection>;
pub type ChannelHandle = Handle<Channel>;

#[derive(Default)]
struct Registry {
    listeners: HandleTable<Listener, Arc<Listener>>,
    connections: HandleTable<Connection>,
    channels: HandleTable<Channel, (ConnectionHandle, Channel)>,
}

/// Owner of all transport objects created through it.
///
/// Stale or foreign listener and channel handles fail with
/// [`PeerError::InvalidHandle`]; stale connection handles fail with
/// [`PeerError::ConnectionClosed`], the same error a closed connection gives.
impl Registry {
    /// Drop connections closed by the peer or by a fatal error, along with
    /// their channel handles. A connection with unread inbound bytes stays
    /// until they are read.
    fn reap(&mut self) {
        let closed: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_closed())
            .map(|(handle, _)| handle)
            .collect();

        for handle in closed {
            let undrained = self
                .channels
                .iter()
                .any(|(_, (owner, channel))| *owner == handle && channel.inbound_len() > 0);
            if undrained {
                continue;
            }
            self.connections.remove(handle);
            self.channels.remove_where(|(owner, _)| *owner == handle);
            debug!(handle = ?handle, "closed connection reaped");
        }
    }
}

pub struct Service {
    registry: Mutex<Registry>,
    running: AtomicBool,
    handshake_config: HandshakeConfig,
    connection_config: ConnectionConfig,
}

impl Service {
    /// Start a service with default configuration.
    pub fn start() -> Self {
        Self::start_with_config(HandshakeConfig::default(), ConnectionConfig::default())
    }

    /// Start a service whose listeners and dials use the given configuration.
    pub fn start_with_config(
        handshake_config: HandshakeConfig,
        connection_config: ConnectionConfig,
    ) -> Self {
        debug!("service started");
        Self {
            registry: Mutex::new(Registry::default()),
            running: AtomicBool::new(true),
            handshake_config,
            connection_config,
        }
    }

    /// Stop every listener, close every connection and invalidate all
    /// handles. Idempotent; later calls to `listen`, `accept` and `connect`
    /// fail.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let (listeners, connections) = {
            let mut registry = self.registry();
            registry.channels.drain();
            (registry.listeners.drain(), registry.connections.drain())
        };

        for listener in &listeners {
            listener.stop();
        }
        for connection in &connections {
            connection.close();
        }
        info!(
            listeners = listeners.len(),
            connections = connections.len(),
            "service stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind a listener on `addr`.
    pub fn listen(&self, addr: &str) -> Result<ListenerHandle> {
        if !self.is_running() {
            return Err(PeerError::ListenerClosed);
        }
        let listener = Listener::bind(addr)?
            .with_handshake_config(self.handshake_config.clone())
            .with_connection_config(self.connection_config.clone());

        let mut registry = self.registry();
        if !self.is_running() {
            listener.stop();
            return Err(PeerError::ListenerClosed);
        }
        Ok(registry.listeners.insert(Arc::new(listener)))
    }

    /// Address a listener is bound to.
    pub fn local_addr(&self, listener: ListenerHandle) -> Result<SocketAddr> {
        Ok(self.listener(listener)?.local_addr())
    }

    /// Accept and authenticate the next peer on `listener`.
    ///
    /// Blocks without holding any service lock, so other handles stay usable.
    pub fn accept(
        &self,
        listener: ListenerHandle,
        seed: &Seed,
        psk: &PresharedKey,
    ) -> Result<ConnectionHandle> {
        let listener = self.listener(listener)?;
        let connection = listener.accept(seed, psk)?;
        self.register(connection)
    }

    /// Stop a listener and invalidate its handle.
    pub fn stop_listener(&self, listener: ListenerHandle) -> Result<()> {
        let removed = self.registry().listeners.remove(listener);
        let listener = removed.ok_or(PeerError::InvalidHandle)?;
        listener.stop();
        Ok(())
    }

    /// Dial `addr` and authenticate as initiator.
    pub fn connect(
        &self,
        addr: &str,
        seed: &Seed,
        psk: &PresharedKey,
    ) -> Result<ConnectionHandle> {
        if !self.is_running() {
            return Err(PeerError::ConnectionClosed);
        }
        let connection = connect_with_config(
            addr,
            seed,
            psk,
            &self.handshake_config,
            self.connection_config.clone(),
        )?;
        self.register(connection)
    }

    /// The connection behind a handle.
    pub fn connection(&self, connection: ConnectionHandle) -> Result<Connection> {
        self.registry()
            .connections
            .get(connection)
            .cloned()
            .ok_or(PeerError::ConnectionClosed)
    }

    /// Handle for channel `id` of `connection`, registering it on first use.
    ///
    /// Asking twice for the same channel returns the same handle.
    pub fn get_channel(
        &self,
        connection: ConnectionHandle,
        id: ChannelId,
    ) -> Result<ChannelHandle> {
        let mut registry = self.registry();
        let conn = registry
            .connections
            .get(connection)
            .cloned()
            .ok_or(PeerError::ConnectionClosed)?;

        let existing = registry
            .channels
            .iter()
            .find(|(_, (owner, channel))| *owner == connection && channel.id() == id)
            .map(|(handle, _)| handle);
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let channel = conn.get_channel(id)?;
        Ok(registry.channels.insert((connection, channel)))
    }

    /// Read from the whole-connection byte stream.
    pub fn connection_read(&self, connection: ConnectionHandle, buf: &mut [u8]) -> Result<usize> {
        self.connection(connection)?.read(buf)
    }

    /// Write to the whole-connection byte stream.
    pub fn connection_write(&self, connection: ConnectionHandle, buf: &[u8]) -> Result<usize> {
        self.connection(connection)?.write(buf)
    }

    /// Read from one channel, blocking until bytes arrive.
    pub fn channel_read(&self, channel: ChannelHandle, buf: &mut [u8]) -> Result<usize> {
        self.channel(channel)?.read(buf)
    }

    /// Queue bytes on one channel; returns how many were accepted.
    pub fn channel_write(&self, channel: ChannelHandle, buf: &[u8]) -> Result<usize> {
        self.channel(channel)?.write(buf)
    }

    /// Block until the channel's queued outbound bytes are handed to the loop.
    pub fn channel_flush(&self, channel: ChannelHandle) -> Result<()> {
        self.channel(channel)?.flush()
    }

    /// Drive both directions of `connection` on the calling thread until it closes.
    pub fn run_propagation_loop(&self, connection: ConnectionHandle) -> Result<()> {
        self.connection(connection)?.run_propagation_loop()
    }

    /// Drive socket-to-channel delivery on the calling thread.
    pub fn run_inbound_loop(&self, connection: ConnectionHandle) -> Result<()> {
        self.connection(connection)?.run_inbound_loop()
    }

    /// Drive channel-to-socket delivery on the calling thread.
    pub fn run_outbound_loop(&self, connection: ConnectionHandle) -> Result<()> {
        self.connection(connection)?.run_outbound_loop()
    }

    /// Close a connection and invalidate its handle and all of its channel
    /// handles. Closing an already-removed handle is a no-op.
    pub fn close_connection(&self, connection: ConnectionHandle) -> Result<()> {
        let removed = {
            let mut registry = self.registry();
            let removed = registry.connections.remove(connection);
            if removed.is_some() {
                registry
                    .channels
                    .remove_where(|(owner, _)| *owner == connection);
            }
            removed
        };

        if let Some(connection) = removed {
            connection.close();
        }
        Ok(())
    }

    /// Number of live connections. Connections that closed on their own
    /// are dropped from the count once their channels are drained.
    pub fn connection_count(&self) -> usize {
        let mut registry = self.registry();
        registry.reap();
        registry.connections.len()
    }

    fn register(&self, connection: Connection) -> Result<ConnectionHandle> {
        let mut registry = self.registry();
        if !self.is_running() {
            drop(registry);
            connection.close();
            return Err(PeerError::ConnectionClosed);
        }
        registry.reap();
        let handle = registry.connections.insert(connection);
        debug!(handle = ?handle, "connection registered");
        Ok(handle)
    }

    fn listener(&self, listener: ListenerHandle) -> Result<Arc<Listener>> {
        self.registry()
            .listeners
            .get(listener)
            .cloned()
            .ok_or(PeerError::InvalidHandle)
    }

    fn channel(&self, channel: ChannelHandle) -> Result<Channel> {
        self.registry()
            .channels
            .get(channel)
            .map(|(_, channel)| channel.clone())
            .ok_or(PeerError::InvalidHandle)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("Service")
            .field("running", &self.is_running())
            .field("listeners", &registry.listeners.len())
            .field("connections", &registry.connections.len())
            .field("channels", &registry.channels.len())
            .finish()
    }
}
