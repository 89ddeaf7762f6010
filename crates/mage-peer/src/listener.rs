use std::net::SocketAddr;

use mage_crypto::{PresharedKey, Role, Seed};
use mage_transport::{TcpTransport, TransportError};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{PeerError, Result};
use crate::handshake::HandshakeConfig;

/// Listens for and authenticates incoming connections.
pub struct Listener {
    transport: TcpTransport,
    handshake_config: HandshakeConfig,
    connection_config: ConnectionConfig,
}

impl Listener {
    /// Bind to `addr` (`host:port`; port 0 picks a free port).
    pub fn bind(addr: &str) -> Result<Self> {
        let transport = TcpTransport::bind(addr).map_err(PeerError::Bind)?;
        Ok(Self {
            transport,
            handshake_config: HandshakeConfig::default(),
            connection_config: ConnectionConfig::default(),
        })
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Override the runtime config given to accepted connections.
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Accept the next peer and run the handshake as responder.
    ///
    /// A failed handshake is returned to the caller; the listener stays usable.
    pub fn accept(&self, seed: &Seed, psk: &PresharedKey) -> Result<Connection> {
        let stream = match self.transport.accept() {
            Ok(stream) => stream,
            Err(TransportError::Shutdown) => return Err(PeerError::ListenerClosed),
            Err(TransportError::Accept(err)) if self.transport.is_stopped() => {
                debug!(error = %err, "accept interrupted by stop");
                return Err(PeerError::ListenerClosed);
            }
            Err(TransportError::Accept(err)) | Err(TransportError::Io(err)) => {
                return Err(PeerError::Io(err))
            }
            Err(other) => return Err(PeerError::HandshakeIo(other.to_string())),
        };

        Connection::establish(
            stream,
            Role::Responder,
            seed,
            psk,
            &self.handshake_config,
            self.connection_config.clone(),
        )
        .inspect_err(|err| warn!(error = %err, "inbound handshake failed"))
    }

    /// Stop listening; a blocked [`Listener::accept`] returns
    /// [`PeerError::ListenerClosed`]. Idempotent.
    pub fn stop(&self) {
        self.transport.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.transport.is_stopped()
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::connector::connect;

    fn key(byte: u8) -> PresharedKey {
        PresharedKey::from_bytes([byte; 32])
    }

    #[test]
    fn accept_returns_authenticated_connection() {
        let listener = Listener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().to_string();

        let server = thread::spawn(move || {
            let conn = listener
                .accept(&Seed::generate(), &key(1))
                .expect("listener should accept");
            assert_eq!(conn.role(), Role::Responder);
            let mut buf = [0u8; 5];
            let n = conn.read(&mut buf).expect("read should succeed");
            assert_eq!(&buf[..n], b"Hello");
        });

        let client = connect(&addr, &Seed::generate(), &key(1)).expect("client should connect");
        assert_eq!(client.role(), Role::Initiator);
        client.write(b"Hello").expect("write should succeed");
        server.join().expect("server thread should finish");
    }

    #[test]
    fn accepts_multiple_sequential_connections() {
        let listener = Listener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().to_string();

        let server = thread::spawn(move || {
            let first = listener.accept(&Seed::generate(), &key(2)).unwrap();
            let second = listener.accept(&Seed::generate(), &key(2)).unwrap();
            assert!(second.id() > first.id());
        });

        let _c1 = connect(&addr, &Seed::generate(), &key(2)).expect("first client should connect");
        let _c2 = connect(&addr, &Seed::generate(), &key(2)).expect("second client should connect");
        server.join().expect("server thread should finish");
    }

    #[test]
    fn wrong_key_fails_and_listener_survives() {
        let listener = Listener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().to_string();

        let server = thread::spawn(move || {
            let first = listener.accept(&Seed::generate(), &key(3));
            assert!(matches!(first, Err(PeerError::AuthenticationFailed)));
            listener.accept(&Seed::generate(), &key(3)).is_ok()
        });

        let bad = connect(&addr, &Seed::generate(), &key(4));
        assert!(matches!(bad, Err(PeerError::AuthenticationFailed)));
        let good = connect(&addr, &Seed::generate(), &key(3));
        assert!(good.is_ok());
        assert!(server.join().unwrap());
    }

    #[test]
    fn stop_wakes_blocked_accept() {
        let listener = Arc::new(Listener::bind("127.0.0.1:0").expect("listener should bind"));

        let blocked = {
            let listener = Arc::clone(&listener);
            thread::spawn(move || listener.accept(&Seed::generate(), &key(5)))
        };
        thread::sleep(Duration::from_millis(50));
        listener.stop();
        listener.stop();

        let result = blocked.join().unwrap();
        assert!(matches!(result, Err(PeerError::ListenerClosed)));
        assert!(listener.is_stopped());
        assert!(matches!(
            listener.accept(&Seed::generate(), &key(5)),
            Err(PeerError::ListenerClosed)
        ));
    }

    #[test]
    fn bind_failure_is_bind_error() {
        let first = Listener::bind("127.0.0.1:0").unwrap();
        let taken = first.local_addr().to_string();
        assert!(matches!(Listener::bind(&taken), Err(PeerError::Bind(_))));
        assert!(matches!(Listener::bind("not-an-address"), Err(PeerError::Bind(_))));
    }
}
