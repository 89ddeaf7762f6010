use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::NetStream;

/// TCP listening transport.
///
/// Provides bind/accept/stop over a TCP socket. Accepted streams are raw:
/// no handshake or framing has been performed on them yet.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    stopped: AtomicBool,
}

impl TcpTransport {
    /// Bind and listen on `addr` (e.g. `127.0.0.1:5555`, port 0 picks a free port).
    pub fn bind(addr: &str) -> Result<Self> {
        let resolved = resolve(addr)?;

        let listener = TcpListener::bind(&resolved[..]).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        info!(%local_addr, "listening on tcp socket");

        Ok(Self {
            listener,
            local_addr,
            stopped: AtomicBool::new(false),
        })
    }

    /// Accept an incoming connection (blocking).
    ///
    /// Returns [`TransportError::Shutdown`] once [`TcpTransport::stop`] was called,
    /// including for an `accept` that was already blocked at that time.
    pub fn accept(&self) -> Result<NetStream> {
        if self.is_stopped() {
            return Err(TransportError::Shutdown);
        }

        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        if self.is_stopped() {
            debug!(%peer, "dropping connection accepted after stop");
            return Err(TransportError::Shutdown);
        }

        debug!(%peer, "accepted connection");
        Ok(NetStream::from_tcp(stream))
    }

    /// Connect to a listening TCP socket (blocking).
    pub fn connect(addr: &str) -> Result<NetStream> {
        let resolved = resolve(addr)?;
        let stream = TcpStream::connect(&resolved[..]).map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        debug!(addr, "connected to tcp socket");
        Ok(NetStream::from_tcp(stream))
    }

    /// Create a connected `(client, server)` pair over an ephemeral loopback listener.
    ///
    /// Useful for in-process peers and tests.
    pub fn loopback_pair() -> Result<(NetStream, NetStream)> {
        let transport = Self::bind("127.0.0.1:0")?;
        let client = Self::connect(&transport.local_addr().to_string())?;
        let server = transport.accept()?;
        Ok((client, server))
    }

    /// Stop listening. Idempotent.
    ///
    /// A thread blocked in [`TcpTransport::accept`] is woken by a throwaway
    /// loopback connection and observes the stopped state.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let wake_addr = wake_address(self.local_addr);
        if let Err(err) = TcpStream::connect(wake_addr) {
            debug!(error = %err, "wake connection after stop failed");
        }
        info!(local_addr = %self.local_addr, "listener stopped");
    }

    /// Whether [`TcpTransport::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| TransportError::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if resolved.is_empty() {
        return Err(TransportError::InvalidAddress {
            addr: addr.to_string(),
            reason: "address resolved to nothing".to_string(),
        });
    }
    Ok(resolved)
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}
