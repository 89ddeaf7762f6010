use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A connected network stream implementing `Read` and `Write`.
///
/// This is the fundamental I/O type returned by transport operations.
/// Reads and writes may proceed concurrently on independent clones
/// (see [`NetStream::try_clone`]), one reader and one writer at a time.
pub struct NetStream {
    inner: TcpStream,
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl NetStream {
    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        // Frames are small and latency-sensitive; Nagle only adds delay here.
        let _ = stream.set_nodelay(true);
        Self { inner: stream }
    }

    /// Set read timeout on the underlying stream.
    ///
    /// The timeout is a socket option, so it applies to every clone.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self { inner: cloned })
    }

    /// Shut down both directions of the socket.
    ///
    /// Unblocks any thread currently reading from a clone of this stream.
    /// Shutting down an already-disconnected socket is not an error.
    pub fn shutdown(&self) -> Result<()> {
        match self.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }

    /// Local address of this end of the stream.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Into::into)
    }
}

impl std::fmt::Debug for NetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("NetStream");
        dbg.field("type", &"tcp");
        if let Ok(peer) = self.inner.peer_addr() {
            dbg.field("peer", &peer);
        }
        dbg.finish()
    }
}
