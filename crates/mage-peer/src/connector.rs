use mage_crypto::{PresharedKey, Role, Seed};
use mage_transport::TcpTransport;
use tracing::warn;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{PeerError, Result};
use crate::handshake::HandshakeConfig;

/// Dial `addr` and run the handshake as initiator.
pub fn connect(addr: &str, seed: &Seed, psk: &PresharedKey) -> Result<Connection> {
    connect_with_config(
        addr,
        seed,
        psk,
        &HandshakeConfig::default(),
        ConnectionConfig::default(),
    )
}

/// Connect with explicit configuration.
pub fn connect_with_config(
    addr: &str,
    seed: &Seed,
    psk: &PresharedKey,
    handshake_config: &HandshakeConfig,
    config: ConnectionConfig,
) -> Result<Connection> {
    let stream = TcpTransport::connect(addr).map_err(PeerError::Dial)?;
    Connection::establish(stream, Role::Initiator, seed, psk, handshake_config, config)
        .inspect_err(|err| warn!(addr, error = %err, "outbound handshake failed"))
}
