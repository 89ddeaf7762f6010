use std::sync::atomic::Ordering;
use std::sync::Arc;

use mage_crypto::Seed;
use mage_peer::{Channel, Listener, PeerError};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, running_flag, serve_channels, EchoArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};

pub fn run(args: EchoArgs) -> CliResult<i32> {
    let psk = args.key.resolve()?;
    let listener =
        Arc::new(Listener::bind(&args.addr).map_err(|err| peer_error("bind failed", err))?);
    info!(addr = %listener.local_addr(), "echo server listening");

    let running = running_flag();
    {
        let running = Arc::clone(&running);
        let listener = Arc::clone(&listener);
        install_ctrlc_handler(move || {
            running.store(false, Ordering::SeqCst);
            listener.stop();
        })?;
    }

    while running.load(Ordering::SeqCst) {
        let conn = match listener.accept(&Seed::generate(), &psk) {
            Ok(conn) => conn,
            Err(PeerError::ListenerClosed) => break,
            Err(err @ (PeerError::AuthenticationFailed | PeerError::HandshakeIo(_))) => {
                warn!(error = %err, "rejected peer");
                continue;
            }
            Err(err) => return Err(peer_error("accept failed", err)),
        };
        info!(connection = conn.id(), peer = ?conn.peer_addr(), "peer connected");

        let loops = conn
            .spawn_loops()
            .map_err(|err| peer_error("propagation start failed", err))?;
        serve_channels(&conn, args.channels.as_deref(), &running, echo_channel)?;
        if let Err(err) = loops.join() {
            warn!(connection = conn.id(), error = %err, "connection ended with error");
        }
        info!(connection = conn.id(), "peer disconnected");
    }

    Ok(SUCCESS)
}

fn echo_channel(channel: Channel) {
    let mut buf = vec![0u8; 16 * 1024];
    while let Ok(n) = channel.read(&mut buf) {
        info!(channel = channel.id(), size = n, "echoing data");
        if channel.write_all(&buf[..n]).is_err() {
            break;
        }
    }
}
