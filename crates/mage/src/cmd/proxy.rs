use std::io;
use std::thread;

use mage_crypto::Seed;
use mage_peer::{connect, Channel, Connection, Listener};
use mage_transport::{NetStream, TcpTransport};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, ProxyArgs};
use crate::exit::{io_error, peer_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ProxyArgs) -> CliResult<i32> {
    let psk = args.key.resolve()?;
    let seed = Seed::generate();

    let conn = if args.listen {
        let listener = Listener::bind(&args.addr).map_err(|err| peer_error("bind failed", err))?;
        info!(addr = %listener.local_addr(), "waiting for mage peer");
        listener
            .accept(&seed, &psk)
            .map_err(|err| peer_error("accept failed", err))?
    } else {
        connect(&args.addr, &seed, &psk).map_err(|err| peer_error("connect failed", err))?
    };

    {
        let conn = conn.clone();
        install_ctrlc_handler(move || conn.close())?;
    }

    let loops = conn
        .spawn_loops()
        .map_err(|err| peer_error("propagation start failed", err))?;
    let channel = conn
        .get_channel(args.channel)
        .map_err(|err| peer_error("channel setup failed", err))?;

    let local = match open_local(&args.local, args.local_listen) {
        Ok(local) => local,
        Err(err) => {
            conn.close();
            let _ = loops.join();
            return Err(err);
        }
    };
    info!(channel = args.channel, local = %args.local, "proxy established");

    let result = bridge(&conn, channel, local);
    conn.close();
    if let Err(err) = loops.join() {
        warn!(error = %err, "connection ended with error");
    }

    let (up, down) = result?;
    info!(bytes_up = up, bytes_down = down, "proxy finished");
    Ok(SUCCESS)
}

fn open_local(addr: &str, listen: bool) -> CliResult<NetStream> {
    if listen {
        let transport =
            TcpTransport::bind(addr).map_err(|err| transport_error("local bind failed", err))?;
        info!(addr = %transport.local_addr(), "waiting for local client");
        transport
            .accept()
            .map_err(|err| transport_error("local accept failed", err))
    } else {
        TcpTransport::connect(addr).map_err(|err| transport_error("local connect failed", err))
    }
}

/// Copy bytes both ways until either side ends. Returns `(local->peer, peer->local)` byte counts.
fn bridge(conn: &Connection, channel: Channel, local: NetStream) -> CliResult<(u64, u64)> {
    let mut local_reader = local
        .try_clone()
        .map_err(|err| transport_error("local clone failed", err))?;
    let mut local_writer = local;

    let upstream = {
        let conn = conn.clone();
        let mut channel = channel.clone();
        thread::Builder::new()
            .name("proxy-up".to_string())
            .spawn(move || {
                let copied = io::copy(&mut local_reader, &mut channel);
                // Local EOF: deliver what was queued, then end the session.
                let _ = channel.flush();
                debug!("local side finished");
                conn.close();
                copied
            })
            .map_err(|err| io_error("proxy spawn failed", err))?
    };

    let mut channel = channel;
    let copied_down = io::copy(&mut channel, &mut local_writer);
    if let Err(err) = local_writer.shutdown() {
        debug!(error = %err, "local shutdown failed");
    }
    conn.close();

    let copied_up = upstream
        .join()
        .map_err(|_| CliError::new(INTERNAL, "proxy thread panicked"))?;

    let down = copied_down
        .or_else(ignore_broken_pipe)
        .map_err(|err| io_error("peer to local copy failed", err))?;
    let up = copied_up
        .or_else(ignore_broken_pipe)
        .map_err(|err| io_error("local to peer copy failed", err))?;
    Ok((up, down))
}

fn ignore_broken_pipe(err: io::Error) -> io::Result<u64> {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected => Ok(0),
        _ => Err(err),
    }
}
