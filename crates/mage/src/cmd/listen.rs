use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;

use mage_crypto::Seed;
use mage_frame::ChannelId;
use mage_peer::{Channel, Listener, PeerError};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, running_flag, serve_channels, ListenArgs};
use crate::exit::{io_error, peer_error, CliResult, SUCCESS};
use crate::output::{print_chunk, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let psk = args.key.resolve()?;
    let listener =
        Arc::new(Listener::bind(&args.addr).map_err(|err| peer_error("bind failed", err))?);
    info!(addr = %listener.local_addr(), "waiting for peer");

    let running = running_flag();
    {
        let running = Arc::clone(&running);
        let listener = Arc::clone(&listener);
        install_ctrlc_handler(move || {
            running.store(false, Ordering::SeqCst);
            listener.stop();
        })?;
    }

    let conn = match listener.accept(&Seed::generate(), &psk) {
        Ok(conn) => conn,
        Err(PeerError::ListenerClosed) => return Ok(SUCCESS),
        Err(err) => return Err(peer_error("accept failed", err)),
    };
    listener.stop();

    let peer = conn
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let loops = conn
        .spawn_loops()
        .map_err(|err| peer_error("propagation start failed", err))?;

    let (tx, rx) = mpsc::channel::<(ChannelId, Vec<u8>)>();
    let watcher = {
        let conn = conn.clone();
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("channel-watch".to_string())
            .spawn(move || {
                let filter = args.channels;
                serve_channels(&conn, filter.as_deref(), &running, move |channel| {
                    forward(channel, &tx)
                })
            })
            .map_err(|err| io_error("watcher spawn failed", err))?
    };

    let mut printed = 0usize;
    while let Ok((channel, data)) = rx.recv() {
        print_chunk(channel, &data, &peer, format);
        printed = printed.saturating_add(1);
        if args.count.is_some_and(|count| printed >= count) {
            running.store(false, Ordering::SeqCst);
            conn.close();
            break;
        }
    }

    match watcher.join() {
        Ok(result) => result?,
        Err(_) => warn!("channel watcher panicked"),
    }
    if let Err(err) = loops.join() {
        warn!(error = %err, "connection ended with error");
    }
    Ok(SUCCESS)
}

fn forward(channel: Channel, tx: &mpsc::Sender<(ChannelId, Vec<u8>)>) {
    let mut buf = vec![0u8; 16 * 1024];
    while let Ok(n) = channel.read(&mut buf) {
        if tx.send((channel.id(), buf[..n].to_vec())).is_err() {
            break;
        }
    }
}
