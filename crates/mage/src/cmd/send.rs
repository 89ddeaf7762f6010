use std::io::Read;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mage_crypto::Seed;
use mage_peer::{connect, Channel};
use tracing::{debug, warn};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_chunk, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let psk = args.key.resolve()?;
    let payload = resolve_payload(&args)?;

    let conn = connect(&args.addr, &Seed::generate(), &psk)
        .map_err(|err| peer_error("connect failed", err))?;
    let loops = conn
        .spawn_loops()
        .map_err(|err| peer_error("propagation start failed", err))?;
    let channel = conn
        .get_channel(args.channel)
        .map_err(|err| peer_error("channel setup failed", err))?;

    let reply = if args.wait {
        Some(spawn_reply_reader(channel.clone())?)
    } else {
        None
    };

    let sent = channel
        .write_all(&payload)
        .and_then(|()| channel.flush());
    if let Err(err) = sent {
        conn.close();
        let _ = loops.join();
        return Err(peer_error("send failed", err));
    }
    debug!(channel = args.channel, size = payload.len(), "payload sent");

    let mut outcome = Ok(SUCCESS);
    if let Some(reply) = reply {
        match wait_for_reply(&reply, wait_timeout) {
            Some(data) => {
                let peer = args.addr.as_str();
                print_chunk(args.channel, &data, peer, format);
            }
            None => {
                outcome = Err(CliError::new(
                    TIMEOUT,
                    format!("no reply on channel {} within {wait_timeout:?}", args.channel),
                ));
            }
        }
    }

    conn.close();
    if let Err(err) = loops.join() {
        warn!(error = %err, "connection ended with error");
    }
    outcome
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return std::fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    let mut payload = Vec::new();
    std::io::stdin()
        .read_to_end(&mut payload)
        .map_err(|err| io_error("failed reading stdin", err))?;
    Ok(payload)
}

fn spawn_reply_reader(channel: Channel) -> CliResult<mpsc::Receiver<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("reply-reader".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            if let Ok(n) = channel.read(&mut buf) {
                let _ = tx.send(buf[..n].to_vec());
            }
        })
        .map_err(|err| io_error("reader spawn failed", err))?;
    Ok(rx)
}

fn wait_for_reply(reply: &mpsc::Receiver<Vec<u8>>, timeout: Duration) -> Option<Vec<u8>> {
    reply.recv_timeout(timeout).ok()
}
