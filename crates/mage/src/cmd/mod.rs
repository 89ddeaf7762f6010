use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::{Args, Subcommand};
use mage_crypto::PresharedKey;
use mage_frame::ChannelId;
use mage_peer::{Channel, Connection, PeerError};
use tracing::{debug, warn};

use crate::exit::{io_error, key_error, peer_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod keygen;
pub mod listen;
pub mod proxy;
pub mod send;
pub mod version;

/// How often new remote channels are looked for.
const CHANNEL_SCAN_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a pre-shared key.
    Keygen(KeygenArgs),
    /// Accept one connection and print data received on its channels.
    Listen(ListenArgs),
    /// Connect and write data to one channel.
    Send(SendArgs),
    /// Accept connections and echo every channel back.
    Echo(EchoArgs),
    /// Bridge a plain local TCP socket onto one channel.
    Proxy(ProxyArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Keygen(args) => keygen::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Echo(args) => echo::run(args),
        Command::Proxy(args) => proxy::run(args),
        Command::Version(args) => version::run(args),
    }
}

/// Pre-shared key source shared by every networked command.
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Pre-shared key as 64 hex characters.
    #[arg(long, env = "MAGE_KEY", hide_env_values = true)]
    pub key: Option<String>,
    /// Read the hex key from a file (as written by `mage keygen --out`).
    #[arg(long, value_name = "FILE", conflicts_with = "key")]
    pub key_file: Option<PathBuf>,
}

impl KeyArgs {
    pub fn resolve(&self) -> CliResult<PresharedKey> {
        if let Some(hex_key) = &self.key {
            return PresharedKey::from_hex(hex_key).map_err(|err| key_error("invalid --key", err));
        }
        if let Some(path) = &self.key_file {
            let text = std::fs::read_to_string(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
            return PresharedKey::from_hex(&text)
                .map_err(|err| key_error(&format!("invalid key in {}", path.display()), err));
        }
        Err(CliError::new(
            USAGE,
            "a pre-shared key is required (--key, --key-file or MAGE_KEY)",
        ))
    }
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Write the key to FILE instead of stdout.
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,
    /// Overwrite FILE if it exists.
    #[arg(long, requires = "out")]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind (host:port).
    pub addr: String,
    #[command(flatten)]
    pub key: KeyArgs,
    /// Only print these channels (comma-separated); others are drained.
    #[arg(long, value_delimiter = ',')]
    pub channels: Option<Vec<ChannelId>>,
    /// Exit after printing N chunks.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to connect to (host:port).
    pub addr: String,
    #[command(flatten)]
    pub key: KeyArgs,
    /// Channel to send on.
    #[arg(long, short = 'c', default_value = "1")]
    pub channel: ChannelId,
    /// String payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file. Without --data or --file, stdin is sent.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Wait for data back on the same channel and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to bind (host:port).
    pub addr: String,
    #[command(flatten)]
    pub key: KeyArgs,
    /// Channels to echo (comma-separated). Default: every channel.
    #[arg(long, value_delimiter = ',')]
    pub channels: Option<Vec<ChannelId>>,
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// Remote mage address (host:port).
    pub addr: String,
    #[command(flatten)]
    pub key: KeyArgs,
    /// Accept the mage connection on ADDR instead of dialing it.
    #[arg(long)]
    pub listen: bool,
    /// Channel carrying the proxied stream.
    #[arg(long, short = 'c', default_value = "1")]
    pub channel: ChannelId,
    /// Local plain-TCP endpoint (host:port).
    #[arg(long, value_name = "HOST:PORT")]
    pub local: String,
    /// Accept the local connection on --local instead of dialing it.
    #[arg(long)]
    pub local_listen: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn install_ctrlc_handler(on_interrupt: impl Fn() + Send + 'static) -> CliResult<()> {
    ctrlc::set_handler(on_interrupt).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })
}

/// Run `serve` on its own thread for every channel that becomes active on
/// `conn`, until the connection closes or `running` is cleared.
///
/// Channels outside `filter` are read and discarded so they cannot stall
/// the inbound loop. Returns after closing the connection; the workers have
/// all finished by then.
pub fn serve_channels<F>(
    conn: &Connection,
    filter: Option<&[ChannelId]>,
    running: &AtomicBool,
    serve: F,
) -> CliResult<()>
where
    F: Fn(Channel) + Clone + Send + 'static,
{
    let mut seen = BTreeSet::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    if let Some(ids) = filter {
        for &id in ids {
            match conn.get_channel(id) {
                Ok(_) | Err(PeerError::ConnectionClosed) => {}
                Err(err) => return Err(peer_error("channel setup failed", err)),
            }
        }
    }

    loop {
        let active = running.load(Ordering::SeqCst) && !conn.is_closed();
        for id in conn.channel_ids() {
            if !seen.insert(id) {
                continue;
            }
            // Channels found after close still hold undelivered bytes.
            let Some(channel) = conn.channel(id) else {
                continue;
            };

            let wanted = filter.is_none_or(|ids| ids.contains(&id));
            let serve = serve.clone();
            let spawned = thread::Builder::new()
                .name(format!("ch{id}"))
                .spawn(move || {
                    if wanted {
                        serve(channel)
                    } else {
                        discard(channel)
                    }
                });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    conn.close();
                    return Err(io_error("worker spawn failed", err));
                }
            }
        }
        if !active {
            break;
        }
        thread::sleep(CHANNEL_SCAN_INTERVAL);
    }

    conn.close();
    for worker in workers {
        if worker.join().is_err() {
            warn!("channel worker panicked");
        }
    }
    Ok(())
}

fn discard(channel: Channel) {
    let mut buf = [0u8; 4096];
    while let Ok(n) = channel.read(&mut buf) {
        debug!(channel = channel.id(), size = n, "discarding data on unwatched channel");
    }
}

/// Shared stop flag for commands that run until interrupted.
pub fn running_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn key_args_require_a_source() {
        let args = KeyArgs {
            key: None,
            key_file: None,
        };
        assert_eq!(args.resolve().unwrap_err().code, USAGE);
    }

    #[test]
    fn key_args_reject_bad_hex() {
        let args = KeyArgs {
            key: Some("zz".to_string()),
            key_file: None,
        };
        assert_eq!(args.resolve().unwrap_err().code, USAGE);
    }

    #[test]
    fn key_args_accept_hex() {
        let args = KeyArgs {
            key: Some("ab".repeat(32)),
            key_file: None,
        };
        assert_eq!(args.resolve().unwrap().as_bytes(), &[0xab; 32]);
    }
}
