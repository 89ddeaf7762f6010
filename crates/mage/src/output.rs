use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mage_frame::{channel_name, ChannelId};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    channel: ChannelId,
    channel_name: String,
    size: usize,
    payload: String,
    peer: &'a str,
    timestamp: String,
}

/// Print bytes received on a channel.
pub fn print_chunk(channel: ChannelId, data: &[u8], peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ChunkOutput {
                channel,
                channel_name: channel_name(channel),
                size: data.len(),
                payload: payload_preview(data),
                peer,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "SIZE", "PEER", "PAYLOAD"])
                .add_row(vec![
                    channel_name(channel),
                    data.len().to_string(),
                    peer.to_string(),
                    payload_preview(data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "channel={} size={} peer={} payload={}",
                channel,
                data.len(),
                peer,
                payload_preview(data)
            );
        }
        OutputFormat::Raw => print_raw(data),
    }
}

#[derive(Serialize)]
struct KeyOutput<'a> {
    key: &'a str,
    bits: usize,
}

/// Print a freshly generated key.
pub fn print_key(hex_key: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = KeyOutput {
                key: hex_key,
                bits: hex_key.len() * 4,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["KEY", "BITS"])
                .add_row(vec![hex_key.to_string(), (hex_key.len() * 4).to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => println!("{hex_key}"),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
