//! Minimal echo server: accepts one peer and echoes every channel back.
//!
//! Run with:
//!   MAGE_KEY=$(cargo run -q --features cli -- --format raw keygen) \
//!     cargo run --example echo-server
//!
//! In another terminal (same MAGE_KEY):
//!   cargo run --features cli -- send 127.0.0.1:5555 --channel 5 --data hoho! --wait

use std::thread;

use mage::{Listener, PresharedKey, Seed};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let psk = PresharedKey::from_hex(&std::env::var("MAGE_KEY")?)?;
    let listener = Listener::bind("127.0.0.1:5555")?;
    eprintln!("Listening on {}", listener.local_addr());

    let conn = listener.accept(&Seed::generate(), &psk)?;
    eprintln!("Peer connected: {:?}", conn.peer_addr());
    let loops = conn.spawn_loops()?;

    let mut served = Vec::new();
    while !conn.is_closed() {
        for id in conn.channel_ids() {
            if served.contains(&id) {
                continue;
            }
            served.push(id);
            let channel = conn.get_channel(id)?;
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = channel.read(&mut buf) {
                    eprintln!("Received {n} bytes on channel {}", channel.id());
                    if channel.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
        thread::sleep(std::time::Duration::from_millis(20));
    }

    eprintln!("Peer disconnected");
    loops.join()?;
    Ok(())
}
