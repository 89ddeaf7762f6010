//! Multi-channel example: two channels share one authenticated connection,
//! driven first by the split loops and then through the handle-based service.
//!
//! Run with:
//!   cargo run --example multi-channel

use std::thread;

use mage::{connect, Listener, PresharedKey, Seed, Service};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let psk = PresharedKey::generate();
    let listener = Listener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr().to_string();

    let server_psk = psk.clone();
    let server = thread::spawn(
        move || -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let conn = listener.accept(&Seed::generate(), &server_psk)?;
            let loops = conn.spawn_loops()?;

            let mut buf = [0u8; 64];
            for id in [1, 5] {
                let channel = conn.get_channel(id)?;
                let n = channel.read(&mut buf)?;
                eprintln!(
                    "[server] channel={id} payload={}",
                    String::from_utf8_lossy(&buf[..n])
                );
                channel.write_all(&buf[..n])?;
                channel.flush()?;
            }

            loops.join()?;
            Ok(())
        },
    );

    let client = connect(&addr, &Seed::generate(), &psk)?;
    let loops = client.spawn_loops()?;

    let command = client.get_channel(1)?;
    command.write_all(b"{\"action\":\"ping\"}")?;
    let bulk = client.get_channel(5)?;
    bulk.write_all(b"hoho!")?;

    let mut buf = [0u8; 64];
    for channel in [&command, &bulk] {
        let n = channel.read(&mut buf)?;
        eprintln!(
            "[client] channel={} response={}",
            channel.id(),
            String::from_utf8_lossy(&buf[..n])
        );
    }
    client.close();
    loops.join()?;
    server
        .join()
        .expect("server thread should not panic")
        .expect("server should complete without error");

    // The same exchange through service handles.
    let service = Service::start();
    let listener = service.listen("127.0.0.1:0")?;
    let addr = service.local_addr(listener)?.to_string();

    thread::scope(|scope| -> Result<(), Box<dyn std::error::Error>> {
        let accepted = scope.spawn(|| service.accept(listener, &Seed::generate(), &psk));
        let client = service.connect(&addr, &Seed::generate(), &psk)?;
        let server = accepted.join().expect("accept should not panic")?;

        for conn in [client, server] {
            let service = &service;
            scope.spawn(move || service.run_propagation_loop(conn));
        }

        let tx = service.get_channel(client, 5)?;
        let rx = service.get_channel(server, 5)?;
        service.channel_write(tx, b"hoho!")?;
        let n = service.channel_read(rx, &mut buf)?;
        eprintln!("[service] channel=5 payload={}", String::from_utf8_lossy(&buf[..n]));

        service.close_connection(client)?;
        service.close_connection(server)?;
        Ok(())
    })?;

    service.stop();
    Ok(())
}
