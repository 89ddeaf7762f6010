//! Background drivers that move frames between the socket and channel buffers.
//!
//! A loop's lifetime is bound to its connection: closing the connection is
//! the only way to stop one. Loops return `Ok(())` after a local close or an
//! orderly remote close, and the fatal error otherwise (the connection has
//! already been closed by then).

use std::thread::{self, JoinHandle};
use std::time::Duration;

use mage_frame::{Frame, Opcode, CONTROL_CHANNEL};
use tracing::debug;

use crate::channel::Outgoing;
use crate::connection::{lock, Connection, SecureWriter, MODE_MULTIPLEXED};
use crate::control::ControlMessage;
use crate::error::{PeerError, Result};

/// Poll interval used by the combined loop while outbound data is pending.
const BUSY_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Join handles for the two split loops started by [`Connection::spawn_loops`].
#[derive(Debug)]
pub struct LoopHandles {
    pub inbound: JoinHandle<Result<()>>,
    pub outbound: JoinHandle<Result<()>>,
}

impl LoopHandles {
    /// Wait for both loops; the inbound loop's error wins if both failed.
    pub fn join(self) -> Result<()> {
        let inbound = join_loop(self.inbound);
        let outbound = join_loop(self.outbound);
        inbound.and(outbound)
    }
}

fn join_loop(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(PeerError::Io(std::io::Error::other("loop thread panicked"))))
}

impl Connection {
    /// Drive both directions from the calling thread.
    ///
    /// Each iteration handles at most one inbound frame (waiting up to the
    /// configured poll interval) and one outbound frame.
    pub fn run_propagation_loop(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.claim_mode(MODE_MULTIPLEXED)?;
        debug!(connection = self.id(), "propagation loop started");
        let result = self.propagate_combined();
        self.finish_loop("propagation", result)
    }

    /// Drive only the socket-to-channels direction from the calling thread.
    pub fn run_inbound_loop(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.claim_mode(MODE_MULTIPLEXED)?;
        debug!(connection = self.id(), "inbound loop started");
        let result = self.propagate_inbound();
        self.finish_loop("inbound", result)
    }

    /// Drive only the channels-to-socket direction from the calling thread.
    pub fn run_outbound_loop(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.claim_mode(MODE_MULTIPLEXED)?;
        debug!(connection = self.id(), "outbound loop started");
        let result = self.propagate_outbound();
        self.finish_loop("outbound", result)
    }

    /// Spawn the inbound and outbound loops on dedicated named threads.
    pub fn spawn_loops(&self) -> Result<LoopHandles> {
        self.ensure_open()?;
        self.claim_mode(MODE_MULTIPLEXED)?;

        let inbound = {
            let conn = self.clone();
            thread::Builder::new()
                .name(format!("mage-in-{}", self.id()))
                .spawn(move || conn.run_inbound_loop())
                .map_err(PeerError::Io)?
        };
        let outbound = {
            let conn = self.clone();
            thread::Builder::new()
                .name(format!("mage-out-{}", self.id()))
                .spawn(move || conn.run_outbound_loop())
        };

        match outbound {
            Ok(outbound) => Ok(LoopHandles { inbound, outbound }),
            Err(err) => {
                self.close();
                let _ = inbound.join();
                Err(PeerError::Io(err))
            }
        }
    }

    fn propagate_combined(&self) -> Result<()> {
        let idle_poll = self.config().poll_interval.max(BUSY_POLL);
        self.set_poll(idle_poll)?;
        let mut busy = false;

        loop {
            if self.is_closed() {
                return Ok(());
            }

            if let Some(frame) = self.read_frame(true)? {
                if self.dispatch(frame)? == Flow::Stop {
                    return Ok(());
                }
            }

            let wrote = self.write_next()?;
            if wrote != busy {
                busy = wrote;
                self.set_poll(if busy { BUSY_POLL } else { idle_poll })?;
            }
        }
    }

    fn propagate_inbound(&self) -> Result<()> {
        loop {
            if self.is_closed() {
                return Ok(());
            }
            if let Some(frame) = self.read_frame(false)? {
                if self.dispatch(frame)? == Flow::Stop {
                    return Ok(());
                }
            }
        }
    }

    fn propagate_outbound(&self) -> Result<()> {
        let max = self.config().max_frame_payload;
        loop {
            let mut guard = lock(&self.shared.writer);
            let Some(writer) = guard.as_mut() else {
                return Ok(());
            };

            let selected = self
                .shared
                .outbound
                .wait_for(|| self.shared.channels.next_outgoing(max));
            let Some(outgoing) = selected else {
                return Ok(());
            };

            send_outgoing(writer, outgoing)?;
        }
    }

    fn read_frame(&self, poll: bool) -> Result<Option<Frame>> {
        let mut guard = lock(&self.shared.reader);
        let Some(reader) = guard.as_mut() else {
            return Err(PeerError::ConnectionClosed);
        };

        match reader.read_frame() {
            Ok(frame) => Ok(Some(frame)),
            Err(err) if poll && err.is_timeout() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Send at most one pending outbound frame without blocking for data.
    fn write_next(&self) -> Result<bool> {
        let mut guard = lock(&self.shared.writer);
        let Some(writer) = guard.as_mut() else {
            return Err(PeerError::ConnectionClosed);
        };

        let max = self.config().max_frame_payload;
        match self.shared.channels.next_outgoing(max) {
            Some(outgoing) => {
                send_outgoing(writer, outgoing)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<Flow> {
        match frame.opcode {
            Opcode::Data => {
                self.shared
                    .channels
                    .route_inbound(frame.channel, &frame.payload)?;
                Ok(Flow::Continue)
            }
            Opcode::Control => match ControlMessage::from_bytes(&frame.payload) {
                Ok(ControlMessage::Close { reason }) => {
                    debug!(connection = self.id(), ?reason, "peer closed connection");
                    self.close_quietly();
                    Ok(Flow::Stop)
                }
                Ok(ControlMessage::Window { channel, credit }) => {
                    self.shared.channels.grant(channel, credit);
                    Ok(Flow::Continue)
                }
                Ok(ControlMessage::Unknown) => {
                    debug!(connection = self.id(), "ignoring unknown control message");
                    Ok(Flow::Continue)
                }
                Err(err) => Err(PeerError::MalformedFrame(format!(
                    "invalid control message: {err}"
                ))),
            },
            Opcode::Handshake => Err(PeerError::MalformedFrame(
                "handshake frame after authentication".to_string(),
            )),
        }
    }

    fn set_poll(&self, interval: Duration) -> Result<()> {
        self.shared
            .socket
            .set_read_timeout(Some(interval))
            .map_err(|err| match err {
                mage_transport::TransportError::Io(io) => PeerError::Io(io),
                other => PeerError::Io(std::io::Error::other(other.to_string())),
            })
    }

    fn finish_loop(&self, name: &'static str, result: Result<()>) -> Result<()> {
        let outcome = match result {
            Ok(()) => Ok(()),
            Err(_) if self.is_closed() => Ok(()),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        };
        self.release_halves();
        debug!(connection = self.id(), loop_name = name, ok = outcome.is_ok(), "loop stopped");
        outcome
    }
}

fn send_outgoing(writer: &mut SecureWriter, outgoing: Outgoing) -> Result<()> {
    match outgoing {
        Outgoing::Data(channel, bytes) => writer.send(channel, Opcode::Data, &bytes)?,
        Outgoing::Window(channel, credit) => {
            let payload = ControlMessage::window(channel, credit)
                .to_bytes()
                .map_err(|e| PeerError::MalformedFrame(e.to_string()))?;
            writer.send(CONTROL_CHANNEL, Opcode::Control, &payload)?;
        }
    }
    Ok(())
}
