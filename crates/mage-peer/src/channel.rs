use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use mage_frame::ChannelId;
use tracing::debug;

use crate::buffer::ByteQueue;
use crate::error::{PeerError, Result};

/// What to do with an inbound frame for a channel nobody registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownChannelPolicy {
    /// Register the channel on first sight.
    #[default]
    AutoRegister,
    /// Fail with [`PeerError::UnknownChannel`]; fatal to the connection.
    Reject,
}

/// Bytes either side may send on a channel before hearing back from the
/// receiver. Both ends start every channel with this much credit.
pub const CHANNEL_WINDOW: usize = 64 * 1024;

/// Consumed bytes are granted back once at least this many have piled up.
const GRANT_THRESHOLD: usize = CHANNEL_WINDOW / 2;

/// Credit accounting for one channel.
///
/// `recv_credit + unread + consumed == CHANNEL_WINDOW` holds on the receive
/// side, so inbound bytes never exceed the window as long as the peer honors it.
struct Flow {
    /// Bytes we may still send.
    send_credit: usize,
    /// Bytes the peer may still send us.
    recv_credit: usize,
    /// Bytes read by the application and not yet granted back.
    consumed: usize,
}

/// A frame the outbound side owes the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outgoing {
    Data(ChannelId, Vec<u8>),
    Window(ChannelId, u32),
}

/// Per-channel buffers.
pub(crate) struct ChannelState {
    id: ChannelId,
    inbound: ByteQueue,
    outbound: ByteQueue,
    flow: Mutex<Flow>,
}

impl ChannelState {
    fn new(id: ChannelId, capacity: usize) -> Self {
        Self {
            id,
            inbound: ByteQueue::new(CHANNEL_WINDOW),
            outbound: ByteQueue::new(capacity),
            flow: Mutex::new(Flow {
                send_credit: CHANNEL_WINDOW,
                recv_credit: CHANNEL_WINDOW,
                consumed: 0,
            }),
        }
    }

    fn flow(&self) -> MutexGuard<'_, Flow> {
        self.flow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `n` bytes read by the application; true once a grant is due.
    fn consume(&self, n: usize) -> bool {
        let mut flow = self.flow();
        flow.consumed += n;
        flow.consumed >= GRANT_THRESHOLD
    }

    fn take_grant(&self) -> Option<u32> {
        let mut flow = self.flow();
        if flow.consumed < GRANT_THRESHOLD {
            return None;
        }
        let credit = flow.consumed;
        flow.consumed = 0;
        flow.recv_credit += credit;
        u32::try_from(credit).ok()
    }

    fn take_outbound(&self, max_payload: usize) -> Option<Vec<u8>> {
        let mut flow = self.flow();
        let bytes = self.outbound.take(max_payload.min(flow.send_credit))?;
        flow.send_credit -= bytes.len();
        Some(bytes)
    }

    fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

/// Wakes the outbound scheduler when channel data is queued or the connection closes.
///
/// Selection runs under this lock and writers notify under it, so a wakeup
/// between an empty selection and the wait cannot be lost.
pub(crate) struct OutboundSignal {
    closed: Mutex<bool>,
    ready: Condvar,
}

impl OutboundSignal {
    pub(crate) fn new() -> Self {
        Self {
            closed: Mutex::new(false),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self) {
        let _guard = self.lock();
        self.ready.notify_all();
    }

    pub(crate) fn close(&self) {
        let mut closed = self.lock();
        *closed = true;
        self.ready.notify_all();
    }

    /// Block until `poll` yields a value or the signal is closed (`None`).
    pub(crate) fn wait_for<T>(&self, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
        let mut closed = self.lock();
        loop {
            if *closed {
                return None;
            }
            if let Some(value) = poll() {
                return Some(value);
            }
            closed = self
                .ready
                .wait(closed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct TableInner {
    channels: BTreeMap<ChannelId, Arc<ChannelState>>,
    order: Vec<ChannelId>,
    cursor: usize,
    closed: bool,
}

/// The set of channels on one connection.
///
/// Inbound routing and outbound selection resolve ids through the same map,
/// so a channel id always names exactly one pair of buffers.
pub struct ChannelTable {
    inner: Mutex<TableInner>,
    policy: UnknownChannelPolicy,
    capacity: usize,
    signal: Arc<OutboundSignal>,
}

impl ChannelTable {
    pub(crate) fn new(
        capacity: usize,
        policy: UnknownChannelPolicy,
        signal: Arc<OutboundSignal>,
    ) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                channels: BTreeMap::new(),
                order: Vec::new(),
                cursor: 0,
                closed: false,
            }),
            policy,
            capacity,
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up or register channel `id`. Idempotent.
    pub fn get_or_create(&self, id: ChannelId) -> Result<Channel> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PeerError::ConnectionClosed);
        }
        let state = Self::entry(&mut inner, id, self.capacity);
        Ok(Channel {
            state,
            signal: Arc::clone(&self.signal),
        })
    }

    /// Look up a registered channel.
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.lock().channels.get(&id).map(|state| Channel {
            state: Arc::clone(state),
            signal: Arc::clone(&self.signal),
        })
    }

    fn entry(inner: &mut TableInner, id: ChannelId, capacity: usize) -> Arc<ChannelState> {
        if let Some(state) = inner.channels.get(&id) {
            return Arc::clone(state);
        }
        let state = Arc::new(ChannelState::new(id, capacity));
        inner.channels.insert(id, Arc::clone(&state));
        inner.order.push(id);
        debug!(channel = id, "channel registered");
        state
    }

    /// Deliver an inbound data payload to its channel.
    ///
    /// Never blocks: the sender may only have `CHANNEL_WINDOW` bytes in
    /// flight per channel, and a payload beyond the remaining credit is a
    /// protocol violation.
    pub fn route_inbound(&self, id: ChannelId, payload: &[u8]) -> Result<()> {
        let state = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PeerError::ConnectionClosed);
            }
            match (inner.channels.get(&id), self.policy) {
                (Some(state), _) => Arc::clone(state),
                (None, UnknownChannelPolicy::AutoRegister) => {
                    Self::entry(&mut inner, id, self.capacity)
                }
                (None, UnknownChannelPolicy::Reject) => {
                    return Err(PeerError::UnknownChannel(id));
                }
            }
        };

        let mut flow = state.flow();
        if payload.len() > flow.recv_credit {
            return Err(PeerError::MalformedFrame(format!(
                "channel {id} sent {} bytes with {} bytes of credit left",
                payload.len(),
                flow.recv_credit
            )));
        }
        flow.recv_credit -= payload.len();
        state
            .inbound
            .push(payload)
            .map_err(|_| PeerError::ConnectionClosed)
    }

    /// Add credit the peer granted for channel `id`.
    ///
    /// Grants for channels this side never registered are ignored.
    pub fn grant(&self, id: ChannelId, credit: u32) {
        let Some(state) = self.lock().channels.get(&id).cloned() else {
            debug!(channel = id, credit, "credit for unregistered channel ignored");
            return;
        };
        {
            let mut flow = state.flow();
            flow.send_credit = flow.send_credit.saturating_add(credit as usize);
        }
        self.signal.notify();
    }

    /// Pick the next channel with pending outbound bytes and send credit,
    /// round-robin, and take at most `max_payload` bytes from it.
    ///
    /// Channels whose credit is used up are skipped, so a peer that stops
    /// reading one channel does not hold up the others.
    pub fn select_next_outbound(&self, max_payload: usize) -> Option<(ChannelId, Vec<u8>)> {
        let mut inner = self.lock();
        let count = inner.order.len();
        for step in 0..count {
            let index = (inner.cursor + step) % count;
            let id = inner.order[index];
            let Some(state) = inner.channels.get(&id) else {
                continue;
            };
            if let Some(bytes) = state.take_outbound(max_payload) {
                inner.cursor = (index + 1) % count;
                return Some((id, bytes));
            }
        }
        None
    }

    /// Next frame to send: credit grants first, then channel data.
    pub(crate) fn next_outgoing(&self, max_payload: usize) -> Option<Outgoing> {
        let grant = self
            .lock()
            .channels
            .values()
            .find_map(|state| state.take_grant().map(|credit| (state.id, credit)));
        if let Some((id, credit)) = grant {
            return Some(Outgoing::Window(id, credit));
        }
        self.select_next_outbound(max_payload)
            .map(|(id, bytes)| Outgoing::Data(id, bytes))
    }

    /// Bytes channel `id` may still send before the peer grants more.
    pub fn send_credit(&self, id: ChannelId) -> Option<usize> {
        self.lock()
            .channels
            .get(&id)
            .map(|state| state.flow().send_credit)
    }

    /// Whether any channel has outbound bytes waiting.
    pub fn has_outbound(&self) -> bool {
        self.lock()
            .channels
            .values()
            .any(|state| !state.outbound.is_empty())
    }

    /// Registered channel ids in registration order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self) -> UnknownChannelPolicy {
        self.policy
    }

    /// Close every channel buffer and the outbound signal.
    pub(crate) fn close_all(&self) {
        let states: Vec<Arc<ChannelState>> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.channels.values().cloned().collect()
        };
        for state in states {
            state.close();
        }
        self.signal.close();
    }
}

impl std::fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTable")
            .field("channels", &self.ids())
            .field("policy", &self.policy)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Handle to one logical byte stream on a connection.
///
/// Clones refer to the same channel. `read` blocks until inbound data arrives
/// or the connection closes; `write` blocks while the outbound buffer is full.
#[derive(Clone)]
pub struct Channel {
    state: Arc<ChannelState>,
    signal: Arc<OutboundSignal>,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    /// Read buffered inbound bytes, blocking until some arrive.
    ///
    /// Bytes that arrived before the connection closed are still returned;
    /// after that, reads fail with [`PeerError::ConnectionClosed`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .state
            .inbound
            .read(buf)
            .map_err(|_| PeerError::ConnectionClosed)?;
        if self.state.consume(n) {
            self.signal.notify();
        }
        Ok(n)
    }

    /// Queue bytes for sending, blocking until there is room for at least one.
    ///
    /// Returns how many bytes were queued.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = self
            .state
            .outbound
            .write(buf)
            .map_err(|_| PeerError::ConnectionClosed)?;
        self.signal.notify();
        Ok(n)
    }

    /// Queue all of `buf`.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Block until every queued outbound byte has been handed to the
    /// propagation loop.
    pub fn flush(&self) -> Result<()> {
        self.state
            .outbound
            .wait_empty()
            .map_err(|_| PeerError::ConnectionClosed)
    }

    /// Inbound bytes waiting to be read.
    pub fn inbound_len(&self) -> usize {
        self.state.inbound.len()
    }

    /// Outbound bytes waiting to be sent.
    pub fn outbound_len(&self) -> usize {
        self.state.outbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.outbound.is_closed()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.state.id)
            .field("inbound", &self.state.inbound.len())
            .field("outbound", &self.state.outbound.len())
            .finish()
    }
}

impl Read for Channel {
    /// A closed connection reads as end of stream.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match Channel::read(self, buf) {
            Ok(n) => Ok(n),
            Err(PeerError::ConnectionClosed) => Ok(0),
            Err(err) => Err(std::io::Error::other(err)),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Channel::write(self, buf).map_err(closed_to_io)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Channel::flush(self).map_err(closed_to_io)
    }
}

fn closed_to_io(err: PeerError) -> std::io::Error {
    match err {
        PeerError::ConnectionClosed => {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed")
        }
        other => std::io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn table(policy: UnknownChannelPolicy) -> ChannelTable {
        ChannelTable::new(64, policy, Arc::new(OutboundSignal::new()))
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        let a = table.get_or_create(5).unwrap();
        let b = table.get_or_create(5).unwrap();

        table.route_inbound(5, b"hi").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(a.inbound_len(), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(a.id(), 5);
    }

    #[test]
    fn auto_register_on_inbound() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        table.route_inbound(9, b"surprise").unwrap();

        let channel = table.get(9).unwrap();
        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"surprise");
    }

    #[test]
    fn reject_policy_fails_unknown_channel() {
        let table = table(UnknownChannelPolicy::Reject);
        assert!(matches!(
            table.route_inbound(9, b"x"),
            Err(PeerError::UnknownChannel(9))
        ));
        assert!(table.get(9).is_none());

        table.get_or_create(9).unwrap();
        table.route_inbound(9, b"x").unwrap();
    }

    #[test]
    fn channels_are_isolated() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        let one = table.get_or_create(1).unwrap();
        let two = table.get_or_create(2).unwrap();

        table.route_inbound(1, b"one").unwrap();
        table.route_inbound(2, b"two").unwrap();
        table.route_inbound(1, b"uno").unwrap();

        let mut buf = [0u8; 16];
        let n = two.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        let n = one.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"oneuno");
    }

    #[test]
    fn round_robin_selection() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        let a = table.get_or_create(1).unwrap();
        let b = table.get_or_create(2).unwrap();
        let c = table.get_or_create(3).unwrap();

        a.write_all(b"aaaaaa").unwrap();
        b.write_all(b"bb").unwrap();
        c.write_all(b"cccc").unwrap();

        let mut order = Vec::new();
        while let Some((id, bytes)) = table.select_next_outbound(2) {
            order.push((id, bytes));
        }

        let ids: Vec<u8> = order.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 3, 1]);
        assert!(order.iter().all(|(_, bytes)| bytes.len() == 2));
        assert!(!table.has_outbound());
    }

    #[test]
    fn selection_respects_max_payload() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        let ch = table.get_or_create(4).unwrap();
        ch.write_all(&[1u8; 40]).unwrap();

        let (id, bytes) = table.select_next_outbound(16).unwrap();
        assert_eq!(id, 4);
        assert_eq!(bytes.len(), 16);
        assert_eq!(ch.outbound_len(), 24);
    }

    #[test]
    fn selection_stops_at_send_credit() {
        let table = ChannelTable::new(
            2 * CHANNEL_WINDOW,
            UnknownChannelPolicy::AutoRegister,
            Arc::new(OutboundSignal::new()),
        );
        let one = table.get_or_create(1).unwrap();
        one.write_all(&vec![3u8; CHANNEL_WINDOW + 100]).unwrap();

        let mut sent = 0;
        while let Some((id, bytes)) = table.select_next_outbound(16 * 1024) {
            assert_eq!(id, 1);
            sent += bytes.len();
        }
        assert_eq!(sent, CHANNEL_WINDOW);
        assert_eq!(table.send_credit(1), Some(0));
        assert_eq!(one.outbound_len(), 100);

        let two = table.get_or_create(2).unwrap();
        two.write_all(b"unaffected").unwrap();
        assert_eq!(
            table.select_next_outbound(1024),
            Some((2, b"unaffected".to_vec()))
        );

        table.grant(1, 60);
        assert_eq!(table.select_next_outbound(1024).unwrap().1.len(), 60);
        table.grant(1, 1000);
        assert_eq!(table.select_next_outbound(1024).unwrap().1.len(), 40);
        assert_eq!(table.send_credit(1), Some(960));
    }

    #[test]
    fn unread_channel_does_not_block_routing() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        table.route_inbound(1, &vec![0u8; CHANNEL_WINDOW]).unwrap();
        table.route_inbound(5, b"hoho!").unwrap();

        let five = table.get(5).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(five.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hoho!");
        assert_eq!(table.get(1).unwrap().inbound_len(), CHANNEL_WINDOW);
    }

    #[test]
    fn overrunning_the_window_is_malformed() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        table.route_inbound(1, &vec![0u8; CHANNEL_WINDOW - 1]).unwrap();
        assert!(matches!(
            table.route_inbound(1, b"xy"),
            Err(PeerError::MalformedFrame(_))
        ));
    }

    #[test]
    fn reading_grants_credit_back() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        table.route_inbound(1, &vec![0u8; CHANNEL_WINDOW]).unwrap();
        assert!(table.next_outgoing(1024).is_none());

        let one = table.get(1).unwrap();
        let mut buf = vec![0u8; GRANT_THRESHOLD - 1];
        assert_eq!(one.read(&mut buf).unwrap(), GRANT_THRESHOLD - 1);
        assert!(table.next_outgoing(1024).is_none());
        assert_eq!(one.read(&mut [0u8; 1]).unwrap(), 1);

        assert_eq!(
            table.next_outgoing(1024),
            Some(Outgoing::Window(1, GRANT_THRESHOLD as u32))
        );
        assert!(table.next_outgoing(1024).is_none());
        table.route_inbound(1, &vec![0u8; GRANT_THRESHOLD]).unwrap();
    }

    #[test]
    fn grants_go_out_before_data() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        table.route_inbound(2, &vec![0u8; GRANT_THRESHOLD]).unwrap();
        let two = table.get(2).unwrap();
        two.write_all(b"reply").unwrap();
        let mut buf = vec![0u8; GRANT_THRESHOLD];
        let mut read = 0;
        while read < GRANT_THRESHOLD {
            read += two.read(&mut buf[read..]).unwrap();
        }

        assert!(matches!(table.next_outgoing(64), Some(Outgoing::Window(2, _))));
        assert_eq!(
            table.next_outgoing(64),
            Some(Outgoing::Data(2, b"reply".to_vec()))
        );
    }

    #[test]
    fn close_all_wakes_readers_and_rejects_new_channels() {
        let table = Arc::new(table(UnknownChannelPolicy::AutoRegister));
        let ch = table.get_or_create(1).unwrap();

        let reader = thread::spawn(move || ch.read(&mut [0u8; 8]));
        thread::sleep(Duration::from_millis(50));
        table.close_all();

        assert!(matches!(
            reader.join().unwrap(),
            Err(PeerError::ConnectionClosed)
        ));
        assert!(matches!(
            table.get_or_create(2),
            Err(PeerError::ConnectionClosed)
        ));
        assert!(matches!(
            table.route_inbound(1, b"late"),
            Err(PeerError::ConnectionClosed)
        ));
    }

    #[test]
    fn signal_wait_returns_polled_value() {
        let signal = Arc::new(OutboundSignal::new());
        let table = Arc::new(ChannelTable::new(
            64,
            UnknownChannelPolicy::AutoRegister,
            Arc::clone(&signal),
        ));

        let waiter = {
            let signal = Arc::clone(&signal);
            let table = Arc::clone(&table);
            thread::spawn(move || signal.wait_for(|| table.select_next_outbound(64)))
        };

        thread::sleep(Duration::from_millis(30));
        table.get_or_create(7).unwrap().write_all(b"go").unwrap();

        let (id, bytes) = waiter.join().unwrap().unwrap();
        assert_eq!(id, 7);
        assert_eq!(bytes, b"go");
    }

    #[test]
    fn signal_close_ends_wait() {
        let signal = Arc::new(OutboundSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait_for(|| None::<()>))
        };

        thread::sleep(Duration::from_millis(30));
        signal.close();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn io_traits_map_close_to_eof() {
        let table = table(UnknownChannelPolicy::AutoRegister);
        let mut ch = table.get_or_create(1).unwrap();
        table.route_inbound(1, b"last").unwrap();
        table.close_all();

        let mut out = Vec::new();
        Read::read_to_end(&mut ch, &mut out).unwrap();
        assert_eq!(out, b"last");

        let err = Write::write(&mut ch, b"x").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
