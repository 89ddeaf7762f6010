use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// The queue was closed; no further bytes will be accepted or produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueClosed;

struct QueueState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// Bounded blocking byte queue shared by one producer side and one consumer side.
///
/// Readers drain whatever is buffered even after close and only then see
/// [`QueueClosed`]. Writers fail as soon as the queue is closed.
pub(crate) struct ByteQueue {
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl ByteQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                bytes: VecDeque::new(),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until at least one byte is available, then copy out as many as fit.
    pub(crate) fn read(&self, out: &mut [u8]) -> Result<usize, QueueClosed> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock();
        while state.bytes.is_empty() {
            if state.closed {
                return Err(QueueClosed);
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let n = drain_into(&mut state.bytes, out);
        drop(state);
        self.writable.notify_all();
        Ok(n)
    }

    /// Block until there is room, then enqueue as much of `data` as fits.
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize, QueueClosed> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if state.bytes.len() < self.capacity {
                break;
            }
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let n = (self.capacity - state.bytes.len()).min(data.len());
        state.bytes.extend(&data[..n]);
        drop(state);
        self.readable.notify_all();
        Ok(n)
    }

    /// Append all of `data` without waiting for room.
    ///
    /// Capacity is not enforced here; the caller bounds what it pushes.
    pub(crate) fn push(&self, data: &[u8]) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed);
        }
        state.bytes.extend(data);
        drop(state);
        self.readable.notify_all();
        Ok(())
    }

    /// Take up to `max` bytes without blocking.
    pub(crate) fn take(&self, max: usize) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if state.bytes.is_empty() || max == 0 {
            return None;
        }

        let n = state.bytes.len().min(max);
        let taken: Vec<u8> = state.bytes.drain(..n).collect();
        drop(state);
        self.writable.notify_all();
        Some(taken)
    }

    /// Block until the queue is empty.
    ///
    /// Fails if the queue is closed with bytes still buffered.
    pub(crate) fn wait_empty(&self) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        while !state.bytes.is_empty() {
            if state.closed {
                return Err(QueueClosed);
            }
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().bytes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue and wake every blocked reader and writer.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn drain_into(bytes: &mut VecDeque<u8>, out: &mut [u8]) -> usize {
    let n = bytes.len().min(out.len());
    for (slot, byte) in out.iter_mut().zip(bytes.drain(..n)) {
        *slot = byte;
    }
    n
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn read_returns_what_was_written() {
        let queue = ByteQueue::new(16);
        assert_eq!(queue.write(b"hello").unwrap(), 5);

        let mut buf = [0u8; 3];
        assert_eq!(queue.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(queue.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert!(queue.is_empty());
    }

    #[test]
    fn write_is_bounded_by_capacity() {
        let queue = ByteQueue::new(4);
        assert_eq!(queue.write(b"abcdef").unwrap(), 4);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn full_queue_blocks_writer_until_drained() {
        let queue = Arc::new(ByteQueue::new(4));
        queue.write(b"full").unwrap();

        let (tx, rx) = mpsc::channel();
        let writer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let result = queue.write(b"more");
                tx.send(()).unwrap();
                result
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(queue.take(2).unwrap(), b"fu");

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(writer.join().unwrap().unwrap(), 2);
        assert_eq!(queue.take(16).unwrap(), b"llmo");
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let queue = Arc::new(ByteQueue::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.read(&mut [0u8; 4]))
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(reader.join().unwrap(), Err(QueueClosed));
        assert!(queue.is_closed());
    }

    #[test]
    fn close_wakes_blocked_writer() {
        let queue = Arc::new(ByteQueue::new(1));
        queue.write(b"x").unwrap();
        let writer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.write(b"y"))
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(writer.join().unwrap(), Err(QueueClosed));
    }

    #[test]
    fn buffered_bytes_drain_after_close() {
        let queue = ByteQueue::new(8);
        queue.write(b"tail").unwrap();
        queue.close();

        let mut buf = [0u8; 8];
        assert_eq!(queue.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(queue.read(&mut buf), Err(QueueClosed));
        assert_eq!(queue.write(b"late"), Err(QueueClosed));
    }

    #[test]
    fn push_never_waits_for_room() {
        let queue = ByteQueue::new(4);
        queue.push(b"0123456789").unwrap();
        assert_eq!(queue.len(), 10);

        let mut buf = [0u8; 16];
        assert_eq!(queue.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"0123456789");

        queue.close();
        assert_eq!(queue.push(b"late"), Err(QueueClosed));
    }

    #[test]
    fn wait_empty_returns_once_taken() {
        let queue = Arc::new(ByteQueue::new(8));
        queue.write(b"data").unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_empty())
        };

        thread::sleep(Duration::from_millis(20));
        queue.take(8).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn take_on_empty_is_none() {
        let queue = ByteQueue::new(8);
        assert!(queue.take(8).is_none());
        queue.write(b"a").unwrap();
        assert!(queue.take(0).is_none());
    }
}
