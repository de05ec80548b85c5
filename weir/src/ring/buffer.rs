use std::{
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::sync::Notify;

/// Default arena size: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum RingError {
    /// The write did not fit into the free span. Nothing was written.
    #[error("ring full: {requested} bytes requested, {free} free")]
    Full { requested: usize, free: usize },

    /// A record length prefix larger than the arena was requested.
    #[error("record of {requested} bytes can never fit capacity {capacity}")]
    Oversized { requested: usize, capacity: usize },

    /// The waiting read was cancelled by session teardown.
    #[error("ring read cancelled")]
    Cancelled,
}

/// Shared state behind both handles. The arena is kept as raw parts so the
/// two sides can copy into disjoint spans without ever materializing a
/// reference to the whole buffer.
struct Shared {
    arena: *mut u8,
    /// Monotonic read counter; offset into the arena is `head & mask`.
    head: AtomicU64,
    /// Monotonic write counter; offset into the arena is `tail & mask`.
    tail: AtomicU64,
    mask: u64,
    /// Pinged by the producer after each successful write.
    data_ready: Notify,
}

// The producer only writes bytes in `[tail, tail + n)` before publishing
// `tail + n`, and the consumer only reads bytes in `[head, tail)` before
// publishing a new `head`. The two handles never touch the same span at the
// same time, which is what makes the unsynchronized arena access sound.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Drop for Shared {
    fn drop(&mut self) {
        let capacity = (self.mask + 1) as usize;
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.arena, capacity,
            )));
        }
    }
}

/// Fixed-capacity circular byte arena. Construct, then [`split`].
///
/// [`split`]: RingBuffer::split
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Create an arena of `capacity` bytes. `capacity` must be a nonzero
    /// power of two; configuration validates this before construction, and
    /// the constructor enforces it again.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {capacity}"
        );
        let arena = Box::into_raw(vec![0u8; capacity].into_boxed_slice()) as *mut u8;
        Self {
            shared: Arc::new(Shared {
                arena,
                head: AtomicU64::new(0),
                tail: AtomicU64::new(0),
                mask: (capacity as u64) - 1,
                data_ready: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.shared.mask + 1) as usize
    }

    /// Split into the two sides of the channel. Each handle is the only one
    /// of its kind for this arena.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let producer = RingProducer {
            shared: self.shared.clone(),
        };
        let consumer = RingConsumer {
            shared: self.shared,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        (producer, consumer)
    }
}

impl Shared {
    #[inline]
    fn capacity(&self) -> u64 {
        self.mask + 1
    }

    /// Copy `src` into the arena at logical position `at`, splitting the
    /// copy in two when the span crosses the end of the arena.
    ///
    /// Caller must own the span `[at, at + src.len())`.
    unsafe fn copy_in(&self, at: u64, src: &[u8]) {
        let capacity = (self.mask + 1) as usize;
        let offset = (at & self.mask) as usize;
        let until_end = capacity - offset;
        unsafe {
            if src.len() <= until_end {
                ptr::copy_nonoverlapping(src.as_ptr(), self.arena.add(offset), src.len());
            } else {
                ptr::copy_nonoverlapping(src.as_ptr(), self.arena.add(offset), until_end);
                ptr::copy_nonoverlapping(
                    src.as_ptr().add(until_end),
                    self.arena,
                    src.len() - until_end,
                );
            }
        }
    }

    /// Copy out of the arena at logical position `at` into `dst`, splitting
    /// the copy when the span wraps.
    ///
    /// Caller must own the span `[at, at + dst.len())`.
    unsafe fn copy_out(&self, at: u64, dst: &mut [u8]) {
        let capacity = (self.mask + 1) as usize;
        let offset = (at & self.mask) as usize;
        let until_end = capacity - offset;
        unsafe {
            if dst.len() <= until_end {
                ptr::copy_nonoverlapping(self.arena.add(offset), dst.as_mut_ptr(), dst.len());
            } else {
                ptr::copy_nonoverlapping(self.arena.add(offset), dst.as_mut_ptr(), until_end);
                ptr::copy_nonoverlapping(
                    self.arena,
                    dst.as_mut_ptr().add(until_end),
                    dst.len() - until_end,
                );
            }
        }
    }
}

/// Writer handle. Lives on the packet path; every operation is wait-free.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Bytes currently free for writing.
    pub fn free(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        (self.shared.capacity() - (tail - head)) as usize
    }

    /// Append `bytes` whole, or fail without writing anything.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        let free = self.free();
        if bytes.len() > free {
            return Err(RingError::Full {
                requested: bytes.len(),
                free,
            });
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        // Sound: `[tail, tail + len)` is unreachable by the consumer until
        // the store below publishes it.
        unsafe { self.shared.copy_in(tail, bytes) };
        self.shared
            .tail
            .store(tail + bytes.len() as u64, Ordering::Release);
        self.shared.data_ready.notify_waiters();
        Ok(())
    }

    /// Append one length-prefixed record (`u32` little-endian prefix, then
    /// the record bytes), whole or not at all.
    pub fn write_record(&mut self, record: &[u8]) -> Result<(), RingError> {
        let framed_len = 4 + record.len();
        if framed_len > self.shared.capacity() as usize {
            return Err(RingError::Oversized {
                requested: framed_len,
                capacity: self.shared.capacity() as usize,
            });
        }
        let free = self.free();
        if framed_len > free {
            return Err(RingError::Full {
                requested: framed_len,
                free,
            });
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let prefix = (record.len() as u32).to_le_bytes();
        unsafe {
            self.shared.copy_in(tail, &prefix);
            self.shared.copy_in(tail + 4, record);
        }
        self.shared
            .tail
            .store(tail + framed_len as u64, Ordering::Release);
        self.shared.data_ready.notify_waiters();
        Ok(())
    }
}

/// Reader handle. Belongs to the control session; the only place in the
/// core allowed to suspend on ring state.
pub struct RingConsumer {
    shared: Arc<Shared>,
    cancelled: Arc<AtomicBool>,
}

impl RingConsumer {
    /// Bytes currently buffered.
    pub fn available(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Acquire);
        let head = self.shared.head.load(Ordering::Relaxed);
        (tail - head) as usize
    }

    /// Non-blocking drain: copy up to `buf.len()` buffered bytes, advance
    /// the read counter, return the count (possibly zero).
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let tail = self.shared.tail.load(Ordering::Acquire);
        let head = self.shared.head.load(Ordering::Relaxed);
        let available = (tail - head) as usize;
        let n = available.min(buf.len());
        if n == 0 {
            return 0;
        }
        unsafe { self.shared.copy_out(head, &mut buf[..n]) };
        self.shared.head.store(head + n as u64, Ordering::Release);
        n
    }

    /// Pop the next length-prefixed record, or `None` when no complete
    /// record is buffered.
    pub fn next_record(&mut self) -> Option<Vec<u8>> {
        let tail = self.shared.tail.load(Ordering::Acquire);
        let head = self.shared.head.load(Ordering::Relaxed);
        let available = (tail - head) as usize;
        if available < 4 {
            return None;
        }
        let mut prefix = [0u8; 4];
        unsafe { self.shared.copy_out(head, &mut prefix) };
        let record_len = u32::from_le_bytes(prefix) as usize;
        if available < 4 + record_len {
            return None;
        }
        let mut record = vec![0u8; record_len];
        unsafe { self.shared.copy_out(head + 4, &mut record) };
        self.shared
            .head
            .store(head + 4 + record_len as u64, Ordering::Release);
        Some(record)
    }

    /// Waiting drain: suspends until data arrives or the read is cancelled.
    ///
    /// Control-session context only. Returns the bytes copied, or
    /// [`RingError::Cancelled`] once [`cancel_token`] fires.
    ///
    /// [`cancel_token`]: RingConsumer::cancel_token
    pub async fn read_wait(&mut self, buf: &mut [u8]) -> Result<usize, RingError> {
        loop {
            let shared = self.shared.clone();
            let notified = shared.data_ready.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a write or cancel
            // landing between the check and the await cannot be lost.
            notified.as_mut().enable();

            if self.cancelled.load(Ordering::Acquire) {
                return Err(RingError::Cancelled);
            }
            let n = self.read(buf);
            if n > 0 {
                return Ok(n);
            }
            notified.await;
        }
    }

    /// Token that cancels a suspended [`read_wait`] from another task.
    ///
    /// [`read_wait`]: RingConsumer::read_wait
    pub fn cancel_token(&self) -> RingCancelToken {
        RingCancelToken {
            cancelled: self.cancelled.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Clear a previous cancellation so the handle can serve a new session.
    pub fn reset_cancel(&mut self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

/// Cancels the consumer's suspended read. Held by session teardown.
pub struct RingCancelToken {
    cancelled: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl RingCancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.shared.data_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_in_order() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(64).split();
        tx.write(b"hello ring").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(rx.read(&mut buf), 10);
        assert_eq!(&buf, b"hello ring");
    }

    #[test]
    fn overflow_fails_whole_and_leaves_indices() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(16).split();
        tx.write(&[1u8; 12]).unwrap();
        let err = tx.write(&[2u8; 8]).unwrap_err();
        assert!(matches!(err, RingError::Full { requested: 8, free: 4 }));

        // The failed write must not have moved tail: exactly the original
        // 12 bytes drain back out.
        let mut buf = [0u8; 16];
        assert_eq!(rx.read(&mut buf), 12);
        assert!(buf[..12].iter().all(|&b| b == 1));
    }

    #[test]
    fn wrap_around_round_trip() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(16).split();

        // Advance head == tail == 12 so the next span crosses the boundary.
        tx.write(&[0u8; 12]).unwrap();
        let mut scratch = [0u8; 12];
        assert_eq!(rx.read(&mut scratch), 12);

        let payload: Vec<u8> = (1u8..=8).collect();
        tx.write(&payload).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(rx.read(&mut buf), 8);
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn fill_to_exact_capacity() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(16).split();
        tx.write(&[7u8; 16]).unwrap();
        assert_eq!(tx.free(), 0);
        assert!(matches!(tx.write(&[0u8; 1]), Err(RingError::Full { .. })));
        let mut buf = [0u8; 16];
        assert_eq!(rx.read(&mut buf), 16);
        assert_eq!(tx.free(), 16);
    }

    #[test]
    fn record_framing_round_trip() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(64).split();
        tx.write_record(b"first").unwrap();
        tx.write_record(b"second").unwrap();
        assert_eq!(rx.next_record().unwrap(), b"first");
        assert_eq!(rx.next_record().unwrap(), b"second");
        assert!(rx.next_record().is_none());
    }

    #[test]
    fn record_framing_across_wrap() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(32).split();
        tx.write(&[0u8; 28]).unwrap();
        let mut scratch = [0u8; 28];
        assert_eq!(rx.read(&mut scratch), 28);

        // 4-byte prefix lands in the tail segment, record bytes wrap.
        tx.write_record(b"wrapping record").unwrap();
        assert_eq!(rx.next_record().unwrap(), b"wrapping record");
    }

    #[test]
    fn oversized_record_rejected_up_front() {
        let (mut tx, _rx) = RingBuffer::with_capacity(16).split();
        let err = tx.write_record(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, RingError::Oversized { .. }));
    }

    #[tokio::test]
    async fn read_wait_wakes_on_write() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(64).split();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = rx.read_wait(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        // Give the reader a chance to park first.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tx.write(b"wake up").unwrap();
        assert_eq!(reader.await.unwrap(), b"wake up");
    }

    #[tokio::test]
    async fn read_wait_cancelled_by_token() {
        let (_tx, mut rx) = RingBuffer::with_capacity(64).split();
        let token = rx.cancel_token();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            rx.read_wait(&mut buf).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        assert!(matches!(reader.await.unwrap(), Err(RingError::Cancelled)));
    }
}
