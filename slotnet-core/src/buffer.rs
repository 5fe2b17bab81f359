//! Bounded message ring.
//!
//! A fixed arena of message slots shared by exactly one producer and one
//! consumer. Each side acquires a slot, works on it in place and releases it;
//! the release is what makes the slot visible to the other side, in FIFO
//! order.
//!
//! ```text
//!            head (consumer)             tail (producer)
//!               v                           v
//!   [ empty ][ filled ][ filled ][ filled ][ empty ][ empty ]
//! ```
//!
//! `0 <= tail - head <= capacity` at all times. Cursors are monotonic
//! counters; a slot index is `cursor % capacity`.
//!
//! The two halves are distinct types that are not `Clone`, and acquiring
//! borrows the half mutably, so the single-producer/single-consumer rule is
//! enforced by the type system. Slot contents sit behind a mutex that is
//! never contended: the cursors guarantee only one side can reach a slot.
//! The ring-wide lock is only taken to park or unpark a blocked thread.

use crate::error::{Result, SlotError};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Callback fired after the other half of the ring made progress.
pub type Notify = Arc<dyn Fn() + Send + Sync>;

/// Receives every message committed to a forwarding producer.
pub type Sink = Box<dyn FnMut(&[u8]) -> Result<()> + Send>;

struct Ring {
    slots: Box<[Mutex<BytesMut>]>,
    slot_length: usize,
    head: AtomicU64,
    tail: AtomicU64,
    closed: AtomicBool,
    parked: AtomicUsize,
    lock: Mutex<()>,
    not_full: Condvar,
    not_empty: Condvar,
    /// Fired after every producer release.
    on_produced: OnceLock<Notify>,
    /// Fired after every consumer release.
    on_consumed: OnceLock<Notify>,
    /// Fired once, when the ring closes.
    on_closed: OnceLock<Notify>,
    close_notified: AtomicBool,
    /// Set for forwarding rings: releases go here instead of to a consumer.
    sink: Option<Mutex<Sink>>,
}

impl Ring {
    #[inline]
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    #[inline]
    fn filled(&self) -> usize {
        let tail = self.tail.load(Ordering::SeqCst);
        let head = self.head.load(Ordering::SeqCst);
        (tail - head) as usize
    }

    #[inline]
    fn slot(&self, cursor: u64) -> &Mutex<BytesMut> {
        &self.slots[(cursor % self.capacity()) as usize]
    }

    fn has_space(&self) -> bool {
        (self.filled() as u64) < self.capacity()
    }

    fn has_data(&self) -> bool {
        self.filled() > 0
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Park until `ready` holds, the ring closes or the deadline passes.
    ///
    /// `data_wins` decides what a closed ring means: a consumer may still
    /// drain committed slots, a producer may not add more.
    fn park(
        &self,
        ready: impl Fn() -> bool,
        cond: &Condvar,
        data_wins: bool,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut guard = self.lock.lock();
        self.parked.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if data_wins && ready() {
                break Ok(());
            }
            if self.is_closed() {
                break Err(SlotError::Closed);
            }
            if !data_wins && ready() {
                break Ok(());
            }
            match deadline {
                None => cond.wait(&mut guard),
                Some(deadline) => {
                    if cond.wait_until(&mut guard, deadline).timed_out() {
                        break if ready() && (data_wins || !self.is_closed()) {
                            Ok(())
                        } else {
                            Err(SlotError::Timeout)
                        };
                    }
                }
            }
        };
        self.parked.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn unpark(&self, cond: &Condvar) {
        if self.parked.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            cond.notify_all();
        }
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let _guard = self.lock.lock();
            self.not_full.notify_all();
            self.not_empty.notify_all();
        }
        self.notify_closed();
        true
    }

    fn notify_closed(&self) {
        if let Some(notify) = self.on_closed.get() {
            if !self.close_notified.swap(true, Ordering::SeqCst) {
                notify();
            }
        }
    }

    fn on_close(&self, notify: Notify) -> Result<()> {
        self.on_closed
            .set(notify)
            .map_err(|_| SlotError::illegal_state("close listener already installed"))?;
        // Closed before the listener went in.
        if self.is_closed() {
            self.notify_closed();
        }
        Ok(())
    }
}

/// Constructor namespace for message rings.
pub struct MessageBuffer;

impl MessageBuffer {
    /// Create a ring of `capacity` slots holding up to `slot_length` bytes each.
    pub fn bounded(capacity: usize, slot_length: usize) -> Result<(BufferProducer, BufferConsumer)> {
        if capacity < 1 {
            return Err(SlotError::config("buffer capacity must be at least 1"));
        }
        let ring = Self::ring(capacity, slot_length, None)?;
        Ok((
            BufferProducer { ring: Arc::clone(&ring) },
            BufferConsumer { ring },
        ))
    }

    /// A producer with no consumer: each release hands the message to `sink`
    /// and returns the sink's outcome.
    ///
    /// Nothing is queued, so `acquire` only blocks for as long as the previous
    /// release is still inside `sink`.
    pub fn forwarding(slot_length: usize, sink: Sink) -> Result<BufferProducer> {
        let ring = Self::ring(1, slot_length, Some(Mutex::new(sink)))?;
        Ok(BufferProducer { ring })
    }

    fn ring(capacity: usize, slot_length: usize, sink: Option<Mutex<Sink>>) -> Result<Arc<Ring>> {
        if slot_length < 1 {
            return Err(SlotError::config("slot length must be at least 1"));
        }
        let slots = (0..capacity)
            .map(|_| Mutex::new(BytesMut::with_capacity(slot_length)))
            .collect();
        let ring = Arc::new(Ring {
            slots,
            slot_length,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            lock: Mutex::new(()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            on_produced: OnceLock::new(),
            on_consumed: OnceLock::new(),
            on_closed: OnceLock::new(),
            close_notified: AtomicBool::new(false),
            sink,
        });
        Ok(ring)
    }
}

/// Writing half of a message ring.
pub struct BufferProducer {
    ring: Arc<Ring>,
}

impl BufferProducer {
    /// Block until a slot is free, then hand it out for writing.
    ///
    /// Fails with [`SlotError::Closed`] once the ring is closed.
    pub fn acquire(&mut self) -> Result<WriteSlot<'_>> {
        self.acquire_inner(None)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&mut self, timeout: Duration) -> Result<WriteSlot<'_>> {
        self.acquire_inner(Some(Instant::now() + timeout))
    }

    /// Non-blocking acquire; `Ok(None)` when the ring is full.
    pub fn try_acquire(&mut self) -> Result<Option<WriteSlot<'_>>> {
        if self.ring.is_closed() {
            return Err(SlotError::Closed);
        }
        if !self.ring.has_space() {
            return Ok(None);
        }
        Ok(Some(self.slot()))
    }

    fn acquire_inner(&mut self, deadline: Option<Instant>) -> Result<WriteSlot<'_>> {
        if self.ring.is_closed() {
            return Err(SlotError::Closed);
        }
        if !self.ring.has_space() {
            let ring = &self.ring;
            ring.park(|| ring.has_space(), &ring.not_full, false, deadline)?;
        }
        Ok(self.slot())
    }

    fn slot(&mut self) -> WriteSlot<'_> {
        let ring: &Ring = &self.ring;
        let cursor = ring.tail.load(Ordering::SeqCst);
        let mut data = ring.slot(cursor).lock();
        data.clear();
        WriteSlot { ring, data, cursor }
    }

    /// Call `notify` whenever the consumer frees a slot.
    pub fn on_space(&self, notify: Notify) -> Result<()> {
        self.ring
            .on_consumed
            .set(notify)
            .map_err(|_| SlotError::illegal_state("space listener already installed"))
    }

    /// Call `notify` once the ring closes, from whichever side closed it.
    pub fn on_close(&self, notify: Notify) -> Result<()> {
        self.ring.on_close(notify)
    }

    /// Copy `payload` into the next slot and commit it.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut slot = self.acquire()?;
        slot.put_slice(payload);
        slot.release()
    }

    pub fn close(&self) -> bool {
        self.ring.close()
    }

    /// A handle that can observe and close the ring without owning this half.
    pub fn handle(&self) -> BufferHandle {
        BufferHandle { ring: Arc::clone(&self.ring) }
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn len(&self) -> usize {
        self.ring.filled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every slot holds a committed message.
    pub fn is_full(&self) -> bool {
        !self.ring.has_space()
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }

    pub fn slot_length(&self) -> usize {
        self.ring.slot_length
    }
}

/// Reading half of a message ring.
pub struct BufferConsumer {
    ring: Arc<Ring>,
}

impl BufferConsumer {
    /// Block until a message is available, then hand it out for reading.
    ///
    /// Messages committed before the ring closed are still delivered; only an
    /// empty, closed ring fails with [`SlotError::Closed`].
    pub fn acquire(&mut self) -> Result<ReadSlot<'_>> {
        self.acquire_inner(None)
    }

    pub fn acquire_timeout(&mut self, timeout: Duration) -> Result<ReadSlot<'_>> {
        self.acquire_inner(Some(Instant::now() + timeout))
    }

    /// Non-blocking acquire; `Ok(None)` when the ring is empty.
    pub fn try_acquire(&mut self) -> Result<Option<ReadSlot<'_>>> {
        if self.ring.has_data() {
            return Ok(Some(self.slot()));
        }
        if self.ring.is_closed() {
            return Err(SlotError::Closed);
        }
        Ok(None)
    }

    fn acquire_inner(&mut self, deadline: Option<Instant>) -> Result<ReadSlot<'_>> {
        if !self.ring.has_data() {
            let ring = &self.ring;
            ring.park(|| ring.has_data(), &ring.not_empty, true, deadline)?;
        }
        Ok(self.slot())
    }

    fn slot(&mut self) -> ReadSlot<'_> {
        let ring: &Ring = &self.ring;
        let cursor = ring.head.load(Ordering::SeqCst);
        let data = ring.slot(cursor).lock();
        ReadSlot { ring, data, cursor }
    }

    /// Call `notify` whenever the producer commits a message.
    pub fn on_available(&self, notify: Notify) -> Result<()> {
        self.ring
            .on_produced
            .set(notify)
            .map_err(|_| SlotError::illegal_state("availability listener already installed"))
    }

    /// Call `notify` once the ring closes, from whichever side closed it.
    pub fn on_close(&self, notify: Notify) -> Result<()> {
        self.ring.on_close(notify)
    }

    /// Take the next message as owned bytes.
    pub fn recv(&mut self) -> Result<Bytes> {
        let slot = self.acquire()?;
        let bytes = Bytes::copy_from_slice(&slot);
        slot.release();
        Ok(bytes)
    }

    pub fn close(&self) -> bool {
        self.ring.close()
    }

    /// A handle that can observe and close the ring without owning this half.
    pub fn handle(&self) -> BufferHandle {
        BufferHandle { ring: Arc::clone(&self.ring) }
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn len(&self) -> usize {
        self.ring.filled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }

    pub fn slot_length(&self) -> usize {
        self.ring.slot_length
    }
}

/// Shared, clonable view of a ring that can only observe or close it.
#[derive(Clone)]
pub struct BufferHandle {
    ring: Arc<Ring>,
}

impl BufferHandle {
    /// Close the ring, waking any blocked acquire. Returns `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        self.ring.close()
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn len(&self) -> usize {
        self.ring.filled()
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }
}

/// A slot acquired by the producer. Dropping it without
/// [`release`](WriteSlot::release) abandons the write.
pub struct WriteSlot<'a> {
    ring: &'a Ring,
    data: MutexGuard<'a, BytesMut>,
    cursor: u64,
}

impl WriteSlot<'_> {
    /// Commit the slot to the consumer.
    ///
    /// The payload must be non-empty and fit the slot length; otherwise the
    /// write is discarded and the slot stays free. On a forwarding ring the
    /// message is handed to the sink before this returns.
    pub fn release(self) -> Result<()> {
        let length = self.data.len();
        let max = self.ring.slot_length;
        if length < 1 || length > max {
            return Err(SlotError::InvalidLength { length, min: 1, max });
        }
        let Self { ring, mut data, cursor } = self;
        if let Some(sink) = &ring.sink {
            let mut sink = sink.lock();
            let outcome = (&mut **sink)(&data[..]);
            data.clear();
            return outcome;
        }
        drop(data);
        ring.tail.store(cursor + 1, Ordering::SeqCst);
        ring.unpark(&ring.not_empty);
        if let Some(notify) = ring.on_produced.get() {
            notify();
        }
        Ok(())
    }
}

impl Deref for WriteSlot<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.data
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

/// A slot acquired by the consumer. Dropping it without
/// [`release`](ReadSlot::release) leaves the message at the head of the ring.
pub struct ReadSlot<'a> {
    ring: &'a Ring,
    data: MutexGuard<'a, BytesMut>,
    cursor: u64,
}

impl ReadSlot<'_> {
    /// Hand the slot back to the producer.
    pub fn release(self) {
        let Self { ring, data, cursor } = self;
        drop(data);
        ring.head.store(cursor + 1, Ordering::SeqCst);
        ring.unpark(&ring.not_full);
        if let Some(notify) = ring.on_consumed.get() {
            notify();
        }
    }
}

impl Deref for ReadSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for BufferProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferProducer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Debug for BufferConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferConsumer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}
