//! Per-(workstream, protocol) work queue
//!
//! A singly linked FIFO threaded through each unit's own `next` slot.
//! The queue owns the chain of boxes from `head`; `tail` is a raw pointer
//! into the last box so appends are O(1).
//!
//! Invariants:
//! - `len` equals the number of linked units
//! - `head.is_none() == tail.is_null() == (len == 0)`
//! - `tail` is reachable from `head` by following links
//!
//! The queue has no lock of its own; the owning workstream's mutex
//! serializes every access.

use core::ptr;

use crate::packet::Packet;

/// Cumulative counters for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    /// Units run inline by direct dispatch
    pub dispatched: u64,
    /// Units rejected because the queue was at its limit
    pub drops: u64,
    /// Units accepted onto the queue
    pub queued: u64,
    /// Units handed to the handler (inline or by the worker)
    pub handled: u64,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub watermark: usize,
    pub limit: usize,
    pub counters: QueueCounters,
}

pub struct WorkQueue<P: Packet> {
    head: Option<Box<P>>,
    tail: *mut P,
    len: usize,
    limit: usize,
    watermark: usize,
    counters: QueueCounters,
}

// Safety: `tail` only ever points into the chain owned by `head`, so the
// queue is exactly as sendable as the boxes it owns.
unsafe impl<P: Packet> Send for WorkQueue<P> {}

impl<P: Packet> WorkQueue<P> {
    /// Create an empty queue with limit 0 (an unregistered protocol slot)
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: ptr::null_mut(),
            len: 0,
            limit: 0,
            watermark: 0,
            counters: QueueCounters {
                dispatched: 0,
                drops: 0,
                queued: 0,
                handled: 0,
            },
        }
    }

    /// Create an empty queue accepting up to `limit` units
    pub fn with_limit(limit: usize) -> Self {
        let mut q = Self::new();
        q.limit = limit;
        q
    }

    /// Append a unit at the tail
    ///
    /// At the limit the drop counter is bumped and the unit is handed back
    /// untouched so the caller can dispose of it outside any lock.
    pub fn push(&mut self, mut unit: Box<P>) -> Result<(), Box<P>> {
        if self.len >= self.limit {
            self.counters.drops += 1;
            return Err(unit);
        }

        debug_assert!(unit.next_slot().is_none(), "unit already linked");
        *unit.next_slot() = None;

        let raw: *mut P = &mut *unit;
        if self.tail.is_null() {
            self.head = Some(unit);
        } else {
            // Safety: tail points at the last box in our own chain and we
            // hold `&mut self`.
            unsafe {
                *(*self.tail).next_slot() = Some(unit);
            }
        }
        self.tail = raw;

        self.len += 1;
        self.counters.queued += 1;
        if self.len > self.watermark {
            self.watermark = self.len;
        }
        Ok(())
    }

    /// Remove the head unit
    pub fn pop(&mut self) -> Option<Box<P>> {
        let mut unit = self.head.take()?;
        self.head = unit.next_slot().take();
        if self.head.is_none() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        Some(unit)
    }

    /// Detach the whole chain, leaving an empty queue behind
    ///
    /// Counters, limit and watermark are left alone.
    pub fn detach(&mut self) -> Batch<P> {
        let batch = Batch {
            head: self.head.take(),
            len: self.len,
        };
        self.tail = ptr::null_mut();
        self.len = 0;
        batch
    }

    /// Detach the chain and return the queue to its unregistered state
    pub fn flush(&mut self) -> Batch<P> {
        let batch = self.detach();
        self.limit = 0;
        self.watermark = 0;
        self.counters = QueueCounters::default();
        batch
    }

    /// Reinitialize an empty queue for a freshly registered protocol
    pub fn reset(&mut self, limit: usize) {
        debug_assert!(self.is_empty(), "reset of a non-empty queue");
        self.limit = limit;
        self.watermark = 0;
        self.counters = QueueCounters::default();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Change the limit; units already queued beyond it stay queued
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    #[inline]
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    #[inline]
    pub fn counters(&self) -> QueueCounters {
        self.counters
    }

    /// Account one unit run inline by direct dispatch
    #[inline]
    pub fn record_inline(&mut self) {
        self.counters.dispatched += 1;
        self.counters.handled += 1;
    }

    /// Account `n` units run by the worker
    #[inline]
    pub fn record_handled(&mut self, n: usize) {
        self.counters.handled += n as u64;
    }

    pub fn clear_drops(&mut self) {
        self.counters.drops = 0;
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.len,
            watermark: self.watermark,
            limit: self.limit,
            counters: self.counters,
        }
    }
}

impl<P: Packet> Default for WorkQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Packet> Drop for WorkQueue<P> {
    fn drop(&mut self) {
        // Unlink iteratively; a recursive Box drop can blow the stack on
        // long chains.
        drop(self.detach());
    }
}

/// A detached chain of units, yielded in FIFO order
///
/// Units not consumed by iteration are disposed of when the batch drops.
pub struct Batch<P: Packet> {
    head: Option<Box<P>>,
    len: usize,
}

impl<P: Packet> Batch<P> {
    pub const fn empty() -> Self {
        Self { head: None, len: 0 }
    }

    /// Units remaining in the batch
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<P: Packet> Iterator for Batch<P> {
    type Item = Box<P>;

    fn next(&mut self) -> Option<Box<P>> {
        let mut unit = self.head.take()?;
        self.head = unit.next_slot().take();
        self.len -= 1;
        Some(unit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<P: Packet> ExactSizeIterator for Batch<P> {}

impl<P: Packet> Drop for Batch<P> {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}
