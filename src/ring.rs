//! Multi-producer / single-consumer ring of encoded records with
//! overwrite-on-full.
//!
//! Every publish takes a sequence number from the ring's own `Sequencer`
//! and derives its slot ticket from it (`ticket = sequence - base - 1`),
//! so slot order is sequence order and drain returns a total order across
//! all producers. A slot is guarded by a one-byte spin lock held only for
//! the 512-byte copy; producers never wait on the consumer.
//!
//! Loss accounting: a record is dropped either when a later ticket
//! overwrites it before it was drained (`Overwritten`) or when its own
//! slot already holds a later ticket by the time it lands (`Superseded`).
//! Both bump `dropped_count` exactly once per lost record.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::codec::{encode_into, peek_sequence, EncodedRecord, RECORD_SIZE};
use crate::error::SensorError;
use crate::model::EventRecord;
use crate::sequencer::Sequencer;

pub const MAX_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    /// Landed in an empty or already drained slot.
    Stored,
    /// Landed on top of an undrained record; carries that record's sequence.
    Overwritten(u64),
    /// A later record already owns the slot; this one is lost.
    Superseded,
}

impl PublishResult {
    pub fn lost_a_record(self) -> bool {
        !matches!(self, PublishResult::Stored)
    }
}

struct SlotData {
    occupied: bool,
    consumed: bool,
    ticket: u64,
    block: EncodedRecord,
}

struct Slot {
    locked: AtomicBool,
    data: UnsafeCell<SlotData>,
}

// `data` is only touched through a `SlotGuard`, which holds `locked`.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(SlotData {
                occupied: false,
                consumed: false,
                ticket: 0,
                block: [0u8; RECORD_SIZE],
            }),
        }
    }

    #[inline]
    fn lock(&self) -> SlotGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SlotGuard { slot: self }
    }
}

struct SlotGuard<'a> {
    slot: &'a Slot,
}

impl Deref for SlotGuard<'_> {
    type Target = SlotData;

    fn deref(&self) -> &SlotData {
        // SAFETY: the guard holds the slot lock.
        unsafe { &*self.slot.data.get() }
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut SlotData {
        // SAFETY: the guard holds the slot lock exclusively.
        unsafe { &mut *self.slot.data.get() }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.locked.store(false, Ordering::Release);
    }
}

pub struct RingBuffer {
    slots: Box<[Slot]>,
    mask: u64,
    sequencer: Sequencer,
    /// last sequence issued before this ring existed
    base: u64,
    /// consumer-only
    tail: AtomicU64,
    dropped: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self, SensorError> {
        Self::with_sequencer(capacity, Sequencer::new())
    }

    /// Build a ring that continues numbering after `sequencer`'s last value,
    /// e.g. across a detach / re-attach cycle.
    pub fn with_sequencer(capacity: usize, sequencer: Sequencer) -> Result<Self, SensorError> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(SensorError::InvalidCapacity(capacity));
        }
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        let base = sequencer.last_assigned();
        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            sequencer,
            base,
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Stamp `record` with the next sequence number and store it. Never
    /// blocks beyond the slot copy and never allocates.
    pub fn publish(&self, record: &EventRecord) -> PublishResult {
        let sequence = self.sequencer.assign_sequence();
        let ticket = sequence - self.base - 1;

        let mut stamped = *record;
        stamped.sequence = sequence;

        let mut slot = self.slots[(ticket & self.mask) as usize].lock();
        if slot.occupied && slot.ticket > ticket {
            drop(slot);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return PublishResult::Superseded;
        }
        let result = if slot.occupied && !slot.consumed {
            PublishResult::Overwritten(peek_sequence(&slot.block))
        } else {
            PublishResult::Stored
        };
        encode_into(&stamped, &mut slot.block);
        slot.ticket = ticket;
        slot.occupied = true;
        slot.consumed = false;
        drop(slot);

        if result.lost_a_record() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Append up to `max_count` records, oldest first, to `out`. Must only
    /// be called from the single consumer. Stops early at a slot whose
    /// producer has taken its sequence but not finished the copy.
    pub fn drain_into(&self, max_count: usize, out: &mut Vec<EncodedRecord>) -> usize {
        let head = self.sequencer.last_assigned() - self.base;
        let mut tail = self.tail.load(Ordering::Relaxed);
        let cap = self.slots.len() as u64;
        if head.saturating_sub(tail) > cap {
            // everything older than one lap is gone; already counted
            tail = head - cap;
        }

        let mut taken = 0;
        while tail < head && taken < max_count {
            let mut slot = self.slots[(tail & self.mask) as usize].lock();
            if !slot.occupied || slot.ticket < tail {
                // producer for `tail` still in flight
                break;
            }
            if slot.ticket == tail {
                out.push(slot.block);
                slot.consumed = true;
                taken += 1;
            }
            tail += 1;
        }
        self.tail.store(tail, Ordering::Relaxed);
        taken
    }

    pub fn drain(&self, max_count: usize) -> Vec<EncodedRecord> {
        let mut out = Vec::with_capacity(max_count.min(self.slots.len()));
        self.drain_into(max_count, &mut out);
        out
    }

    /// Records lost to overwrite since construction. Approximate while
    /// producers are running.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Undrained tickets, capped at capacity. Includes in-flight publishes.
    pub fn len(&self) -> usize {
        let head = self.sequencer.last_assigned() - self.base;
        let tail = self.tail.load(Ordering::Relaxed);
        head.saturating_sub(tail).min(self.slots.len() as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequencer.last_assigned()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("dropped", &self.dropped_count())
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}
