//! Delivery channel between producers and the collector.
//!
//! Not a second buffer: it wraps the ring and adds the "non-empty" wake-up.
//! Waits are always bounded by a timeout so a lost wake cannot stall
//! shutdown.

use futures::future::poll_fn;
use futures::task::AtomicWaker;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use crate::codec::EncodedRecord;
use crate::error::ChannelError;
use crate::model::EventRecord;
use crate::ring::{PublishResult, RingBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

#[derive(Debug)]
pub struct DeliveryChannel {
    ring: Arc<RingBuffer>,
    waker: AtomicWaker,
    // set while the collector sleeps in `wait_for_data`
    parked: AtomicBool,
    invalidated: AtomicBool,
}

impl DeliveryChannel {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self {
            ring,
            waker: AtomicWaker::new(),
            parked: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Producer side: publish and signal non-empty.
    pub fn publish(&self, record: &EventRecord) -> PublishResult {
        let result = self.ring.publish(record);
        self.notify_data();
        result
    }

    /// Wakes the collector only if it is parked. While it is awake this is
    /// a single atomic load; the wake itself is lock-free.
    pub fn notify_data(&self) {
        // pairs with the fence in `wait_for_data`: either we see `parked`
        // or the collector sees the new ticket
        fence(Ordering::SeqCst);
        if self.parked.load(Ordering::Relaxed) && self.parked.swap(false, Ordering::AcqRel) {
            self.waker.wake();
        }
    }

    /// Consumer side. `Ready` as soon as the ring holds anything.
    pub async fn wait_for_data(&self, timeout: Duration) -> Result<WaitOutcome, ChannelError> {
        if self.is_invalidated() {
            return Err(ChannelError::Invalidated);
        }
        if !self.ring.is_empty() {
            return Ok(WaitOutcome::Ready);
        }

        // any wake after registration ends the wait; the caller gets the
        // ring's actual state either way
        let mut registered = false;
        let parked = poll_fn(|cx| {
            if registered {
                return Poll::Ready(());
            }
            registered = true;
            self.waker.register(cx.waker());
            self.parked.store(true, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if self.is_invalidated() || !self.ring.is_empty() || !self.parked.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        // cleared on every exit, including a cancelled wait
        let unpark = Unpark(&self.parked);
        let _ = tokio::time::timeout(timeout, parked).await;
        drop(unpark);

        if self.is_invalidated() {
            return Err(ChannelError::Invalidated);
        }
        if !self.ring.is_empty() {
            Ok(WaitOutcome::Ready)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    pub fn drain_into(&self, max_count: usize, out: &mut Vec<EncodedRecord>) -> usize {
        self.ring.drain_into(max_count, out)
    }

    /// The host transport is gone. Pending and future waits fail.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Wake the consumer without new data, e.g. on detach.
    pub fn wake(&self) {
        self.parked.store(false, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }
}

struct Unpark<'a>(&'a AtomicBool);

impl Drop for Unpark<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
