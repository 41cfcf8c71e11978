//! Publish admission for detach.
//!
//! Adapters enter the gate around every publish. `close_and_wait` refuses
//! new entries and returns once the in-flight ones have left, after which
//! no publish can reach the ring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const CLOSED: u64 = 1 << 63;

#[derive(Debug, Default)]
pub struct RundownGate {
    /// high bit = closed, low bits = publishes in flight
    state: AtomicU64,
}

pub struct GateGuard<'a> {
    gate: &'a RundownGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.state.fetch_sub(1, Ordering::Release);
    }
}

impl RundownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking. `None` once the gate is closed.
    #[inline]
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        let prev = self.state.fetch_add(1, Ordering::Acquire);
        if prev & CLOSED != 0 {
            self.state.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(GateGuard { gate: self })
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    pub fn in_flight(&self) -> u64 {
        self.state.load(Ordering::Acquire) & !CLOSED
    }

    pub fn close(&self) {
        self.state.fetch_or(CLOSED, Ordering::AcqRel);
    }

    /// Close, then wait for in-flight publishes. Publishes are short
    /// copies, so a brief poll is enough.
    pub async fn close_and_wait(&self) {
        self.close();
        while self.in_flight() != 0 {
            tokio::time::sleep(Duration::from_micros(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn closed_gate_refuses_entry() {
        let gate = RundownGate::new();
        {
            let _g = gate.try_enter().unwrap();
            assert_eq!(gate.in_flight(), 1);
        }
        assert_eq!(gate.in_flight(), 0);
        gate.close();
        assert!(gate.try_enter().is_none());
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_publish() {
        let gate = Arc::new(RundownGate::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let worker = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                let _g = gate.try_enter().unwrap();
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close_and_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());
        assert!(gate.try_enter().is_none());

        release_tx.send(()).unwrap();
        closer.await.unwrap();
        worker.join().unwrap();
        assert_eq!(gate.in_flight(), 0);
    }
}
