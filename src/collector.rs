//! User-mode collector loop.
//!
//! ```text
//! Attached ─▶ Draining ─▶ Delivering ─┐
//!                 ▲          Idle ◀───┤   (wait timed out)
//!                 └───────────────────┘
//! detach / fatal ─▶ FinalDrain ─▶ Closed
//! ```
//!
//! One task owns the consumer side of the ring. A corrupt record is logged
//! and skipped; a dead channel or a closed output ends the loop through
//! the same final drain an ordinary detach takes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterSet, CounterSnapshot};
use crate::channel::{DeliveryChannel, WaitOutcome};
use crate::codec::{decode, peek_sequence, EncodedRecord};
use crate::config::SensorConfig;
use crate::dedup::{DedupWindow, Fingerprint, Verdict};
use crate::model::EventRecord;
use crate::risk::{analyze_risk_tags, RiskTags};
use crate::sequencer::monotonic_ns;

/// Yields allowed while waiting out a producer mid-copy during the final drain.
const FINAL_DRAIN_SPINS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectorState {
    Attached,
    Draining,
    Delivering,
    Idle,
    FinalDrain,
    Closed,
}

/// Maps monotonic record timestamps onto wall-clock, anchored once.
#[derive(Debug, Clone, Copy)]
pub struct ClockAnchor {
    mono_ns: u64,
    wall: DateTime<Utc>,
}

impl ClockAnchor {
    pub fn now() -> Self {
        Self {
            mono_ns: monotonic_ns(),
            wall: Utc::now(),
        }
    }

    pub fn wall_clock(&self, timestamp_ns: u64) -> DateTime<Utc> {
        let delta = timestamp_ns as i128 - self.mono_ns as i128;
        let delta = delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        self.wall + chrono::Duration::nanoseconds(delta)
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectedEvent {
    #[serde(flatten)]
    pub record: EventRecord,
    pub observed_at: DateTime<Utc>,
    /// identical events folded into this one by the de-duplicator
    #[serde(skip_serializing_if = "is_zero")]
    pub repeats: u64,
    #[serde(skip_serializing_if = "RiskTags::is_empty")]
    pub tags: RiskTags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SensorStats {
    /// ring overwrites since attach
    pub dropped_total: u64,
    /// overwrites since the previous stats event
    pub dropped_delta: u64,
    pub gaps: u64,
    pub lost_in_gaps: u64,
    pub decode_errors: u64,
    pub suppressed: u64,
    pub delivered: u64,
    pub last_sequence: u64,
    pub adapters: CounterSnapshot,
}

impl SensorStats {
    /// Equal apart from the per-event delta.
    fn same_totals(&self, other: &SensorStats) -> bool {
        SensorStats {
            dropped_delta: 0,
            ..*self
        } == SensorStats {
            dropped_delta: 0,
            ..*other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Emitted {
    Event(CollectedEvent),
    Stats(SensorStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorExit {
    Detached,
    ChannelInvalidated,
    OutputClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorReport {
    pub exit: CollectorExit,
    pub stats: SensorStats,
}

impl CollectorReport {
    pub fn is_fatal(&self) -> bool {
        self.exit != CollectorExit::Detached
    }
}

/// Ready signal and the two shutdown tokens: `cancel` is raised by the
/// owner on detach, `detach_requested` is raised by the collector when it
/// hits a fatal error and needs the owner to detach.
#[derive(Default)]
pub struct RunOptions {
    pub ready_tx: Option<mpsc::Sender<()>>,
    pub cancellation_token: CancellationToken,
    pub detach_requested: CancellationToken,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ready(mut self, ready_tx: mpsc::Sender<()>) -> Self {
        self.ready_tx = Some(ready_tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn with_detach_request(mut self, token: CancellationToken) -> Self {
        self.detach_requested = token;
        self
    }
}

pub struct Collector {
    channel: Arc<DeliveryChannel>,
    adapters: Arc<AdapterSet>,
    drain_batch: usize,
    wait_timeout: Duration,
    stats_interval: Option<Duration>,
    sweep_interval: Duration,
    dedup: DedupWindow,
    anchor: ClockAnchor,
    state: CollectorState,
    stats: SensorStats,
    last_reported: SensorStats,
    expected_next: u64,
    blocks: Vec<EncodedRecord>,
    pending: Vec<Emitted>,
    stats_dirty: bool,
    output_closed: bool,
}

impl Collector {
    pub fn new(channel: Arc<DeliveryChannel>, adapters: Arc<AdapterSet>, cfg: &SensorConfig) -> Self {
        let expected_next = channel.ring().last_sequence() + 1;
        Self {
            drain_batch: cfg.drain_batch.max(1),
            wait_timeout: cfg.wait_timeout(),
            stats_interval: cfg.stats_interval(),
            sweep_interval: cfg.dedup.max_age().max(cfg.wait_timeout()),
            dedup: DedupWindow::new(&cfg.dedup),
            anchor: ClockAnchor::now(),
            state: CollectorState::Attached,
            stats: SensorStats::default(),
            last_reported: SensorStats::default(),
            expected_next,
            blocks: Vec::with_capacity(cfg.drain_batch.max(1)),
            pending: Vec::new(),
            stats_dirty: false,
            output_closed: false,
            channel,
            adapters,
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn stats(&self) -> SensorStats {
        self.stats
    }

    pub async fn run(mut self, out: mpsc::Sender<Emitted>, opts: RunOptions) -> CollectorReport {
        let RunOptions {
            ready_tx,
            cancellation_token: cancel,
            detach_requested,
        } = opts;
        if let Some(tx) = ready_tx {
            let _ = tx.send(()).await;
        }
        info!(
            capacity = self.channel.ring().capacity(),
            first_sequence = self.expected_next,
            "collector attached"
        );

        let mut exit = CollectorExit::Detached;
        let mut next_stats = self.stats_interval.map(|i| Instant::now() + i);
        let mut next_sweep = Instant::now() + self.sweep_interval;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.channel.wait_for_data(self.wait_timeout) => r,
            };

            match waited {
                Ok(WaitOutcome::Ready) => {
                    self.state = CollectorState::Draining;
                    self.drain_once();
                    self.state = CollectorState::Delivering;
                    self.flush(&out).await;
                }
                Ok(WaitOutcome::TimedOut) => self.state = CollectorState::Idle,
                Err(e) => {
                    error!(error = %e, "delivery channel failed; detaching");
                    exit = CollectorExit::ChannelInvalidated;
                    break;
                }
            }

            if self.output_closed {
                error!("output receiver closed; detaching");
                exit = CollectorExit::OutputClosed;
                break;
            }

            if Instant::now() >= next_sweep {
                let evicted = self.dedup.evict_expired(monotonic_ns());
                if evicted > 0 {
                    debug!(evicted, "dedup entries aged out");
                }
                next_sweep = Instant::now() + self.sweep_interval;
            }

            if let (Some(at), Some(interval)) = (next_stats, self.stats_interval) {
                if Instant::now() >= at {
                    if !self.stats_totals_unchanged() {
                        self.queue_stats();
                        self.flush(&out).await;
                    }
                    next_stats = Some(Instant::now() + interval);
                }
            }
        }

        if exit != CollectorExit::Detached {
            detach_requested.cancel();
        }

        self.final_drain(&out).await;
        self.queue_stats();
        self.flush(&out).await;
        self.state = CollectorState::Closed;
        info!(
            delivered = self.stats.delivered,
            dropped = self.stats.dropped_total,
            gaps = self.stats.gaps,
            suppressed = self.stats.suppressed,
            "collector closed"
        );
        CollectorReport {
            exit,
            stats: self.stats,
        }
    }

    async fn final_drain(&mut self, out: &mpsc::Sender<Emitted>) {
        self.state = CollectorState::FinalDrain;
        let mut spins = 0;
        loop {
            let n = self.drain_once();
            self.flush(out).await;
            if n > 0 {
                continue;
            }
            if self.channel.ring().is_empty() || spins >= FINAL_DRAIN_SPINS {
                break;
            }
            spins += 1;
            tokio::task::yield_now().await;
        }
    }

    /// One drain into `pending`, followed by a stats event if the batch
    /// showed loss. Returns blocks drained.
    fn drain_once(&mut self) -> usize {
        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.clear();
        let n = self.channel.drain_into(self.drain_batch, &mut blocks);
        self.note_overwrites();
        for block in &blocks {
            self.process_block(block);
        }
        self.blocks = blocks;
        if self.stats_dirty {
            self.queue_stats();
        }
        n
    }

    fn note_overwrites(&mut self) {
        let dropped = self.channel.ring().dropped_count();
        if dropped > self.stats.dropped_total {
            let delta = dropped - self.stats.dropped_total;
            warn!(delta, total = dropped, "ring overwrote undrained records");
            self.stats.dropped_total = dropped;
            self.stats_dirty = true;
        }
    }

    /// Decode, gap-check, de-duplicate and tag one block.
    pub(crate) fn process_block(&mut self, block: &EncodedRecord) {
        let record = match decode(block) {
            Ok(r) => r,
            Err(e) => {
                self.stats.decode_errors += 1;
                let seq = peek_sequence(block);
                warn!(error = %e, sequence = seq, "skipping undecodable record");
                if seq == self.expected_next {
                    self.expected_next = seq + 1;
                }
                return;
            }
        };

        let seq = record.sequence;
        if seq > self.expected_next {
            let lost = seq - self.expected_next;
            self.stats.gaps += 1;
            self.stats.lost_in_gaps += lost;
            debug!(expected = self.expected_next, got = seq, lost, "sequence gap");
            self.stats_dirty = true;
        } else if seq < self.expected_next {
            warn!(expected = self.expected_next, got = seq, "sequence went backwards");
        }
        self.expected_next = self.expected_next.max(seq + 1);
        self.stats.last_sequence = self.stats.last_sequence.max(seq);

        match self.dedup.check_fingerprint(Fingerprint::of_block(block), &record) {
            Verdict::Suppress => {
                self.stats.suppressed = self.dedup.suppressed_total();
            }
            Verdict::Emit { repeats } => {
                self.stats.delivered += 1;
                self.pending.push(Emitted::Event(CollectedEvent {
                    observed_at: self.anchor.wall_clock(record.timestamp_ns),
                    repeats,
                    tags: analyze_risk_tags(&record),
                    record,
                }));
            }
        }
    }

    fn stats_totals_unchanged(&mut self) -> bool {
        self.stats.adapters = self.adapters.totals();
        self.stats.same_totals(&self.last_reported)
    }

    fn queue_stats(&mut self) {
        let adapters = self.adapters.totals();
        let prev = self.last_reported.adapters;
        if adapters.observation_errors > prev.observation_errors {
            warn!(
                new = adapters.observation_errors - prev.observation_errors,
                "adapters failed to normalise notifications"
            );
        }
        self.stats.adapters = adapters;
        self.stats.dropped_delta = self.stats.dropped_total - self.last_reported.dropped_total;
        self.last_reported = self.stats;
        self.stats_dirty = false;
        self.pending.push(Emitted::Stats(self.stats));
    }

    async fn flush(&mut self, out: &mpsc::Sender<Emitted>) {
        for item in self.pending.drain(..) {
            if self.output_closed {
                continue;
            }
            if out.send(item).await.is_err() {
                self.output_closed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FileNotification, FileOperation};
    use crate::codec::{encode, HEADER_SIZE};
    use crate::gate::RundownGate;
    use crate::model::{EventPayload, FixedStr, ProcessKey};
    use crate::ring::RingBuffer;

    struct Rig {
        channel: Arc<DeliveryChannel>,
        adapters: Arc<AdapterSet>,
        cfg: SensorConfig,
    }

    fn rig(capacity: usize) -> Rig {
        let cfg = SensorConfig {
            ring_capacity: capacity,
            wait_timeout_ms: 10,
            stats_interval_ms: 0,
            ..SensorConfig::default()
        };
        let channel = Arc::new(DeliveryChannel::new(Arc::new(RingBuffer::new(capacity).unwrap())));
        let adapters = Arc::new(AdapterSet::new(
            channel.clone(),
            Arc::new(RundownGate::new()),
            cfg.ignored_domains.clone(),
        ));
        Rig {
            channel,
            adapters,
            cfg,
        }
    }

    fn file_write(path: &str, sequence: u64) -> EventRecord {
        EventRecord {
            sequence,
            timestamp_ns: monotonic_ns(),
            subject: ProcessKey::new(88, 1),
            payload: EventPayload::FileWrite {
                path: FixedStr::new(path),
                bytes: 10,
            },
        }
    }

    fn events(items: &[Emitted]) -> Vec<&CollectedEvent> {
        items
            .iter()
            .filter_map(|e| match e {
                Emitted::Event(ev) => Some(ev),
                Emitted::Stats(_) => None,
            })
            .collect()
    }

    #[test]
    fn corrupt_block_is_skipped_not_fatal() {
        let r = rig(8);
        let mut c = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);

        c.process_block(&encode(&file_write("/a", 1)));
        let mut bad = encode(&file_write("/b", 2));
        bad[0] = 0xee;
        c.process_block(&bad);
        let mut bad_tag = encode(&file_write("/c", 3));
        bad_tag[1] = 0x40;
        c.process_block(&bad_tag);
        c.process_block(&encode(&file_write("/d", 4)));

        let stats = c.stats();
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.gaps, 0, "skipped records are not gaps");
        assert_eq!(events(&c.pending).len(), 2);
    }

    #[test]
    fn sequence_jump_is_a_gap() {
        let r = rig(8);
        let mut c = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);
        c.process_block(&encode(&file_write("/a", 1)));
        c.process_block(&encode(&file_write("/b", 5)));
        let stats = c.stats();
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.lost_in_gaps, 3);
        assert!(c.stats_dirty);
    }

    #[test]
    fn payload_corruption_is_malformed_and_counted() {
        let r = rig(8);
        let mut c = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);
        let mut block = encode(&file_write("/a", 1));
        // FileWrite: 8 bytes of size, then the path with no terminator
        block[HEADER_SIZE + 8..].fill(b'Z');
        c.process_block(&block);
        assert_eq!(c.stats().decode_errors, 1);
        assert!(c.pending.is_empty());
    }

    #[test]
    fn wall_clock_follows_monotonic_offset() {
        let anchor = ClockAnchor::now();
        let later = anchor.wall_clock(anchor.mono_ns + 1_500_000_000);
        assert_eq!((later - anchor.wall).num_milliseconds(), 1500);
        let earlier = anchor.wall_clock(anchor.mono_ns.saturating_sub(1_000_000));
        assert!(earlier <= anchor.wall);
    }

    #[tokio::test]
    async fn loop_delivers_then_closes_on_cancel() {
        let r = rig(16);
        let collector = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);
        let (tx, mut rx) = mpsc::channel(64);
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(
            tx,
            RunOptions::new()
                .with_ready(ready_tx)
                .with_cancellation(cancel.clone()),
        ));
        ready_rx.recv().await.unwrap();

        for i in 0..3 {
            r.adapters.file.on_file(&FileNotification {
                subject: ProcessKey::new(88, 1),
                operation: FileOperation::Create,
                path: &format!("C:\\work\\{i}.txt"),
            });
        }
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Emitted::Event(ref ev) if ev.record.sequence == 1));

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.exit, CollectorExit::Detached);
        assert_eq!(report.stats.delivered, 3);
        assert_eq!(report.stats.last_sequence, 3);

        let mut rest = Vec::new();
        while let Some(item) = rx.recv().await {
            rest.push(item);
        }
        assert_eq!(events(&rest).len(), 2);
        assert!(matches!(rest.last(), Some(Emitted::Stats(s)) if s.delivered == 3));
    }

    #[tokio::test]
    async fn idle_duplicate_is_delivered_again_with_stats_off() {
        let mut r = rig(16);
        r.cfg.dedup.min_reemit_ms = 1000;
        r.cfg.dedup.max_age_ms = 10;
        let collector = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(tx, RunOptions::new().with_cancellation(cancel.clone())));

        let touch = || {
            r.adapters.file.on_file(&FileNotification {
                subject: ProcessKey::new(88, 1),
                operation: FileOperation::Create,
                path: "C:\\work\\same.txt",
            })
        };
        touch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        touch();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.stats.delivered, 2);
        assert_eq!(report.stats.suppressed, 0);

        let mut all = Vec::new();
        while let Some(item) = rx.recv().await {
            all.push(item);
        }
        let seqs: Vec<u64> = events(&all).iter().map(|ev| ev.record.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn invalidated_channel_requests_detach_and_still_flushes() {
        let r = rig(16);
        let collector = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);
        let (tx, mut rx) = mpsc::channel(64);
        let detach = CancellationToken::new();
        let task = tokio::spawn(
            collector.run(tx, RunOptions::new().with_detach_request(detach.clone())),
        );

        r.adapters.file.on_file(&FileNotification {
            subject: ProcessKey::new(88, 1),
            operation: FileOperation::Delete,
            path: "C:\\x",
        });
        r.channel.invalidate();

        let report = task.await.unwrap();
        assert_eq!(report.exit, CollectorExit::ChannelInvalidated);
        assert!(report.is_fatal());
        assert!(detach.is_cancelled());
        assert_eq!(report.stats.delivered, 1);

        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item);
        }
        assert_eq!(events(&got).len(), 1);
    }

    #[tokio::test]
    async fn overwrites_surface_as_stats() {
        let r = rig(4);
        let collector = Collector::new(r.channel.clone(), r.adapters.clone(), &r.cfg);
        for i in 0..10 {
            r.adapters.file.on_file(&FileNotification {
                subject: ProcessKey::new(88, 1),
                operation: FileOperation::Create,
                path: &format!("/f{i}"),
            });
        }
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = collector.run(tx, RunOptions::new().with_cancellation(cancel)).await;

        assert_eq!(report.stats.dropped_total, 6);
        assert_eq!(report.stats.delivered, 4);
        assert_eq!(report.stats.gaps, 1);
        assert_eq!(report.stats.lost_in_gaps, 6);

        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item);
        }
        let first_stats = got.iter().find_map(|e| match e {
            Emitted::Stats(s) => Some(*s),
            Emitted::Event(_) => None,
        });
        assert_eq!(first_stats.map(|s| s.dropped_delta), Some(6));
    }

    #[test]
    fn event_json_is_flat() {
        let ev = Emitted::Event(CollectedEvent {
            record: file_write("C:\\Users\\lab\\Downloads\\a.exe", 9),
            observed_at: Utc::now(),
            repeats: 0,
            tags: RiskTags::new(),
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["sequence"], 9);
        assert_eq!(v["payload"]["kind"], "FILE_WRITE");
        assert!(v.get("repeats").is_none());
        assert!(v.get("tags").is_none());
    }
}
