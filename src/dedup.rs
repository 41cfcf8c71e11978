//! Collector-side suppression of near-duplicate bursts.
//!
//! A fingerprint covers kind, subject and payload but not sequence or
//! timestamp, so the same registry value rewritten every tick collapses
//! to one emitted event plus a repeat count. Time is the record's own
//! monotonic timestamp, not the collector's clock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::codec::{encode, EncodedRecord, HEADER_SIZE};
use crate::model::EventRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// max fingerprints tracked; least recently seen is evicted first
    pub capacity: usize,
    pub min_reemit_ms: u64,
    /// entries idle this long count as new; `evict_expired` also sweeps them
    pub max_age_ms: u64,
    /// re-emit after this many suppressions even inside the interval; 0 = no limit
    pub max_suppressed: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            min_reemit_ms: 1000,
            max_age_ms: 60_000,
            max_suppressed: 0,
        }
    }
}

impl DedupConfig {
    pub fn min_reemit(&self) -> Duration {
        Duration::from_millis(self.min_reemit_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn of(record: &EventRecord) -> Self {
        Self::of_block(&encode(record))
    }

    /// Kind, truncation flags, subject and payload. Skips version,
    /// sequence and timestamp.
    pub fn of_block(block: &EncodedRecord) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&block[1..3]);
        hasher.update(&block[4..16]);
        hasher.update(&block[HEADER_SIZE..]);
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Fingerprint(u64::from_le_bytes(head))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the record; `repeats` is how many copies were suppressed
    /// since the previous emit of this fingerprint.
    Emit { repeats: u64 },
    Suppress,
}

#[derive(Debug)]
struct Entry {
    last_emit_ns: u64,
    last_seen_ns: u64,
    last_sequence: u64,
    suppressed: u64,
    lru_tick: u64,
}

#[derive(Debug)]
pub struct DedupWindow {
    min_reemit_ns: u64,
    max_age_ns: u64,
    max_suppressed: u64,
    capacity: usize,
    entries: HashMap<Fingerprint, Entry>,
    lru: BTreeMap<u64, Fingerprint>,
    next_tick: u64,
    suppressed_total: u64,
    evicted_total: u64,
}

impl DedupWindow {
    pub fn new(cfg: &DedupConfig) -> Self {
        let capacity = cfg.capacity.max(1);
        Self {
            min_reemit_ns: cfg.min_reemit().as_nanos() as u64,
            max_age_ns: cfg.max_age().as_nanos() as u64,
            max_suppressed: cfg.max_suppressed,
            capacity,
            entries: HashMap::with_capacity(capacity),
            lru: BTreeMap::new(),
            next_tick: 0,
            suppressed_total: 0,
            evicted_total: 0,
        }
    }

    pub fn should_emit(&mut self, record: &EventRecord) -> bool {
        matches!(self.check(record), Verdict::Emit { .. })
    }

    pub fn check(&mut self, record: &EventRecord) -> Verdict {
        self.check_fingerprint(Fingerprint::of(record), record)
    }

    /// Same as `check` when the encoded block is already at hand.
    pub fn check_fingerprint(&mut self, fp: Fingerprint, record: &EventRecord) -> Verdict {
        let now = record.timestamp_ns;
        let tick = self.next_tick;
        self.next_tick += 1;

        let stale = self
            .entries
            .get(&fp)
            .is_some_and(|e| now.saturating_sub(e.last_seen_ns) >= self.max_age_ns);
        if stale {
            // idle past max_age: start over as if never seen
            if let Some(old) = self.entries.remove(&fp) {
                self.lru.remove(&old.lru_tick);
                self.evicted_total += 1;
            }
        }

        if let Some(entry) = self.entries.get_mut(&fp) {
            self.lru.remove(&entry.lru_tick);
            self.lru.insert(tick, fp);
            entry.lru_tick = tick;
            entry.last_seen_ns = entry.last_seen_ns.max(now);
            entry.last_sequence = record.sequence;

            let within = now.saturating_sub(entry.last_emit_ns) < self.min_reemit_ns;
            let under_limit = self.max_suppressed == 0 || entry.suppressed < self.max_suppressed;
            if within && under_limit {
                entry.suppressed += 1;
                self.suppressed_total += 1;
                return Verdict::Suppress;
            }
            let repeats = entry.suppressed;
            entry.suppressed = 0;
            entry.last_emit_ns = now;
            return Verdict::Emit { repeats };
        }

        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.lru.pop_first() {
                self.entries.remove(&oldest);
                self.evicted_total += 1;
            }
        }
        self.entries.insert(
            fp,
            Entry {
                last_emit_ns: now,
                last_seen_ns: now,
                last_sequence: record.sequence,
                suppressed: 0,
                lru_tick: tick,
            },
        );
        self.lru.insert(tick, fp);
        Verdict::Emit { repeats: 0 }
    }

    /// Drop fingerprints not seen for `max_age`. Returns how many went.
    pub fn evict_expired(&mut self, now_ns: u64) -> usize {
        let max_age = self.max_age_ns;
        let expired: Vec<(Fingerprint, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| now_ns.saturating_sub(e.last_seen_ns) >= max_age)
            .map(|(fp, e)| (*fp, e.lru_tick))
            .collect();
        for (fp, tick) in &expired {
            self.entries.remove(fp);
            self.lru.remove(tick);
        }
        self.evicted_total += expired.len() as u64;
        expired.len()
    }

    /// Sequence of the latest record seen with this fingerprint.
    pub fn last_sequence(&self, fp: Fingerprint) -> Option<u64> {
        self.entries.get(&fp).map(|e| e.last_sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}
