//! Callback adapters: native notification in, `EventRecord` out.
//!
//! Adapters run in whatever context the host calls them from. They never
//! block, never allocate (records are inline `Copy` values built on the
//! stack) and never hand an error back to the host; every outcome is a
//! counter bump that the collector reports later.

use serde::Serialize;
use std::net::SocketAddr;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::DeliveryChannel;
use crate::error::ObservationError;
use crate::gate::RundownGate;
use crate::model::{EventPayload, EventRecord, FixedStr, ProcessKey, TransportProtocol};

// ---- native notifications -------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ProcessCreateNotification<'a> {
    pub subject: ProcessKey,
    pub parent_pid: u32,
    pub image: &'a str,
    pub command_line: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessExitNotification {
    pub subject: ProcessKey,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Create,
    Write { bytes: u64 },
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct FileNotification<'a> {
    pub subject: ProcessKey,
    pub operation: FileOperation,
    pub path: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOperation<'a> {
    SetValue { data: &'a str },
    DeleteValue,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryNotification<'a> {
    pub subject: ProcessKey,
    pub key: &'a str,
    /// empty for the key's default value
    pub value_name: &'a str,
    pub operation: RegistryOperation<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectNotification {
    pub subject: ProcessKey,
    pub protocol: TransportProtocol,
    pub local_port: u16,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct DnsNotification<'a> {
    pub subject: ProcessKey,
    pub query_name: &'a str,
    pub query_type: u16,
}

// ---- counters -------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AdapterCounters {
    published: AtomicU64,
    overwrites: AtomicU64,
    observation_errors: AtomicU64,
    filtered: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub published: u64,
    /// publishes that cost a record (own or older)
    pub overwrites: u64,
    pub observation_errors: u64,
    pub filtered: u64,
    /// notifications that arrived after detach started
    pub rejected: u64,
}

impl Add for CounterSnapshot {
    type Output = CounterSnapshot;

    fn add(self, o: CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            published: self.published + o.published,
            overwrites: self.overwrites + o.overwrites,
            observation_errors: self.observation_errors + o.observation_errors,
            filtered: self.filtered + o.filtered,
            rejected: self.rejected + o.rejected,
        }
    }
}

impl AdapterCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            published: self.published.load(Ordering::Relaxed),
            overwrites: self.overwrites.load(Ordering::Relaxed),
            observation_errors: self.observation_errors.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ---- publish path ---------------------------------------------------------

#[derive(Debug, Clone)]
struct Publisher {
    channel: Arc<DeliveryChannel>,
    gate: Arc<RundownGate>,
}

impl Publisher {
    /// `normalise` returns `Ok(None)` for notifications that are filtered
    /// on purpose.
    #[inline]
    fn observe<F>(&self, counters: &AdapterCounters, normalise: F)
    where
        F: FnOnce() -> Result<Option<EventRecord>, ObservationError>,
    {
        let Some(_entered) = self.gate.try_enter() else {
            AdapterCounters::bump(&counters.rejected);
            return;
        };
        match normalise() {
            Ok(Some(record)) => {
                let result = self.channel.publish(&record);
                AdapterCounters::bump(&counters.published);
                if result.lost_a_record() {
                    AdapterCounters::bump(&counters.overwrites);
                }
            }
            Ok(None) => AdapterCounters::bump(&counters.filtered),
            Err(_) => AdapterCounters::bump(&counters.observation_errors),
        }
    }
}

fn require_subject(subject: ProcessKey) -> Result<ProcessKey, ObservationError> {
    if subject.pid == 0 {
        Err(ObservationError::NoSubject)
    } else {
        Ok(subject)
    }
}

fn require_text<const N: usize>(s: &str, what: &'static str) -> Result<FixedStr<N>, ObservationError> {
    if s.is_empty() {
        Err(ObservationError::Empty(what))
    } else {
        Ok(FixedStr::new(s))
    }
}

// ---- adapters -------------------------------------------------------------

#[derive(Debug)]
pub struct ProcessAdapter {
    publisher: Publisher,
    counters: AdapterCounters,
}

impl ProcessAdapter {
    pub fn on_create(&self, n: &ProcessCreateNotification<'_>) {
        self.publisher.observe(&self.counters, || {
            let subject = require_subject(n.subject)?;
            Ok(Some(EventRecord::observed(
                subject,
                EventPayload::ProcessCreate {
                    parent_pid: n.parent_pid,
                    image: require_text(n.image, "image")?,
                    command_line: FixedStr::new(n.command_line),
                },
            )))
        });
    }

    pub fn on_exit(&self, n: &ProcessExitNotification) {
        self.publisher.observe(&self.counters, || {
            let subject = require_subject(n.subject)?;
            Ok(Some(EventRecord::observed(
                subject,
                EventPayload::ProcessExit {
                    exit_code: n.exit_code,
                },
            )))
        });
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

#[derive(Debug)]
pub struct FileAdapter {
    publisher: Publisher,
    counters: AdapterCounters,
}

impl FileAdapter {
    pub fn on_file(&self, n: &FileNotification<'_>) {
        self.publisher.observe(&self.counters, || {
            let subject = require_subject(n.subject)?;
            let path = require_text(n.path, "path")?;
            let payload = match n.operation {
                FileOperation::Create => EventPayload::FileCreate { path },
                FileOperation::Write { bytes } => EventPayload::FileWrite { path, bytes },
                FileOperation::Delete => EventPayload::FileDelete { path },
            };
            Ok(Some(EventRecord::observed(subject, payload)))
        });
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

#[derive(Debug)]
pub struct RegistryAdapter {
    publisher: Publisher,
    counters: AdapterCounters,
}

impl RegistryAdapter {
    pub fn on_registry(&self, n: &RegistryNotification<'_>) {
        self.publisher.observe(&self.counters, || {
            let subject = require_subject(n.subject)?;
            let key = require_text(n.key, "registry key")?;
            let value_name = FixedStr::new(n.value_name);
            let payload = match n.operation {
                RegistryOperation::SetValue { data } => EventPayload::RegistrySet {
                    key,
                    value_name,
                    data: FixedStr::new(data),
                },
                RegistryOperation::DeleteValue => EventPayload::RegistryDelete { key, value_name },
            };
            Ok(Some(EventRecord::observed(subject, payload)))
        });
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

#[derive(Debug)]
pub struct NetworkAdapter {
    publisher: Publisher,
    counters: AdapterCounters,
    /// fixed at attach; matched case-insensitively, trailing dot ignored
    ignored_domains: Vec<String>,
}

impl NetworkAdapter {
    pub fn on_connect(&self, n: &ConnectNotification) {
        self.publisher.observe(&self.counters, || {
            let subject = require_subject(n.subject)?;
            Ok(Some(EventRecord::observed(
                subject,
                EventPayload::NetworkConnect {
                    protocol: n.protocol,
                    local_port: n.local_port,
                    remote: n.remote,
                },
            )))
        });
    }

    pub fn on_dns(&self, n: &DnsNotification<'_>) {
        self.publisher.observe(&self.counters, || {
            let subject = require_subject(n.subject)?;
            let name = n.query_name.trim_end_matches('.');
            if name.is_empty() || self.is_ignored(name) {
                return Ok(None);
            }
            Ok(Some(EventRecord::observed(
                subject,
                EventPayload::DnsQuery {
                    domain: FixedStr::new(name),
                    query_type: n.query_type,
                },
            )))
        });
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored_domains
            .iter()
            .any(|d| d.trim_end_matches('.').eq_ignore_ascii_case(name))
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

/// The capability set handed to a `NotificationHost`.
#[derive(Debug)]
pub struct AdapterSet {
    pub process: ProcessAdapter,
    pub file: FileAdapter,
    pub registry: RegistryAdapter,
    pub network: NetworkAdapter,
}

impl AdapterSet {
    pub fn new(
        channel: Arc<DeliveryChannel>,
        gate: Arc<RundownGate>,
        ignored_domains: Vec<String>,
    ) -> Self {
        let publisher = Publisher { channel, gate };
        Self {
            process: ProcessAdapter {
                publisher: publisher.clone(),
                counters: AdapterCounters::default(),
            },
            file: FileAdapter {
                publisher: publisher.clone(),
                counters: AdapterCounters::default(),
            },
            registry: RegistryAdapter {
                publisher: publisher.clone(),
                counters: AdapterCounters::default(),
            },
            network: NetworkAdapter {
                publisher,
                counters: AdapterCounters::default(),
                ignored_domains,
            },
        }
    }

    pub fn totals(&self) -> CounterSnapshot {
        self.process.counters()
            + self.file.counters()
            + self.registry.counters()
            + self.network.counters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
    use crate::model::EventKind;
    use crate::ring::RingBuffer;

    const SUBJECT: ProcessKey = ProcessKey::new(4321, 99);

    fn setup(cap: usize) -> (Arc<DeliveryChannel>, Arc<RundownGate>, AdapterSet) {
        let channel = Arc::new(DeliveryChannel::new(Arc::new(RingBuffer::new(cap).unwrap())));
        let gate = Arc::new(RundownGate::new());
        let set = AdapterSet::new(channel.clone(), gate.clone(), vec!["localhost".into()]);
        (channel, gate, set)
    }

    fn drained_kinds(channel: &DeliveryChannel) -> Vec<EventKind> {
        let mut blocks = Vec::new();
        channel.drain_into(64, &mut blocks);
        blocks.iter().map(|b| decode(b).unwrap().kind()).collect()
    }

    #[test]
    fn every_adapter_publishes_its_kinds() {
        let (channel, _gate, set) = setup(16);
        set.process.on_create(&ProcessCreateNotification {
            subject: SUBJECT,
            parent_pid: 1,
            image: "C:\\Windows\\notepad.exe",
            command_line: "notepad.exe",
        });
        set.file.on_file(&FileNotification {
            subject: SUBJECT,
            operation: FileOperation::Write { bytes: 12 },
            path: "C:\\Users\\Public\\a.txt",
        });
        set.registry.on_registry(&RegistryNotification {
            subject: SUBJECT,
            key: "HKCU\\Software\\Lab",
            value_name: "",
            operation: RegistryOperation::DeleteValue,
        });
        set.network.on_connect(&ConnectNotification {
            subject: SUBJECT,
            protocol: TransportProtocol::Tcp,
            local_port: 50000,
            remote: "10.0.0.5:445".parse().unwrap(),
        });
        set.network.on_dns(&DnsNotification {
            subject: SUBJECT,
            query_name: "example.org.",
            query_type: 1,
        });
        set.process.on_exit(&ProcessExitNotification {
            subject: SUBJECT,
            exit_code: 0,
        });

        assert_eq!(
            drained_kinds(&channel),
            vec![
                EventKind::ProcessCreate,
                EventKind::FileWrite,
                EventKind::RegistryDelete,
                EventKind::NetworkConnect,
                EventKind::DnsQuery,
                EventKind::ProcessExit,
            ]
        );
        assert_eq!(set.totals().published, 6);
        assert_eq!(set.totals().observation_errors, 0);
    }

    #[test]
    fn bad_notifications_are_counted_not_published() {
        let (channel, _gate, set) = setup(16);
        set.file.on_file(&FileNotification {
            subject: SUBJECT,
            operation: FileOperation::Create,
            path: "",
        });
        set.process.on_exit(&ProcessExitNotification {
            subject: ProcessKey::new(0, 0),
            exit_code: 1,
        });
        set.registry.on_registry(&RegistryNotification {
            subject: SUBJECT,
            key: "",
            value_name: "v",
            operation: RegistryOperation::SetValue { data: "d" },
        });

        assert!(drained_kinds(&channel).is_empty());
        assert_eq!(set.file.counters().observation_errors, 1);
        assert_eq!(set.process.counters().observation_errors, 1);
        assert_eq!(set.registry.counters().observation_errors, 1);
        assert_eq!(set.totals().published, 0);
    }

    #[test]
    fn dns_noise_is_filtered() {
        let (channel, _gate, set) = setup(16);
        for name in ["localhost", "LOCALHOST.", "", "."] {
            set.network.on_dns(&DnsNotification {
                subject: SUBJECT,
                query_name: name,
                query_type: 1,
            });
        }
        assert!(drained_kinds(&channel).is_empty());
        assert_eq!(set.network.counters().filtered, 4);
    }

    #[test]
    fn overflow_is_counted_per_adapter() {
        let (_channel, _gate, set) = setup(2);
        for _ in 0..5 {
            set.file.on_file(&FileNotification {
                subject: SUBJECT,
                operation: FileOperation::Delete,
                path: "/tmp/x",
            });
        }
        let c = set.file.counters();
        assert_eq!(c.published, 5);
        assert_eq!(c.overwrites, 3);
    }

    #[test]
    fn closed_gate_rejects_notifications() {
        let (channel, gate, set) = setup(16);
        gate.close();
        set.process.on_exit(&ProcessExitNotification {
            subject: SUBJECT,
            exit_code: 0,
        });
        assert!(channel.ring().is_empty());
        assert_eq!(set.totals().rejected, 1);
        assert_eq!(channel.ring().last_sequence(), 0);
    }
}
