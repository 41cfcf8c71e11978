//! A `NotificationHost` that plays recorded native notifications from a
//! JSONL stimulus file, one notification per line:
//!
//! ```text
//! {"type":"process_create","pid":4100,"create_time":1,"parent_pid":600,"image":"C:\\lab\\gen.exe"}
//! {"type":"registry_set","pid":4100,"key":"HKCU\\...\\Run","value_name":"x","data":"y","repeat":50}
//! {"type":"network_connect","pid":4100,"protocol":"TCP","local_port":50000,"remote":"10.0.0.5:445"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::adapters::{
    AdapterSet, ConnectNotification, DnsNotification, FileNotification, FileOperation,
    ProcessCreateNotification, ProcessExitNotification, RegistryNotification, RegistryOperation,
};
use crate::error::HostError;
use crate::host::NotificationHost;
use crate::model::{ProcessKey, TransportProtocol};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeEvent {
    ProcessCreate {
        parent_pid: u32,
        image: String,
        #[serde(default)]
        command_line: String,
    },
    ProcessExit {
        exit_code: i32,
    },
    FileCreate {
        path: String,
    },
    FileWrite {
        path: String,
        bytes: u64,
    },
    FileDelete {
        path: String,
    },
    RegistrySet {
        key: String,
        #[serde(default)]
        value_name: String,
        #[serde(default)]
        data: String,
    },
    RegistryDelete {
        key: String,
        #[serde(default)]
        value_name: String,
    },
    NetworkConnect {
        protocol: TransportProtocol,
        local_port: u16,
        remote: SocketAddr,
    },
    DnsQuery {
        query_name: String,
        #[serde(default = "default_query_type")]
        query_type: u16,
    },
}

fn default_query_type() -> u16 {
    1
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayEvent {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub create_time: u64,
    /// deliver the same notification this many times back to back
    #[serde(default = "one")]
    pub repeat: u32,
    #[serde(flatten)]
    pub event: NativeEvent,
}

impl ReplayEvent {
    pub fn new(pid: u32, create_time: u64, event: NativeEvent) -> Self {
        Self {
            pid,
            create_time,
            repeat: 1,
            event,
        }
    }

    pub fn repeated(mut self, n: u32) -> Self {
        self.repeat = n;
        self
    }

    fn deliver(&self, adapters: &AdapterSet) {
        let subject = ProcessKey::new(self.pid, self.create_time);
        match &self.event {
            NativeEvent::ProcessCreate {
                parent_pid,
                image,
                command_line,
            } => adapters.process.on_create(&ProcessCreateNotification {
                subject,
                parent_pid: *parent_pid,
                image,
                command_line,
            }),
            NativeEvent::ProcessExit { exit_code } => {
                adapters.process.on_exit(&ProcessExitNotification {
                    subject,
                    exit_code: *exit_code,
                })
            }
            NativeEvent::FileCreate { path } => adapters.file.on_file(&FileNotification {
                subject,
                operation: FileOperation::Create,
                path,
            }),
            NativeEvent::FileWrite { path, bytes } => adapters.file.on_file(&FileNotification {
                subject,
                operation: FileOperation::Write { bytes: *bytes },
                path,
            }),
            NativeEvent::FileDelete { path } => adapters.file.on_file(&FileNotification {
                subject,
                operation: FileOperation::Delete,
                path,
            }),
            NativeEvent::RegistrySet {
                key,
                value_name,
                data,
            } => adapters.registry.on_registry(&RegistryNotification {
                subject,
                key,
                value_name,
                operation: RegistryOperation::SetValue { data },
            }),
            NativeEvent::RegistryDelete { key, value_name } => {
                adapters.registry.on_registry(&RegistryNotification {
                    subject,
                    key,
                    value_name,
                    operation: RegistryOperation::DeleteValue,
                })
            }
            NativeEvent::NetworkConnect {
                protocol,
                local_port,
                remote,
            } => adapters.network.on_connect(&ConnectNotification {
                subject,
                protocol: *protocol,
                local_port: *local_port,
                remote: *remote,
            }),
            NativeEvent::DnsQuery {
                query_name,
                query_type,
            } => adapters.network.on_dns(&DnsNotification {
                subject,
                query_name,
                query_type: *query_type,
            }),
        }
    }
}

/// Parse a stimulus file body. Errors name the offending line.
pub fn parse_events(text: &str) -> Result<Vec<ReplayEvent>> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let ev: ReplayEvent = serde_json::from_str(line)
            .with_context(|| format!("bad replay event at line {}", idx + 1))?;
        events.push(ev);
    }
    Ok(events)
}

struct Shared {
    stop: AtomicBool,
    delivered: AtomicU64,
    finished: watch::Sender<bool>,
}

pub struct ReplayHost {
    events: Arc<Vec<ReplayEvent>>,
    pace: Duration,
    shared: Arc<Shared>,
    finished_rx: watch::Receiver<bool>,
    worker: Mutex<Option<Thread>>,
    registered: AtomicBool,
}

impl ReplayHost {
    pub fn new(events: Vec<ReplayEvent>) -> Self {
        let (finished, finished_rx) = watch::channel(false);
        Self {
            events: Arc::new(events),
            pace: Duration::ZERO,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                delivered: AtomicU64::new(0),
                finished,
            }),
            finished_rx,
            worker: Mutex::new(None),
            registered: AtomicBool::new(false),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading replay file {}", path.display()))?;
        let events = parse_events(&text)?;
        info!(path = %path.display(), events = events.len(), "loaded replay stimulus");
        Ok(Self::new(events))
    }

    /// Pause between notifications.
    pub fn with_pacing(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Notifications that will be delivered, counting repeats.
    pub fn total_notifications(&self) -> u64 {
        self.events.iter().map(|e| e.repeat as u64).sum()
    }

    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Resolves once every notification was delivered or the host was
    /// unregistered.
    pub async fn wait_until_finished(&self) {
        let mut rx = self.finished_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl NotificationHost for ReplayHost {
    fn register(&self, adapters: Arc<AdapterSet>) -> Result<(), HostError> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Err(HostError::AlreadyRegistered);
        }
        let events = self.events.clone();
        let shared = self.shared.clone();
        let pace = self.pace;

        let handle = thread::Builder::new()
            .name("replay-host".into())
            .spawn(move || {
                'outer: for ev in events.iter() {
                    for _ in 0..ev.repeat {
                        if shared.stop.load(Ordering::Acquire) {
                            break 'outer;
                        }
                        ev.deliver(&adapters);
                        shared.delivered.fetch_add(1, Ordering::Relaxed);
                        if !pace.is_zero() {
                            thread::park_timeout(pace);
                        }
                    }
                }
                debug!(
                    delivered = shared.delivered.load(Ordering::Relaxed),
                    "replay host finished"
                );
                shared.finished.send_replace(true);
            })?;

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle.thread().clone());
        }
        Ok(())
    }

    fn unregister(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Ok(worker) = self.worker.lock() {
            if let Some(t) = worker.as_ref() {
                t.unpark();
            }
        }
        self.shared.finished.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_kind_with_defaults() {
        let text = r#"
# comment
{"type":"process_create","pid":10,"create_time":5,"parent_pid":1,"image":"a.exe"}
{"type":"process_exit","pid":10,"create_time":5,"exit_code":3}
{"type":"file_create","pid":10,"path":"C:\\x"}
{"type":"file_write","pid":10,"path":"C:\\x","bytes":9}
{"type":"file_delete","pid":10,"path":"C:\\x"}
{"type":"registry_set","pid":10,"key":"HKCU\\Run","value_name":"v","data":"d","repeat":3}
{"type":"registry_delete","pid":10,"key":"HKCU\\Run"}
{"type":"network_connect","pid":10,"protocol":"TCP","local_port":1,"remote":"1.2.3.4:445"}
{"type":"dns_query","pid":10,"query_name":"example.com"}
"#;
        let events = parse_events(text).unwrap();
        assert_eq!(events.len(), 9);
        assert_eq!(events[0].create_time, 5);
        assert_eq!(events[2].create_time, 0);
        assert_eq!(events[5].repeat, 3);
        assert_eq!(
            events[8].event,
            NativeEvent::DnsQuery {
                query_name: "example.com".into(),
                query_type: 1
            }
        );
        assert_eq!(ReplayHost::new(events).total_notifications(), 11);
    }

    #[test]
    fn bad_line_is_reported_with_its_number() {
        let err = parse_events("{\"type\":\"file_create\",\"pid\":1,\"path\":\"a\"}\n{\"type\":\"nope\"}")
            .unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
