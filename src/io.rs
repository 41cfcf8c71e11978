//! Egress: hash-chained JSONL log and length-prefixed binary frames.
//!
//! Log line format is `<blake3-hex> <json>`. The first digest is a plain
//! blake3 of the first payload; every later digest is keyed by the one
//! before it, so editing, dropping or reordering any line breaks the
//! chain from that line on.
//!
//! Frames are `u32 big-endian length || encoded record`; the record's
//! first byte is its format version.

use anyhow::{bail, Context, Result};
use blake3::Hasher;
use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::mpsc,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::{decode, encode, FORMAT_VERSION, RECORD_SIZE};
use crate::collector::Emitted;
use crate::model::EventRecord;

/// Frames longer than this are treated as corrupt rather than allocated.
const MAX_FRAME: u32 = 1 << 20;

/// First line of every egress log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHeader {
    pub start: DateTime<Utc>,
    pub session: Uuid,
    pub hostname: String,
    pub stream: &'static str,
    pub format_version: u8,
}

impl SessionHeader {
    pub fn new() -> Self {
        Self {
            start: Utc::now(),
            session: Uuid::new_v4(),
            hostname: hostname(),
            stream: "sensor_events",
            format_version: FORMAT_VERSION,
        }
    }
}

impl Default for SessionHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort machine name for the session header.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str().filter(|n| !n.is_empty()) {
                return name.to_string();
            }
        }
    }
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Hash-chained JSONL writer.
pub struct LogWriter {
    file: BufWriter<File>,
    hasher: Hasher,
    lines: usize,
}

impl LogWriter {
    /// Truncates: a chain only verifies from its first line.
    pub async fn create(log_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path)
            .await
            .with_context(|| format!("open log {:?}", log_path))?;

        Ok(Self {
            file: BufWriter::new(file),
            hasher: Hasher::new(),
            lines: 0,
        })
    }

    pub async fn write_entry(&mut self, payload: &str) -> Result<()> {
        self.hasher.update(payload.as_bytes());
        let next = self.hasher.finalize();

        let line = format!("{} {}\n", hex::encode(next.as_bytes()), payload);
        self.file.write_all(line.as_bytes()).await?;

        self.hasher = Hasher::new_keyed(next.as_bytes());
        self.lines += 1;
        Ok(())
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)?;
        self.write_entry(&line).await
    }

    pub async fn finish(mut self) -> Result<usize> {
        self.file.flush().await?;
        Ok(self.lines)
    }
}

/// Recompute the chain of a log written by `LogWriter`. Returns the number
/// of verified lines.
pub fn verify_chain(path: &Path) -> Result<usize> {
    let file = fs::File::open(path).with_context(|| format!("open log {:?}", path))?;
    let mut hasher = Hasher::new();
    let mut count = 0;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let Some((digest, payload)) = line.split_once(' ') else {
            bail!("failed hash at line {}: no digest", idx + 1);
        };
        hasher.update(payload.as_bytes());
        let next = hasher.finalize();
        if hex::encode(next.as_bytes()) != digest {
            bail!("failed hash at line {}", idx + 1);
        }
        hasher = Hasher::new_keyed(next.as_bytes());
        count += 1;
    }
    if count == 0 {
        bail!("log {:?} is empty", path);
    }
    Ok(count)
}

/// Length-prefixed binary frame writer.
pub struct FrameWriter<W> {
    inner: W,
    frames: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, frames: 0 }
    }

    pub async fn write_record(&mut self, record: &EventRecord) -> io::Result<()> {
        let block = encode(record);
        self.inner.write_u32(RECORD_SIZE as u32).await?;
        self.inner.write_all(&block).await?;
        self.frames += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<usize> {
        self.inner.flush().await?;
        Ok(self.frames)
    }
}

#[derive(Debug, Default)]
pub struct FrameReadout {
    pub records: Vec<EventRecord>,
    /// frames that were skipped (bad length or undecodable)
    pub errors: usize,
}

/// Read a frame stream to its end. Bad frames are counted and skipped;
/// a stream cut mid-frame counts one error and ends the readout.
pub fn read_frames<R: Read>(mut r: R) -> Result<FrameReadout> {
    let mut out = FrameReadout::default();
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    loop {
        let len = match r.read_u32::<BigEndian>() {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("reading frame length"),
        };
        if len > MAX_FRAME {
            debug!(len, "frame length out of range; stopping");
            out.errors += 1;
            break;
        }
        buf.resize(len as usize, 0);
        match r.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                out.errors += 1;
                break;
            }
            Err(e) => return Err(e).context("reading frame body"),
        }
        if len as usize != RECORD_SIZE {
            out.errors += 1;
            continue;
        }
        match decode(&buf) {
            Ok(rec) => out.records.push(rec),
            Err(e) => {
                debug!(error = %e, "skipping bad frame");
                out.errors += 1;
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct EgressTargets {
    pub log: PathBuf,
    pub frames: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EgressSummary {
    pub events: usize,
    pub stats: usize,
    pub frames: usize,
    pub log_lines: usize,
}

/// Write everything the collector emits until its sender side closes.
/// Events and stats go to the log; events alone go to the frame stream.
pub async fn run_egress(
    mut rx: mpsc::Receiver<Emitted>,
    targets: EgressTargets,
    header: SessionHeader,
) -> Result<EgressSummary> {
    let mut log = LogWriter::create(&targets.log).await?;
    log.write_json(&header).await?;

    let mut frames = match &targets.frames {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("create frame file {:?}", path))?;
            Some(FrameWriter::new(BufWriter::new(file)))
        }
        None => None,
    };

    let mut summary = EgressSummary::default();
    while let Some(item) = rx.recv().await {
        log.write_json(&item).await?;
        match &item {
            Emitted::Event(ev) => {
                summary.events += 1;
                if let Some(fw) = frames.as_mut() {
                    fw.write_record(&ev.record).await?;
                }
            }
            Emitted::Stats(_) => summary.stats += 1,
        }
    }

    summary.log_lines = log.finish().await?;
    if let Some(fw) = frames {
        summary.frames = fw.finish().await?;
    }
    info!(
        log = %targets.log.display(),
        events = summary.events,
        stats = summary.stats,
        "egress closed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventPayload, FixedStr, ProcessKey};
    use std::io::Cursor;

    fn dns(seq: u64) -> EventRecord {
        EventRecord {
            sequence: seq,
            timestamp_ns: 10,
            subject: ProcessKey::new(5, 5),
            payload: EventPayload::DnsQuery {
                domain: FixedStr::new("api.ipify.org"),
                query_type: 1,
            },
        }
    }

    #[tokio::test]
    async fn chain_verifies_and_detects_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut w = LogWriter::create(&path).await.unwrap();
        for i in 0..4 {
            w.write_json(&serde_json::json!({ "n": i })).await.unwrap();
        }
        assert_eq!(w.finish().await.unwrap(), 4);
        assert_eq!(verify_chain(&path).unwrap(), 4);

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("{\"n\":2}", "{\"n\":7}", 1)).unwrap();
        let err = verify_chain(&path).unwrap_err();
        assert_eq!(err.to_string(), "failed hash at line 3");
    }

    #[tokio::test]
    async fn dropped_line_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut w = LogWriter::create(&path).await.unwrap();
        for i in 0..3 {
            w.write_json(&serde_json::json!({ "n": i })).await.unwrap();
        }
        w.finish().await.unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = text.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(&path, kept.join("\n") + "\n").unwrap();
        assert!(verify_chain(&path).unwrap_err().to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn frames_round_trip_and_skip_garbage() {
        let mut bytes = Vec::new();
        {
            let mut fw = FrameWriter::new(&mut bytes);
            fw.write_record(&dns(1)).await.unwrap();
            fw.write_record(&dns(2)).await.unwrap();
            assert_eq!(fw.finish().await.unwrap(), 2);
        }
        assert_eq!(bytes.len(), 2 * (4 + RECORD_SIZE));
        assert_eq!(&bytes[..4], &(RECORD_SIZE as u32).to_be_bytes());

        // corrupt the second record's version byte, then append a short frame
        bytes[4 + RECORD_SIZE + 4] = 0x09;
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        // and a truncated tail
        bytes.extend_from_slice(&(RECORD_SIZE as u32).to_be_bytes());
        bytes.extend_from_slice(&[1; 10]);

        let readout = read_frames(Cursor::new(bytes)).unwrap();
        assert_eq!(readout.records, vec![dns(1)]);
        assert_eq!(readout.errors, 3);
    }

    #[test]
    fn header_names_the_host() {
        let h = SessionHeader::new();
        assert!(!h.hostname.is_empty());
        assert_eq!(h.format_version, FORMAT_VERSION);
    }

    #[cfg(unix)]
    #[test]
    fn hostname_comes_from_the_kernel() {
        let kernel = nix::unistd::gethostname().unwrap();
        assert_eq!(hostname(), kernel.to_string_lossy());
    }
}
