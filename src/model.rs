use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

use crate::sequencer;

// Payload field capacities, in bytes, including the NUL terminator.
pub const PATH_CAP: usize = 260;
pub const IMAGE_CAP: usize = 260;
pub const CMDLINE_CAP: usize = 200;
pub const REG_KEY_CAP: usize = 256;
pub const REG_VALUE_CAP: usize = 64;
pub const REG_DATA_CAP: usize = 128;
pub const DOMAIN_CAP: usize = 256;

/// Stable process identity. Process ids are reused by the host, so the
/// creation time is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProcessKey {
    pub pid: u32,
    pub create_time: u64,
}

impl ProcessKey {
    pub const fn new(pid: u32, create_time: u64) -> Self {
        Self { pid, create_time }
    }
}

/// Wire tag of an event. Values are part of the record format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ProcessCreate = 1,
    ProcessExit = 2,
    FileCreate = 3,
    FileWrite = 4,
    FileDelete = 5,
    RegistrySet = 6,
    RegistryDelete = 7,
    NetworkConnect = 8,
    DnsQuery = 9,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ProcessCreate,
        EventKind::ProcessExit,
        EventKind::FileCreate,
        EventKind::FileWrite,
        EventKind::FileDelete,
        EventKind::RegistrySet,
        EventKind::RegistryDelete,
        EventKind::NetworkConnect,
        EventKind::DnsQuery,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| *k as u8 == tag)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProcessCreate => "PROCESS_CREATE",
            EventKind::ProcessExit => "PROCESS_EXIT",
            EventKind::FileCreate => "FILE_CREATE",
            EventKind::FileWrite => "FILE_WRITE",
            EventKind::FileDelete => "FILE_DELETE",
            EventKind::RegistrySet => "REGISTRY_SET",
            EventKind::RegistryDelete => "REGISTRY_DELETE",
            EventKind::NetworkConnect => "NETWORK_CONNECT",
            EventKind::DnsQuery => "DNS_QUERY",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportProtocol {
    Tcp = 6,
    Udp = 17,
}

impl TransportProtocol {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            6 => Some(TransportProtocol::Tcp),
            17 => Some(TransportProtocol::Udp),
            _ => None,
        }
    }
}

/// Inline, fixed-capacity string. Holds at most `N - 1` bytes so the
/// encoded form is always NUL-terminated; longer input is cut on a char
/// boundary and flagged as truncated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize> {
    buf: [u8; N],
    len: u16,
    truncated: bool,
}

impl<const N: usize> FixedStr<N> {
    pub const CAPACITY: usize = N;

    pub const fn empty() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    /// Copy `s` in, stopping at an interior NUL (C-string semantics).
    pub fn new(s: &str) -> Self {
        let (content, cut_at_nul) = match s.find('\0') {
            Some(i) => (&s[..i], true),
            None => (s, false),
        };
        let mut end = content.len().min(N.saturating_sub(1));
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0u8; N];
        buf[..end].copy_from_slice(&content.as_bytes()[..end]);
        Self {
            buf,
            len: end as u16,
            truncated: cut_at_nul || end < content.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// NUL-padded wire image.
    pub(crate) fn wire(&self) -> &[u8; N] {
        &self.buf
    }

    /// Rebuild from a wire image; `None` when no terminator is present.
    pub(crate) fn from_wire(bytes: &[u8], truncated: bool) -> Option<Self> {
        if bytes.len() != N {
            return None;
        }
        let len = bytes.iter().position(|&b| b == 0)?;
        let mut buf = [0u8; N];
        buf[..len].copy_from_slice(&bytes[..len]);
        Some(Self {
            buf,
            len: len as u16,
            truncated,
        })
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.truncated {
            write!(f, "{:?}…", self.as_str())
        } else {
            write!(f, "{:?}", self.as_str())
        }
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl<const N: usize> Serialize for FixedStr<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de, const N: usize> Deserialize<'de> for FixedStr<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Cow::<'de, str>::deserialize(deserializer)?;
        Ok(Self::new(&s))
    }
}

/// Variant-specific fields. Everything is inline so a record never owns
/// heap memory and always encodes to the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    ProcessCreate {
        parent_pid: u32,
        image: FixedStr<IMAGE_CAP>,
        command_line: FixedStr<CMDLINE_CAP>,
    },
    ProcessExit {
        exit_code: i32,
    },
    FileCreate {
        path: FixedStr<PATH_CAP>,
    },
    FileWrite {
        path: FixedStr<PATH_CAP>,
        bytes: u64,
    },
    FileDelete {
        path: FixedStr<PATH_CAP>,
    },
    RegistrySet {
        key: FixedStr<REG_KEY_CAP>,
        value_name: FixedStr<REG_VALUE_CAP>,
        data: FixedStr<REG_DATA_CAP>,
    },
    RegistryDelete {
        key: FixedStr<REG_KEY_CAP>,
        value_name: FixedStr<REG_VALUE_CAP>,
    },
    NetworkConnect {
        protocol: TransportProtocol,
        local_port: u16,
        remote: SocketAddr,
    },
    DnsQuery {
        domain: FixedStr<DOMAIN_CAP>,
        query_type: u16,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ProcessCreate { .. } => EventKind::ProcessCreate,
            EventPayload::ProcessExit { .. } => EventKind::ProcessExit,
            EventPayload::FileCreate { .. } => EventKind::FileCreate,
            EventPayload::FileWrite { .. } => EventKind::FileWrite,
            EventPayload::FileDelete { .. } => EventKind::FileDelete,
            EventPayload::RegistrySet { .. } => EventKind::RegistrySet,
            EventPayload::RegistryDelete { .. } => EventKind::RegistryDelete,
            EventPayload::NetworkConnect { .. } => EventKind::NetworkConnect,
            EventPayload::DnsQuery { .. } => EventKind::DnsQuery,
        }
    }

    /// True when any string field lost bytes to its capacity.
    pub fn is_truncated(&self) -> bool {
        match self {
            EventPayload::ProcessCreate {
                image,
                command_line,
                ..
            } => image.is_truncated() || command_line.is_truncated(),
            EventPayload::FileCreate { path }
            | EventPayload::FileWrite { path, .. }
            | EventPayload::FileDelete { path } => path.is_truncated(),
            EventPayload::RegistrySet {
                key,
                value_name,
                data,
            } => key.is_truncated() || value_name.is_truncated() || data.is_truncated(),
            EventPayload::RegistryDelete { key, value_name } => {
                key.is_truncated() || value_name.is_truncated()
            }
            EventPayload::DnsQuery { domain, .. } => domain.is_truncated(),
            EventPayload::ProcessExit { .. } | EventPayload::NetworkConnect { .. } => false,
        }
    }
}

/// One unit of telemetry. `sequence` is assigned by the ring at publish
/// time; records are never modified after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    /// monotonic nanoseconds at observation, not wall-clock
    pub timestamp_ns: u64,
    pub subject: ProcessKey,
    pub payload: EventPayload,
}

impl EventRecord {
    /// Unpublished record stamped with the current monotonic tick.
    pub fn observed(subject: ProcessKey, payload: EventPayload) -> Self {
        Self {
            sequence: 0,
            timestamp_ns: sequencer::monotonic_ns(),
            subject,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_keeps_short_input() {
        let s = FixedStr::<16>::new("C:\\tmp\\a.exe");
        assert_eq!(s.as_str(), "C:\\tmp\\a.exe");
        assert!(!s.is_truncated());
        assert_eq!(s.wire()[s.len()], 0);
    }

    #[test]
    fn fixed_str_truncates_on_char_boundary() {
        // 'é' is two bytes; capacity 4 leaves room for 3 content bytes
        let s = FixedStr::<4>::new("aéé");
        assert_eq!(s.as_str(), "aé");
        assert!(s.is_truncated());
        assert_eq!(s.wire()[3], 0);
    }

    #[test]
    fn fixed_str_stops_at_interior_nul() {
        let s = FixedStr::<32>::new("abc\0def");
        assert_eq!(s.as_str(), "abc");
        assert!(s.is_truncated());
    }

    #[test]
    fn fixed_str_from_wire_requires_terminator() {
        assert!(FixedStr::<4>::from_wire(b"abcd", false).is_none());
        let s = FixedStr::<4>::from_wire(b"ab\0\0", true).unwrap();
        assert_eq!(s.as_str(), "ab");
        assert!(s.is_truncated());
    }

    #[test]
    fn kind_tags_are_stable() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(EventKind::from_tag(0), None);
        assert_eq!(EventKind::from_tag(10), None);
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = EventPayload::DnsQuery {
            domain: FixedStr::new("example.com"),
            query_type: 1,
        };
        let json = serde_json::to_value(payload).unwrap();
        assert_eq!(json["kind"], "DNS_QUERY");
        assert_eq!(json["domain"], "example.com");
    }
}
