//! Fixed-layout binary form of one `EventRecord`.
//!
//! Every record encodes to exactly `RECORD_SIZE` bytes so ring slots are
//! uniform and a record never spans a wrap boundary. Layout (little endian):
//!
//! ```text
//!  0      version (u8)
//!  1      kind tag (u8)
//!  2      truncation flags (bit n = string field n was cut)
//!  3      reserved, zero
//!  4..8   subject pid (u32)
//!  8..16  subject create time (u64)
//!  16..24 sequence (u64)
//!  24..32 monotonic timestamp ns (u64)
//!  32..   payload, zero padded
//! ```

use byteorder::{ByteOrder, LittleEndian};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::DecodeError;
use crate::model::{EventKind, EventPayload, EventRecord, FixedStr, ProcessKey, TransportProtocol};

pub const FORMAT_VERSION: u8 = 1;
pub const RECORD_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 32;
pub const PAYLOAD_SIZE: usize = RECORD_SIZE - HEADER_SIZE;

pub type EncodedRecord = [u8; RECORD_SIZE];

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encode into a fresh block. Never allocates.
pub fn encode(record: &EventRecord) -> EncodedRecord {
    let mut block = [0u8; RECORD_SIZE];
    encode_into(record, &mut block);
    block
}

pub fn encode_into(record: &EventRecord, block: &mut EncodedRecord) {
    block.fill(0);
    block[0] = FORMAT_VERSION;
    block[1] = record.kind().tag();
    LittleEndian::write_u32(&mut block[4..8], record.subject.pid);
    LittleEndian::write_u64(&mut block[8..16], record.subject.create_time);
    LittleEndian::write_u64(&mut block[16..24], record.sequence);
    LittleEndian::write_u64(&mut block[24..32], record.timestamp_ns);

    let (head, payload) = block.split_at_mut(HEADER_SIZE);
    let mut w = Writer::new(payload);
    match &record.payload {
        EventPayload::ProcessCreate {
            parent_pid,
            image,
            command_line,
        } => {
            w.u32(*parent_pid);
            w.text(image, 0);
            w.text(command_line, 1);
        }
        EventPayload::ProcessExit { exit_code } => w.i32(*exit_code),
        EventPayload::FileCreate { path } | EventPayload::FileDelete { path } => w.text(path, 0),
        EventPayload::FileWrite { path, bytes } => {
            w.u64(*bytes);
            w.text(path, 0);
        }
        EventPayload::RegistrySet {
            key,
            value_name,
            data,
        } => {
            w.text(key, 0);
            w.text(value_name, 1);
            w.text(data, 2);
        }
        EventPayload::RegistryDelete { key, value_name } => {
            w.text(key, 0);
            w.text(value_name, 1);
        }
        EventPayload::NetworkConnect {
            protocol,
            local_port,
            remote,
        } => {
            w.u8(*protocol as u8);
            w.u16(*local_port);
            w.u16(remote.port());
            match remote.ip() {
                IpAddr::V4(ip) => {
                    w.u8(FAMILY_V4);
                    let mut raw = [0u8; 16];
                    raw[..4].copy_from_slice(&ip.octets());
                    w.bytes(&raw);
                }
                IpAddr::V6(ip) => {
                    w.u8(FAMILY_V6);
                    w.bytes(&ip.octets());
                }
            }
        }
        EventPayload::DnsQuery { domain, query_type } => {
            w.u16(*query_type);
            w.text(domain, 0);
        }
    }
    head[2] = w.flags;
}

/// Decode one block. Strict: an unknown version is rejected outright,
/// never parsed best-effort, and any byte `encode` would not have written
/// (reserved header byte, stray flag bits, padding) is `Malformed`.
pub fn decode(block: &[u8]) -> Result<EventRecord, DecodeError> {
    let Some(&version) = block.first() else {
        return Err(DecodeError::Truncated { got: 0 });
    };
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    if block.len() < RECORD_SIZE {
        return Err(DecodeError::Truncated { got: block.len() });
    }
    let kind = EventKind::from_tag(block[1]).ok_or(DecodeError::BadTag(block[1]))?;
    let flags = block[2];
    if block[3] != 0 {
        return Err(DecodeError::Malformed("reserved header byte"));
    }
    if u32::from(flags) >> string_fields(kind) != 0 {
        return Err(DecodeError::Malformed("truncation flag for a missing field"));
    }
    let subject = ProcessKey::new(
        LittleEndian::read_u32(&block[4..8]),
        LittleEndian::read_u64(&block[8..16]),
    );
    let sequence = LittleEndian::read_u64(&block[16..24]);
    let timestamp_ns = LittleEndian::read_u64(&block[24..32]);

    let mut r = Reader::new(&block[HEADER_SIZE..RECORD_SIZE], flags);
    let payload = match kind {
        EventKind::ProcessCreate => EventPayload::ProcessCreate {
            parent_pid: r.u32(),
            image: r.text(0)?,
            command_line: r.text(1)?,
        },
        EventKind::ProcessExit => EventPayload::ProcessExit { exit_code: r.i32() },
        EventKind::FileCreate => EventPayload::FileCreate { path: r.text(0)? },
        EventKind::FileWrite => {
            let bytes = r.u64();
            EventPayload::FileWrite {
                path: r.text(0)?,
                bytes,
            }
        }
        EventKind::FileDelete => EventPayload::FileDelete { path: r.text(0)? },
        EventKind::RegistrySet => EventPayload::RegistrySet {
            key: r.text(0)?,
            value_name: r.text(1)?,
            data: r.text(2)?,
        },
        EventKind::RegistryDelete => EventPayload::RegistryDelete {
            key: r.text(0)?,
            value_name: r.text(1)?,
        },
        EventKind::NetworkConnect => {
            let protocol = TransportProtocol::from_number(r.u8())
                .ok_or(DecodeError::Malformed("transport protocol"))?;
            let local_port = r.u16();
            let remote_port = r.u16();
            let family = r.u8();
            let raw = r.array::<16>();
            let ip = match family {
                FAMILY_V4 if raw[4..].iter().any(|&b| b != 0) => {
                    return Err(DecodeError::Malformed("ipv4 address padding"))
                }
                FAMILY_V4 => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
                FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(raw)),
                _ => return Err(DecodeError::Malformed("address family")),
            };
            EventPayload::NetworkConnect {
                protocol,
                local_port,
                remote: SocketAddr::new(ip, remote_port),
            }
        }
        EventKind::DnsQuery => {
            let query_type = r.u16();
            EventPayload::DnsQuery {
                domain: r.text(0)?,
                query_type,
            }
        }
    };
    r.finish()?;

    Ok(EventRecord {
        sequence,
        timestamp_ns,
        subject,
        payload,
    })
}

/// How many string fields a kind carries; flag bits above that are invalid.
fn string_fields(kind: EventKind) -> u32 {
    match kind {
        EventKind::ProcessExit | EventKind::NetworkConnect => 0,
        EventKind::FileCreate | EventKind::FileWrite | EventKind::FileDelete | EventKind::DnsQuery => 1,
        EventKind::ProcessCreate | EventKind::RegistryDelete => 2,
        EventKind::RegistrySet => 3,
    }
}

/// Sequence number of an encoded block without a full decode.
pub fn peek_sequence(block: &EncodedRecord) -> u64 {
    LittleEndian::read_u64(&block[16..24])
}

// Payload cursors. Field widths are compile-time constants that fit in
// PAYLOAD_SIZE for every variant, so the slices never run short.

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
    flags: u8,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            flags: 0,
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u16(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.buf[self.pos..self.pos + 2], v);
        self.pos += 2;
    }

    fn u32(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.buf[self.pos..self.pos + 4], v);
        self.pos += 4;
    }

    fn i32(&mut self, v: i32) {
        LittleEndian::write_i32(&mut self.buf[self.pos..self.pos + 4], v);
        self.pos += 4;
    }

    fn u64(&mut self, v: u64) {
        LittleEndian::write_u64(&mut self.buf[self.pos..self.pos + 8], v);
        self.pos += 8;
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }

    fn text<const N: usize>(&mut self, s: &FixedStr<N>, field: u8) {
        if s.is_truncated() {
            self.flags |= 1 << field;
        }
        self.bytes(s.wire());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    flags: u8,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], flags: u8) -> Self {
        Self { buf, pos: 0, flags }
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = LittleEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        v
    }

    fn i32(&mut self) -> i32 {
        let v = LittleEndian::read_i32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        v
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn text<const N: usize>(&mut self, field: u8) -> Result<FixedStr<N>, DecodeError> {
        let raw = &self.buf[self.pos..self.pos + N];
        self.pos += N;
        let s = FixedStr::from_wire(raw, self.flags & (1 << field) != 0)
            .ok_or(DecodeError::Malformed("unterminated string field"))?;
        if raw[s.as_bytes().len()..].iter().any(|&b| b != 0) {
            return Err(DecodeError::Malformed("bytes after string terminator"));
        }
        Ok(s)
    }

    /// Everything past the last field must be zero padding.
    fn finish(&self) -> Result<(), DecodeError> {
        if self.buf[self.pos..].iter().any(|&b| b != 0) {
            return Err(DecodeError::Malformed("payload padding"));
        }
        Ok(())
    }
}
