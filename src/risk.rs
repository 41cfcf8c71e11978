use base64::{engine::general_purpose::STANDARD, Engine as _};
use smallvec::SmallVec;

use crate::model::{EventPayload, EventRecord};

pub type RiskTags = SmallVec<[&'static str; 4]>;

/// Remote ports used for lateral movement: RPC, SMB, RDP, WinRM.
pub const LATERAL_PORTS: [u16; 5] = [135, 445, 3389, 5985, 5986];

const DROPPED_EXTENSIONS: [&str; 7] = [".exe", ".msi", ".ps1", ".vbs", ".js", ".bat", ".com"];

// lowercase; a decoded blob mentioning any of these is worth a tag
const DECODED_KEYWORDS: [&str; 21] = [
    "http", "ftp", "invoke-", "iex", "powershell", "cmd.exe", "virtualalloc",
    "writeprocessmemory", "createremotethread", "temp", "appdata", "reg add",
    "schtasks", "net user", "user-agent", "mozilla", "content-type", ".exe", ".dll",
    ".vbs", ".js",
];

const MIN_BASE64_TOKEN: usize = 16;
const MIN_HEX_TOKEN: usize = 20;
const MIN_XOR_LEN: usize = 10;

/// Analyze a normalised record for risk indicators. Collector-side only.
pub fn analyze_risk_tags(record: &EventRecord) -> RiskTags {
    let mut tags = RiskTags::new();

    match &record.payload {
        // Execution risks
        EventPayload::ProcessCreate { image, command_line, .. } => {
            let image = image.as_str().to_ascii_lowercase();
            if image.contains("\\temp\\") || image.contains("\\appdata\\") || image.starts_with("/tmp/") {
                tags.push("TEMP_EXEC");
            }
            if find_encoded_payload(&command_line.as_str()).is_some() {
                tags.push("ENCODED_COMMAND");
            }
        }

        // Dropped payloads
        EventPayload::FileCreate { path } => {
            let path = path.as_str().to_ascii_lowercase();
            let in_downloads = path.contains("\\downloads\\") || path.contains("/downloads/");
            if in_downloads && DROPPED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
                tags.push("DOWNLOAD_DROP");
            }
        }

        // Persistence
        EventPayload::RegistrySet { key, .. } => {
            let key = key.as_str().to_ascii_lowercase();
            let key = key.trim_end_matches('\\');
            if key.ends_with("\\currentversion\\run") || key.ends_with("\\currentversion\\runonce") {
                tags.push("PERSISTENCE_RUN_KEY");
            }
        }

        // Network risks
        EventPayload::NetworkConnect { remote, .. } => {
            if LATERAL_PORTS.contains(&remote.port()) {
                tags.push("LATERAL_MOVEMENT");
            }
        }

        _ => {}
    }

    if record.payload.is_truncated() {
        tags.push("TRUNCATED");
    }

    tags
}

/// How an obfuscated command-line payload was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedPayload {
    /// base64 of text (UTF-8 or UTF-16LE, as `powershell -enc` uses)
    Base64,
    /// base64 of a PE image
    Base64Pe,
    Base64Xor { key: u8 },
    HexXor { key: u8 },
}

/// Look for base64 or hex blobs in a command line that decode to something
/// interesting. First hit wins.
pub fn find_encoded_payload(command_line: &str) -> Option<EncodedPayload> {
    let base64_tokens = command_line
        .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')))
        .filter(|t| t.len() >= MIN_BASE64_TOKEN);
    for token in base64_tokens {
        let Ok(bytes) = STANDARD.decode(token) else {
            continue;
        };
        match decoded_text(&bytes) {
            Some(text) if is_interesting(&text) => return Some(EncodedPayload::Base64),
            Some(_) => {}
            None if bytes.starts_with(b"MZ") => return Some(EncodedPayload::Base64Pe),
            None => {
                if let Some(key) = xor_key(&bytes) {
                    return Some(EncodedPayload::Base64Xor { key });
                }
            }
        }
    }

    let hex_tokens = command_line
        .split(|c: char| !c.is_ascii_hexdigit())
        .filter(|t| t.len() >= MIN_HEX_TOKEN && t.len() % 2 == 0);
    for token in hex_tokens {
        if let Some(key) = hex::decode(token).ok().and_then(|bytes| xor_key(&bytes)) {
            return Some(EncodedPayload::HexXor { key });
        }
    }
    None
}

fn decoded_text(bytes: &[u8]) -> Option<String> {
    let utf16 = bytes.len() >= 2
        && bytes.len() % 2 == 0
        && bytes.iter().skip(1).step_by(2).all(|&b| b == 0);
    if utf16 {
        let units: Vec<u16> = bytes.chunks_exact(2).map(|p| u16::from_le_bytes([p[0], p[1]])).collect();
        return String::from_utf16(&units).ok();
    }
    String::from_utf8(bytes.to_vec()).ok()
}

fn is_interesting(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    DECODED_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn is_printable(text: &str) -> bool {
    let total = text.chars().count();
    let printable = text
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .count();
    total > 0 && printable * 10 > total * 9
}

/// Single-byte XOR key that turns `data` into printable, interesting text.
fn xor_key(data: &[u8]) -> Option<u8> {
    if data.len() < MIN_XOR_LEN {
        return None;
    }
    (1..=u8::MAX).find(|&key| {
        let plain: Vec<u8> = data.iter().map(|b| b ^ key).collect();
        String::from_utf8(plain).is_ok_and(|s| is_printable(&s) && is_interesting(&s))
    })
}
