//! Typed view of a captured crash dump.
//!
//! The crash-capture facility persists its dump as JSON. Everything that is
//! not a well-formed capture at the top level is a [`DecodeError`]; a single
//! malformed thread, frame, register or image entry is dropped instead so
//! that one bad record does not cost the whole report.
use std::io::{BufReader, Read};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::DecodeError;

/// The newest capture format this crate understands.
pub const SUPPORTED_DUMP_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct RawDump {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub system: Option<RawSystemInfo>,
    #[serde(default)]
    pub machine: Option<RawMachineInfo>,
    #[serde(default)]
    pub application: Option<RawApplicationInfo>,
    #[serde(default)]
    pub process: Option<RawProcessInfo>,
    pub signal: RawSignal,
    #[serde(default)]
    pub mach_exception: Option<RawMachException>,
    #[serde(default)]
    pub exception: Option<RawException>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub threads: Vec<RawThread>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub images: Vec<RawImage>,
    /// Opaque bytes attached by the application before the crash.
    #[serde(default, deserialize_with = "lenient_hex")]
    pub custom_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSystemInfo {
    #[serde(default)]
    pub operating_system: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub os_build: Option<String>,
    /// Time of the crash.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMachineInfo {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub processor: Option<RawProcessor>,
    #[serde(default)]
    pub processor_count: Option<u32>,
}

/// A Mach-O style `(cpu_type, cpu_subtype)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RawProcessor {
    pub cpu_type: u64,
    pub cpu_subtype: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawApplicationInfo {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub marketing_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProcessInfo {
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub process_id: Option<u64>,
    #[serde(default)]
    pub process_path: Option<String>,
    #[serde(default)]
    pub parent_process_name: Option<String>,
    #[serde(default)]
    pub parent_process_id: Option<u64>,
    /// Process start time in seconds since the epoch.
    #[serde(default)]
    pub start_time: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSignal {
    pub name: String,
    pub code: String,
    pub address: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMachException {
    #[serde(rename = "type")]
    pub exception_type: u64,
    #[serde(default)]
    pub codes: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawException {
    pub name: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub frames: Vec<RawFrame>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawThread {
    pub index: u32,
    #[serde(default)]
    pub crashed: bool,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub frames: Vec<RawFrame>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub registers: Vec<RawRegister>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    pub pc: u64,
    #[serde(default)]
    pub symbol: Option<RawSymbol>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSymbol {
    pub name: String,
    pub start_address: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRegister {
    #[serde(default)]
    pub name: Option<String>,
    pub value: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawImage {
    pub base_address: u64,
    pub size: u64,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "strict_hex")]
    pub uuid: Option<Vec<u8>>,
    #[serde(default)]
    pub code_type: Option<RawProcessor>,
}

impl RawImage {
    /// Checks whether `address` falls into `[base_address, base_address + size)`.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.size
    }
}

impl RawDump {
    /// Decodes a dump from its captured bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<RawDump, DecodeError> {
        serde_json::from_slice::<RawDump>(bytes)?.validate()
    }

    /// Consumes a reader and decodes it.
    pub fn from_reader<R: Read>(r: R) -> Result<RawDump, DecodeError> {
        serde_json::from_reader::<_, RawDump>(BufReader::new(r))?.validate()
    }

    /// The session identifier the application attached as custom data.
    pub fn session_id(&self) -> Option<String> {
        let data = self.custom_data.as_ref()?;
        match std::str::from_utf8(data) {
            Ok(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Ok(_) => None,
            Err(_) => {
                warn!("custom data attached to the crash dump is not utf-8");
                None
            }
        }
    }

    fn validate(self) -> Result<RawDump, DecodeError> {
        if self.version > SUPPORTED_DUMP_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }
        debug!(
            threads = self.threads.len(),
            images = self.images.len(),
            "decoded crash dump"
        );
        Ok(self)
    }
}

impl FromStr for RawDump {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<RawDump, DecodeError> {
        RawDump::from_slice(s.as_bytes())
    }
}

fn default_version() -> u32 {
    SUPPORTED_DUMP_VERSION
}

fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(idx, value)| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(
                    index = idx,
                    kind = std::any::type_name::<T>(),
                    "dropping malformed dump entry: {}",
                    err
                );
                None
            }
        })
        .collect())
}

fn strict_hex<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => decode_hex(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid hex string {:?}", s))),
        None => Ok(None),
    }
}

fn lenient_hex<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.and_then(|s| {
        let rv = decode_hex(&s);
        if rv.is_none() {
            warn!("ignoring custom data that is not hex encoded");
        }
        rv
    }))
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[test]
fn test_decode_minimal() {
    let dump: RawDump = r#"{"signal": {"name": "SIGABRT", "code": "0", "address": 0}}"#
        .parse()
        .unwrap();
    assert_eq!(dump.version, SUPPORTED_DUMP_VERSION);
    assert_eq!(dump.signal.name, "SIGABRT");
    assert!(dump.threads.is_empty());
    assert!(dump.images.is_empty());
    assert!(dump.exception.is_none());
    assert!(dump.session_id().is_none());
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(matches!(
        RawDump::from_slice(b"\x00\x01not a dump"),
        Err(DecodeError::Json(_))
    ));
    assert!(matches!(
        "{\"threads\": []}".parse::<RawDump>(),
        Err(DecodeError::Json(_))
    ));
    assert!(matches!(
        r#"{"version": 7, "signal": {"name": "SIGBUS", "code": "0", "address": 0}}"#
            .parse::<RawDump>(),
        Err(DecodeError::UnsupportedVersion(7))
    ));
}

#[test]
fn test_decode_drops_malformed_entries() {
    let dump: RawDump = r#"{
        "signal": {"name": "SIGSEGV", "code": "SEGV_MAPERR", "address": 16},
        "threads": [
            {"index": 0, "frames": [{"pc": 4096}, {"pc": "nope"}, {"pc": 4100}]},
            {"crashed": true},
            {"index": 2, "crashed": true, "registers": [{"name": "pc", "value": 1}, {"value": 2}]}
        ],
        "images": [
            {"base_address": 4096, "size": 256, "path": "/usr/lib/libc.dylib", "uuid": "zz"},
            {"base_address": 8192, "size": 256, "path": "/usr/lib/libm.dylib", "uuid": "0011"}
        ],
        "custom_data": "73657373696f6e2d31"
    }"#
    .parse()
    .unwrap();

    assert_eq!(dump.threads.len(), 2);
    assert_eq!(dump.threads[0].frames.len(), 2);
    assert_eq!(dump.threads[1].index, 2);
    assert_eq!(dump.threads[1].registers.len(), 2);
    assert!(dump.threads[1].registers[1].name.is_none());
    assert_eq!(dump.images.len(), 1);
    assert_eq!(dump.images[0].uuid.as_deref(), Some(&[0x00, 0x11][..]));
    assert_eq!(dump.session_id().as_deref(), Some("session-1"));
}

#[test]
fn test_image_range_is_half_open() {
    let image = RawImage {
        base_address: 0x1000,
        size: 0x100,
        path: None,
        uuid: None,
        code_type: None,
    };
    assert!(image.contains(0x1000));
    assert!(image.contains(0x10ff));
    assert!(!image.contains(0x1100));
    assert!(!image.contains(0xfff));
}

#[test]
fn test_hex_rejects_signs() {
    assert_eq!(decode_hex("0a1B"), Some(vec![0x0a, 0x1b]));
    assert_eq!(decode_hex("+1+2"), None);
    assert_eq!(decode_hex("-1"), None);
    assert_eq!(decode_hex("abc"), None);

    let dump: RawDump = r#"{
        "signal": {"name": "SIGSEGV", "code": "0", "address": 0},
        "images": [{"base_address": 4096, "size": 256, "uuid": "+1+2"}],
        "custom_data": "+1+2"
    }"#
    .parse()
    .unwrap();
    assert!(dump.images.is_empty());
    assert!(dump.custom_data.is_none());
}
