use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::extract::{Extractor, Frame, ModuleTable, ThreadRecord, DEFAULT_MAX_FRAMES};
use crate::image::{is_64_bit, Addr};
use crate::raw::RawDump;

/// Upper bound on the threads kept per report.
pub const DEFAULT_MAX_THREADS: usize = 512;

const UNKNOWN: &str = "???";

/// Bounds the work spent on a single, possibly corrupt, dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_threads: usize,
    pub max_frames: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_threads: DEFAULT_MAX_THREADS,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub name: String,
    pub code: String,
    pub fault_address: Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachExceptionRecord {
    pub exception_type: u64,
    pub codes: Vec<Addr>,
}

/// A language level exception that was in flight when the process died.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub name: String,
    pub reason: String,
    pub frames: Vec<Frame>,
}

/// The normalized form of one crash dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub incident_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub app_identifier: String,
    pub app_version: String,
    pub app_marketing_version: String,
    pub process_id: u64,
    pub process_name: String,
    pub parent_process_id: u64,
    pub parent_process_name: String,
    pub process_path: String,
    pub launch_time: f64,
    pub is_64_bit: bool,
    pub os_version: String,
    pub os_build: String,
    pub machine_model: String,
    pub signal: SignalRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mach_exception: Option<MachExceptionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionRecord>,
    pub threads: Vec<ThreadRecord>,
    pub modules: ModuleTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CrashReport {
    /// The primary fault name: the exception name if one was captured,
    /// the signal name otherwise.
    pub fn exception_type(&self) -> &str {
        match self.exception {
            Some(ref exception) => &exception.name,
            None => &self.signal.name,
        }
    }

    /// The first thread flagged as crashed, if any.
    pub fn crashed_thread(&self) -> Option<&ThreadRecord> {
        self.threads.iter().find(|thread| thread.is_crashed)
    }

    /// Serializes the report as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a report previously produced by [`CrashReport::to_json_pretty`].
    pub fn from_json(s: &str) -> Result<CrashReport, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl FromStr for CrashReport {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<CrashReport, serde_json::Error> {
        CrashReport::from_json(s)
    }
}

/// Builds a report from a decoded dump with the default [`Limits`].
pub fn build_report(dump: &RawDump, session_id: Option<&str>) -> CrashReport {
    build_report_with_limits(dump, session_id, &Limits::default())
}

pub fn build_report_with_limits(
    dump: &RawDump,
    session_id: Option<&str>,
    limits: &Limits,
) -> CrashReport {
    debug!(
        exception_type = %dump
            .exception
            .as_ref()
            .map_or(&dump.signal.name, |exception| &exception.name),
        "building crash report"
    );

    let mut extractor = Extractor::with_max_frames(dump, limits.max_frames);

    if dump.threads.len() > limits.max_threads {
        warn!(
            threads = dump.threads.len(),
            limit = limits.max_threads,
            "truncating oversized thread list"
        );
    }
    let threads: Vec<_> = dump
        .threads
        .iter()
        .take(limits.max_threads)
        .map(|thread| extractor.extract_thread(thread))
        .collect();

    let exception = dump.exception.as_ref().map(|exception| ExceptionRecord {
        name: exception.name.clone(),
        reason: exception.reason.clone(),
        frames: extractor.extract_frames(&exception.frames),
    });

    let process = dump.process.clone().unwrap_or_default();
    let application = dump.application.clone().unwrap_or_default();
    let system = dump.system.clone().unwrap_or_default();
    let machine = dump.machine.clone().unwrap_or_default();

    CrashReport {
        incident_id: Uuid::new_v4(),
        timestamp: system.timestamp,
        app_identifier: or_unknown(application.identifier),
        app_version: or_unknown(application.version),
        app_marketing_version: or_unknown(application.marketing_version),
        process_id: process.process_id.unwrap_or(0),
        process_name: or_unknown(process.process_name),
        parent_process_id: process.parent_process_id.unwrap_or(0),
        parent_process_name: or_unknown(process.parent_process_name),
        process_path: or_unknown(process.process_path),
        launch_time: process.start_time.unwrap_or(0.0),
        is_64_bit: machine.processor.map_or(false, is_64_bit),
        os_version: or_unknown(system.os_version),
        os_build: or_unknown(system.os_build),
        machine_model: or_unknown(machine.model),
        signal: SignalRecord {
            name: dump.signal.name.clone(),
            code: dump.signal.code.clone(),
            fault_address: Addr(dump.signal.address),
        },
        mach_exception: dump
            .mach_exception
            .as_ref()
            .map(|mach| MachExceptionRecord {
                exception_type: mach.exception_type,
                codes: mach.codes.iter().copied().map(Addr).collect(),
            }),
        exception,
        threads,
        modules: extractor.into_modules(),
        session_id: session_id.map(str::to_string),
    }
}

/// Decodes captured dump bytes and builds the report in one go.
pub fn decode_and_build(
    bytes: &[u8],
    session_id: Option<&str>,
) -> Result<CrashReport, DecodeError> {
    let dump = RawDump::from_slice(bytes)?;
    Ok(build_report(&dump, session_id))
}

fn or_unknown(value: Option<String>) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[test]
fn test_empty_dump_gets_placeholders() {
    let dump: RawDump = r#"{"signal": {"name": "SIGTRAP", "code": "0", "address": 0}}"#
        .parse()
        .unwrap();
    let report = build_report(&dump, None);

    assert!(report.threads.is_empty());
    assert!(report.modules.is_empty());
    assert!(report.crashed_thread().is_none());
    assert_eq!(report.process_name, "???");
    assert_eq!(report.process_path, "???");
    assert_eq!(report.app_version, "???");
    assert_eq!(report.process_id, 0);
    assert_eq!(report.parent_process_id, 0);
    assert_eq!(report.launch_time, 0.0);
    assert!(!report.is_64_bit);
    assert_eq!(report.exception_type(), "SIGTRAP");
    assert!(report.session_id.is_none());
}

#[test]
fn test_incident_id_is_fresh() {
    let dump: RawDump = r#"{"signal": {"name": "SIGTRAP", "code": "0", "address": 0}}"#
        .parse()
        .unwrap();
    assert_ne!(
        build_report(&dump, None).incident_id,
        build_report(&dump, None).incident_id
    );
}

#[test]
fn test_exception_is_primary() {
    let dump: RawDump = r#"{
        "signal": {"name": "SIGABRT", "code": "0", "address": 6442450944},
        "exception": {
            "name": "NSInvalidArgumentException",
            "reason": "unrecognized selector sent to instance",
            "frames": [{"pc": 4100}, {"pc": 4200}, {"pc": 9000}]
        },
        "threads": [{"index": 0, "crashed": true, "frames": [{"pc": 4300}]}],
        "images": [
            {"base_address": 4096, "size": 4096, "path": "/usr/lib/libobjc.A.dylib"},
            {"base_address": 8192, "size": 4096, "path": "/usr/lib/libc++abi.dylib"}
        ]
    }"#
    .parse()
    .unwrap();
    let report = build_report(&dump, Some("abc"));

    assert_eq!(report.exception_type(), "NSInvalidArgumentException");
    assert_eq!(report.signal.name, "SIGABRT");
    let exception = report.exception.as_ref().unwrap();
    assert_eq!(exception.frames.len(), 3);
    assert_eq!(report.modules.len(), 2);
    assert_eq!(report.session_id.as_deref(), Some("abc"));
}

#[test]
fn test_thread_limit() {
    let dump: RawDump = r#"{
        "signal": {"name": "SIGSEGV", "code": "0", "address": 0},
        "threads": [{"index": 0}, {"index": 1}, {"index": 2, "crashed": true}]
    }"#
    .parse()
    .unwrap();
    let limits = Limits {
        max_threads: 2,
        ..Limits::default()
    };
    let report = build_report_with_limits(&dump, None, &limits);
    assert_eq!(report.threads.len(), 2);
    assert!(report.crashed_thread().is_none());
}

#[test]
fn test_decode_and_build() {
    let report = decode_and_build(
        br#"{"signal": {"name": "SIGBUS", "code": "BUS_ADRERR", "address": 4096}}"#,
        Some("s-1"),
    )
    .unwrap();
    assert_eq!(report.signal.fault_address, Addr(0x1000));
    assert_eq!(report.session_id.as_deref(), Some("s-1"));
    assert!(decode_and_build(b"[]", None).is_err());
}
