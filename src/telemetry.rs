//! Publishes a crash report as a telemetry span.
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::error::Error;
use crate::report::CrashReport;

pub const ATTR_COMPONENT: &str = "component";
pub const ATTR_ERROR: &str = "error";
pub const ATTR_EXCEPTION_TYPE: &str = "exception.type";
pub const ATTR_EXCEPTION_MESSAGE: &str = "exception.message";
pub const ATTR_EXCEPTION_STACKTRACE: &str = "exception.stacktrace";
pub const ATTR_CRASH_ADDRESS: &str = "crash.address";
pub const ATTR_CRASH_APP_VERSION: &str = "crash.app.version";
pub const ATTR_CRASH_SESSION_ID: &str = "crash.rumSessionId";
pub const ATTR_CRASH_INCIDENT_ID: &str = "crash.incident_id";
pub const ATTR_CRASH_SIGNAL_CODE: &str = "crash.signal.code";
pub const ATTR_CRASH_THREAD: &str = "crash.thread";
pub const ATTR_CRASH_REPORT: &str = "crash.report";

pub const COMPONENT_CRASH: &str = "crash";

/// A span the crash report is written into.
pub trait CrashSpan {
    fn set_string(&mut self, key: &'static str, value: String);
    fn set_bool(&mut self, key: &'static str, value: bool);
    fn set_int(&mut self, key: &'static str, value: i64);
    fn add_event(&mut self, name: String, timestamp: DateTime<Utc>);
    fn end(&mut self, timestamp: DateTime<Utc>);
}

/// Creates spans with an explicit start time.
pub trait SpanFactory {
    type Span: CrashSpan;

    fn start_span(&self, name: &str, start: DateTime<Utc>) -> Self::Span;
}

/// Writes `report` into a new span named after its primary fault.
///
/// `stack` is the text rendering of the crashed thread, when there is one.
pub fn emit_crash<F: SpanFactory>(
    factory: &F,
    report: &CrashReport,
    stack: Option<&str>,
) -> Result<(), Error> {
    let serialized = report.to_json_pretty().map_err(Error::Serialize)?;
    let timestamp = crash_time(report);

    let mut span = factory.start_span(report.exception_type(), timestamp);
    span.set_string(ATTR_COMPONENT, COMPONENT_CRASH.to_string());
    span.set_bool(ATTR_ERROR, true);
    span.set_string(ATTR_EXCEPTION_TYPE, report.exception_type().to_string());
    if let Some(ref exception) = report.exception {
        span.set_string(ATTR_EXCEPTION_MESSAGE, exception.reason.clone());
    }
    if let Some(thread) = report.crashed_thread() {
        span.set_int(ATTR_CRASH_THREAD, i64::from(thread.index));
        if let Some(stack) = stack {
            span.set_string(ATTR_EXCEPTION_STACKTRACE, stack.to_string());
        }
    }
    span.set_string(ATTR_CRASH_ADDRESS, report.signal.fault_address.to_string());
    span.set_string(ATTR_CRASH_SIGNAL_CODE, report.signal.code.clone());
    span.set_string(ATTR_CRASH_APP_VERSION, report.app_version.clone());
    span.set_string(ATTR_CRASH_INCIDENT_ID, report.incident_id.to_string());
    if let Some(ref session_id) = report.session_id {
        span.set_string(ATTR_CRASH_SESSION_ID, session_id.clone());
    }
    span.set_string(ATTR_CRASH_REPORT, serialized);
    span.add_event(
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        timestamp,
    );
    span.end(timestamp);

    debug!(incident_id = %report.incident_id, "emitted crash span");
    Ok(())
}

/// When the crash happened: the captured timestamp, else the process launch
/// time, else now.
fn crash_time(report: &CrashReport) -> DateTime<Utc> {
    report
        .timestamp
        .or_else(|| {
            if report.launch_time > 0.0 {
                let secs = report.launch_time.trunc() as i64;
                let nanos = (report.launch_time.fract() * 1e9) as u32;
                DateTime::<Utc>::from_timestamp(secs, nanos)
            } else {
                None
            }
        })
        .unwrap_or_else(Utc::now)
}

#[cfg(feature = "opentelemetry")]
mod otel {
    use std::time::SystemTime;

    use chrono::{DateTime, Utc};
    use opentelemetry::trace::{Span, SpanBuilder, Tracer};
    use opentelemetry::KeyValue;

    use super::{CrashSpan, SpanFactory};

    /// Starts crash spans on an OpenTelemetry tracer.
    pub struct OtelTracer<T>(pub T);

    /// An OpenTelemetry span receiving crash attributes.
    pub struct OtelSpan<S>(pub S);

    impl<T: Tracer> SpanFactory for OtelTracer<T> {
        type Span = OtelSpan<T::Span>;

        fn start_span(&self, name: &str, start: DateTime<Utc>) -> Self::Span {
            OtelSpan(
                SpanBuilder::from_name(name.to_string())
                    .with_start_time(SystemTime::from(start))
                    .start(&self.0),
            )
        }
    }

    impl<S: Span> CrashSpan for OtelSpan<S> {
        fn set_string(&mut self, key: &'static str, value: String) {
            self.0.set_attribute(KeyValue::new(key, value));
        }

        fn set_bool(&mut self, key: &'static str, value: bool) {
            self.0.set_attribute(KeyValue::new(key, value));
        }

        fn set_int(&mut self, key: &'static str, value: i64) {
            self.0.set_attribute(KeyValue::new(key, value));
        }

        fn add_event(&mut self, name: String, timestamp: DateTime<Utc>) {
            self.0
                .add_event_with_timestamp(name, SystemTime::from(timestamp), Vec::new());
        }

        fn end(&mut self, timestamp: DateTime<Utc>) {
            self.0.end_with_timestamp(SystemTime::from(timestamp));
        }
    }
}

#[cfg(feature = "opentelemetry")]
pub use self::otel::{OtelSpan, OtelTracer};

#[test]
fn test_crash_time_falls_back_to_launch_time() {
    use crate::raw::RawDump;
    use crate::report::build_report;

    let dump: RawDump = r#"{
        "process": {"start_time": 1700000000.5},
        "signal": {"name": "SIGKILL", "code": "0", "address": 0}
    }"#
    .parse()
    .unwrap();
    let report = build_report(&dump, None);
    assert_eq!(
        crash_time(&report).to_rfc3339_opts(SecondsFormat::Millis, true),
        "2023-11-14T22:13:20.500Z"
    );
}
