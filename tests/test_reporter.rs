use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use native_crash_report::{
    CrashCapture, CrashReport, CrashReporter, CrashSpan, Error, SpanFactory,
};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    String(String),
    Bool(bool),
    Int(i64),
}

#[derive(Debug, Default)]
struct RecordedSpan {
    name: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    attributes: BTreeMap<&'static str, Value>,
    events: Vec<(String, DateTime<Utc>)>,
}

impl RecordedSpan {
    fn string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RecordingFactory {
    spans: Rc<RefCell<Vec<RecordedSpan>>>,
}

struct RecordingSpan {
    span: RecordedSpan,
    sink: Rc<RefCell<Vec<RecordedSpan>>>,
}

impl CrashSpan for RecordingSpan {
    fn set_string(&mut self, key: &'static str, value: String) {
        self.span.attributes.insert(key, Value::String(value));
    }

    fn set_bool(&mut self, key: &'static str, value: bool) {
        self.span.attributes.insert(key, Value::Bool(value));
    }

    fn set_int(&mut self, key: &'static str, value: i64) {
        self.span.attributes.insert(key, Value::Int(value));
    }

    fn add_event(&mut self, name: String, timestamp: DateTime<Utc>) {
        self.span.events.push((name, timestamp));
    }

    fn end(&mut self, timestamp: DateTime<Utc>) {
        self.span.end = Some(timestamp);
        self.sink
            .borrow_mut()
            .push(std::mem::take(&mut self.span));
    }
}

impl SpanFactory for RecordingFactory {
    type Span = RecordingSpan;

    fn start_span(&self, name: &str, start: DateTime<Utc>) -> RecordingSpan {
        RecordingSpan {
            span: RecordedSpan {
                name: name.to_string(),
                start: Some(start),
                ..RecordedSpan::default()
            },
            sink: self.spans.clone(),
        }
    }
}

#[derive(Default)]
struct FakeCapture {
    pending: Option<Vec<u8>>,
    fail_load: bool,
    purged: Cell<bool>,
    custom_data: RefCell<Vec<u8>>,
}

impl FakeCapture {
    fn with_fixture(name: &str) -> FakeCapture {
        FakeCapture {
            pending: Some(fs::read(format!("tests/fixtures/{}.json", name)).unwrap()),
            ..FakeCapture::default()
        }
    }
}

impl CrashCapture for FakeCapture {
    fn has_pending_dump(&self) -> bool {
        self.pending.is_some() && !self.purged.get()
    }

    fn load_pending_dump_bytes(&self) -> io::Result<Vec<u8>> {
        if self.fail_load {
            return Err(io::Error::new(io::ErrorKind::Other, "unreadable"));
        }
        self.pending
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no dump"))
    }

    fn purge_pending_dump(&self) -> io::Result<()> {
        self.purged.set(true);
        Ok(())
    }

    fn set_custom_data(&self, data: &[u8]) {
        *self.custom_data.borrow_mut() = data.to_vec();
    }
}

fn process(capture: FakeCapture) -> (CrashReporter<FakeCapture>, Result<Option<CrashReport>, Error>, Vec<RecordedSpan>) {
    let reporter = CrashReporter::new(capture);
    let factory = RecordingFactory::default();
    let rv = reporter.process_pending(&factory);
    let spans = factory.spans.take();
    (reporter, rv, spans)
}

#[test]
fn test_nothing_pending() {
    let (reporter, rv, spans) = process(FakeCapture::default());
    assert!(rv.unwrap().is_none());
    assert!(spans.is_empty());
    assert!(!reporter.capture().purged.get());
}

#[test]
fn test_signal_crash_span() {
    let (reporter, rv, spans) = process(FakeCapture::with_fixture("segv"));
    let report = rv.unwrap().unwrap();
    assert!(reporter.capture().purged.get());
    assert_eq!(spans.len(), 1);

    let span = &spans[0];
    let crashed_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 20, 30).unwrap();
    assert_eq!(span.name, "SIGSEGV");
    assert_eq!(span.start, Some(crashed_at));
    assert_eq!(span.end, Some(crashed_at));
    assert_eq!(span.string("component"), Some("crash"));
    assert_eq!(span.attributes.get("error"), Some(&Value::Bool(true)));
    assert_eq!(span.string("exception.type"), Some("SIGSEGV"));
    assert_eq!(span.string("exception.message"), None);
    assert_eq!(span.string("crash.address"), Some("0xdead"));
    assert_eq!(span.string("crash.app.version"), Some("42"));
    assert_eq!(span.string("crash.rumSessionId"), None);
    assert_eq!(span.attributes.get("crash.thread"), Some(&Value::Int(0)));
    assert_eq!(
        span.string("crash.incident_id"),
        Some(report.incident_id.to_string().as_str())
    );
    assert_eq!(span.string("exception.stacktrace").unwrap().lines().count(), 3);

    let attached: CrashReport = span.string("crash.report").unwrap().parse().unwrap();
    assert_eq!(attached, report);

    assert_eq!(
        span.events,
        vec![("2024-01-15T10:20:30.000Z".to_string(), crashed_at)]
    );
}

#[test]
fn test_exception_crash_span() {
    let (_, rv, spans) = process(FakeCapture::with_fixture("objc_exception"));
    let report = rv.unwrap().unwrap();
    let span = &spans[0];

    assert_eq!(span.name, "NSInvalidArgumentException");
    assert_eq!(span.string("exception.type"), Some("NSInvalidArgumentException"));
    assert_eq!(
        span.string("exception.message"),
        Some("-[__NSCFNumber length]: unrecognized selector sent to instance 0x8000000000000000")
    );
    assert_eq!(span.string("crash.rumSessionId"), Some("7c0a1f52-rum-session"));
    assert_eq!(report.session_id.as_deref(), Some("7c0a1f52-rum-session"));
    assert_eq!(span.attributes.get("crash.thread"), Some(&Value::Int(1)));
    assert!(span
        .string("exception.stacktrace")
        .unwrap()
        .starts_with("0   libsystem_kernel.dylib"));
}

#[test]
fn test_malformed_dump_is_purged() {
    let capture = FakeCapture {
        pending: Some(b"{\"threads\": [".to_vec()),
        ..FakeCapture::default()
    };
    let (reporter, rv, spans) = process(capture);
    assert!(matches!(rv, Err(Error::Decode(_))));
    assert!(spans.is_empty());
    assert!(reporter.capture().purged.get());
}

#[test]
fn test_unreadable_dump_is_purged() {
    let capture = FakeCapture {
        pending: Some(Vec::new()),
        fail_load: true,
        ..FakeCapture::default()
    };
    let (reporter, rv, _) = process(capture);
    assert!(matches!(rv, Err(Error::Io(_))));
    assert!(reporter.capture().purged.get());
}

#[test]
fn test_session_id_changes_update_custom_data() {
    let reporter = CrashReporter::new(FakeCapture::default());
    reporter.on_session_id_changed("first");
    reporter.on_session_id_changed("second");
    assert_eq!(&*reporter.capture().custom_data.borrow(), b"second");
}
