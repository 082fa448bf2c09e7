use std::io;

use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::raw::RawDump;
use crate::report::{build_report_with_limits, CrashReport, Limits};
use crate::stack::format_stack;
use crate::telemetry::{emit_crash, SpanFactory};

/// The facility that captures crashes and keeps the dump until the next
/// launch.
pub trait CrashCapture {
    fn has_pending_dump(&self) -> bool;
    fn load_pending_dump_bytes(&self) -> io::Result<Vec<u8>>;
    fn purge_pending_dump(&self) -> io::Result<()>;
    /// Attaches bytes that get embedded into the next captured dump.
    fn set_custom_data(&self, data: &[u8]);
}

/// Handle created once at startup and kept for the lifetime of the process.
#[derive(Debug)]
pub struct CrashReporter<C> {
    capture: C,
    limits: Limits,
}

impl<C: CrashCapture> CrashReporter<C> {
    pub fn new(capture: C) -> CrashReporter<C> {
        CrashReporter {
            capture,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> CrashReporter<C> {
        self.limits = limits;
        self
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    /// Called by the session manager whenever the session id rotates so a
    /// later crash can be attributed to it.
    pub fn on_session_id_changed(&self, new_id: &str) {
        debug!(session_id = new_id, "updating crash custom data");
        self.capture.set_custom_data(new_id.as_bytes());
    }

    /// Turns the dump left behind by a previous launch into a report and a
    /// crash span.
    ///
    /// The dump is purged whether or not processing succeeded, so a dump
    /// that cannot be processed is reported once and then gone.
    pub fn process_pending<F: SpanFactory>(
        &self,
        factory: &F,
    ) -> Result<Option<CrashReport>, Error> {
        if !self.capture.has_pending_dump() {
            debug!("no pending crash dump");
            return Ok(None);
        }

        let rv = self.report_pending(factory);
        match rv {
            Ok(ref report) => info!(
                incident_id = %report.incident_id,
                exception_type = report.exception_type(),
                "processed pending crash dump"
            ),
            Err(ref err) => error!("failed to process pending crash dump: {}", err),
        }

        if let Err(err) = self.capture.purge_pending_dump() {
            warn!("failed to purge pending crash dump: {}", err);
        }

        rv.map(Some)
    }

    fn report_pending<F: SpanFactory>(&self, factory: &F) -> Result<CrashReport, Error> {
        let bytes = self.capture.load_pending_dump_bytes()?;
        let dump = RawDump::from_slice(&bytes)?;
        let session_id = dump.session_id();
        let report = build_report_with_limits(&dump, session_id.as_deref(), &self.limits);
        let stack = report
            .crashed_thread()
            .map(|thread| format_stack(thread, &dump));
        emit_crash(factory, &report, stack.as_deref())?;
        Ok(report)
    }
}
