//! This library normalizes native crash dumps left behind by a crash
//! capture facility into structured crash reports.
//!
//! A dump is decoded into a [`RawDump`], turned into a [`CrashReport`] by
//! [`build_report`], and the crashed thread can be rendered as text with
//! [`format_stack`]. [`emit_crash`] writes the result into a telemetry span
//! and [`CrashReporter`] ties these steps to the capture facility.
//!
//! The `opentelemetry` feature adds span adapters for the `opentelemetry`
//! crate.
mod error;
mod extract;
mod image;
mod raw;
mod report;
mod reporter;
mod stack;
mod telemetry;

pub use crate::error::*;
pub use crate::extract::*;
pub use crate::image::*;
pub use crate::raw::*;
pub use crate::report::*;
pub use crate::reporter::*;
pub use crate::stack::*;
pub use crate::telemetry::*;
