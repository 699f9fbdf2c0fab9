//! Diagnostics for deepfield - structured, append-only terrain event log
//!
//! The terrain core writes events into a [`DiagnosticsSink`]; it never reads
//! them back, so sinks are free to buffer, drop or persist them:
//! ```
//! use deepfield_diagnostics::{DiagnosticEvent, DiagnosticsSink, EventCategory, MemorySink};
//!
//! let mut sink = MemorySink::new();
//! sink.record(DiagnosticEvent::new(EventCategory::Generation).with_count("samples", 35_937));
//! assert_eq!(sink.len(), 1);
//! ```

pub mod event;
pub mod sink;

pub use event::*;
pub use sink::{DiagnosticsSink, JsonLinesSink, MemorySink, NullSink, SinkError};
