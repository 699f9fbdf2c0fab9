//! Write-only sinks for diagnostic events

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::event::DiagnosticEvent;

/// Errors raised while opening a sink. Writing never fails loudly.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open diagnostics log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only destination for diagnostic events
///
/// Implementations must not panic or block for long; the terrain tick calls
/// `record` inline.
pub trait DiagnosticsSink: Send {
    fn record(&mut self, event: DiagnosticEvent);

    /// Push buffered events to their destination
    fn flush(&mut self) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn record(&mut self, _event: DiagnosticEvent) {}
}

/// Keeps events in memory behind a shared handle
///
/// Cloning the sink shares the same buffer, so a test (or an overlay) can
/// hand one clone to the terrain system and read events from another.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(events) => events.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&mut self, mut event: DiagnosticEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        event.sequence = events.len() as u64;
        events.push(event);
    }
}

/// Appends one JSON object per line to a file
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    failed: bool,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating parent directories as needed
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| SinkError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(open_err)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        log::info!("Writing terrain diagnostics to {}", path.display());

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence: 0,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &DiagnosticEvent) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")
    }
}

impl DiagnosticsSink for JsonLinesSink {
    fn record(&mut self, mut event: DiagnosticEvent) {
        if self.failed {
            return;
        }
        event.sequence = self.next_sequence;
        self.next_sequence += 1;

        if let Err(e) = self.write_event(&event) {
            log::warn!(
                "Diagnostics log {} stopped accepting events: {}",
                self.path.display(),
                e
            );
            self.failed = true;
        }
    }

    fn flush(&mut self) {
        if !self.failed {
            if let Err(e) = self.writer.flush() {
                log::warn!("Failed to flush diagnostics log {}: {}", self.path.display(), e);
                self.failed = true;
            }
        }
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        self.flush();
    }
}
