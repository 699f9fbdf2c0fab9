//! Diagnostic event definitions - JSON-serializable records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Broad grouping used to filter the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Density grid produced and applied to a chunk
    Generation,
    /// Surface extracted and published
    Meshing,
    /// Seam mesh built or torn down
    Transition,
    /// Density edit accepted, retried or discarded
    Edit,
    /// Chunk acquired, recreated or released
    Lifecycle,
    /// Per-tick budget adjustment
    Budget,
    /// Configuration or backend fallback
    Fallback,
}

/// One entry of the append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    /// Position in the log, assigned by the sink
    #[serde(default)]
    pub sequence: u64,
    pub category: EventCategory,
    /// Chunk coordinate the event refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<[i32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lod: Option<u32>,
    /// Named counters (vertices, samples, retries, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<String, u64>,
    /// Wall-clock time spent on the work, if measured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl DiagnosticEvent {
    /// Create an empty event in the given category
    pub fn new(category: EventCategory) -> Self {
        Self {
            sequence: 0,
            category,
            chunk: None,
            lod: None,
            counts: BTreeMap::new(),
            duration_ms: None,
            message: String::new(),
        }
    }

    pub fn with_chunk(mut self, coord: [i32; 3]) -> Self {
        self.chunk = Some(coord);
        self
    }

    pub fn with_lod(mut self, lod: u32) -> Self {
        self.lod = Some(lod);
        self
    }

    /// Add (or overwrite) a named counter
    pub fn with_count(mut self, name: &str, value: u64) -> Self {
        self.counts.insert(name.to_string(), value);
        self
    }

    pub fn with_duration_ms(mut self, ms: f32) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Read back a counter, 0 if absent
    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }
}
