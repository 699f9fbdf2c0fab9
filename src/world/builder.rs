//! Startup wiring for [`TerrainSystem`]

use std::sync::Arc;

use deepfield_diagnostics::{DiagnosticsSink, NullSink};

use super::system::TerrainSystem;
use crate::config::TerrainConfig;
use crate::core::types::Result;
use crate::core::Error;
use crate::streaming::buffers::{BufferPool, RecyclingBufferPool};
use crate::streaming::compute::{ComputeBackend, ComputeResources};
use crate::streaming::tasks::{TaskScheduler, WorkerPool};

/// Collects the collaborators a terrain system needs
///
/// The task scheduler is required. Everything else has a default: no compute
/// backend (CPU only), a [`RecyclingBufferPool`] and a [`NullSink`].
pub struct TerrainSystemBuilder {
    config: TerrainConfig,
    tasks: Option<Arc<dyn TaskScheduler>>,
    backend: Option<Arc<dyn ComputeBackend>>,
    buffers: Option<Box<dyn BufferPool>>,
    diagnostics: Option<Box<dyn DiagnosticsSink>>,
}

impl TerrainSystemBuilder {
    pub fn new(config: TerrainConfig) -> Self {
        Self {
            config,
            tasks: None,
            backend: None,
            buffers: None,
            diagnostics: None,
        }
    }

    pub fn task_scheduler(mut self, tasks: Arc<dyn TaskScheduler>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Run CPU work on a rayon pool sized by `worker_threads`
    pub fn worker_pool(self) -> Result<Self> {
        let pool = WorkerPool::new(self.config.worker_threads)?;
        Ok(self.task_scheduler(Arc::new(pool)))
    }

    pub fn compute_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn buffer_pool(mut self, buffers: Box<dyn BufferPool>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    pub fn diagnostics(mut self, sink: Box<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn build(self) -> Result<TerrainSystem> {
        let Some(tasks) = self.tasks else {
            log::error!("No task scheduler provided, terrain system disabled");
            return Err(Error::MissingCollaborator("task scheduler"));
        };
        if let Err(err) = self.config.validate() {
            log::error!("Terrain system disabled: {}", err);
            return Err(err);
        }

        let buffers = self.buffers.unwrap_or_else(|| Box::new(RecyclingBufferPool::new()));
        let resources = ComputeResources::new(self.config.processing_mode, self.backend, buffers);
        let diagnostics = self.diagnostics.unwrap_or_else(|| Box::new(NullSink));

        log::info!(
            "Terrain system ready: {:?} mode, {} scheduler, chunk size {:?}, load distance {}",
            self.config.processing_mode,
            tasks.name(),
            self.config.chunk_size,
            self.config.load_distance
        );
        Ok(TerrainSystem::from_parts(self.config, tasks, resources, diagnostics))
    }
}
