//! Compute backend abstraction
//!
//! Density generation, surface extraction and edits can run as kernels on a
//! [`ComputeBackend`]. A dispatch takes ownership of its scratch buffers and
//! hands them back with the readback, whether it succeeded or not, so the
//! caller can return them to the buffer pool.
//!
//! [`HostComputeBackend`] runs the kernels as data-parallel jobs on its own
//! rayon pool. It is the backend used when no device backend is plugged in,
//! and it can be told to fail for exercising the fallback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use glam::{UVec3, Vec3};
use thiserror::Error;

use super::buffers::{BufferHandle, BufferPool};
use super::tasks::{TaskHandle, TaskScheduler, TaskState, WorkerPool};
use crate::config::ProcessingMode;
use crate::core::logging::WarnOnce;
use crate::edit::brush::EditOp;
use crate::mesh::marching_cubes::{extract_parallel, ExtractLimits};
use crate::mesh::surface::MeshVertex;
use crate::terrain::density::DensityField;
use crate::voxel::grid::{sample_parallel, DensityGrid, DensityStats, GradientGrid};

/// Compute backend failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ComputeError {
    #[error("compute backend unavailable")]
    Unavailable,

    #[error("dispatch {0} is unknown or already read back")]
    UnknownDispatch(u64),

    #[error("buffer holds {actual} bytes, kernel needs {expected}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("kernel failed: {0}")]
    KernelFailed(String),
}

/// Id of one submitted kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId(pub u64);

/// Kernel with its uniforms
#[derive(Clone)]
pub enum KernelJob {
    /// Writes densities to `density` and material tags to `materials`
    GenerateDensity {
        origin: Vec3,
        voxel_size: f32,
        dims: UVec3,
        field: Arc<DensityField>,
    },
    /// Reads `density`, reads back an interleaved surface
    ExtractSurface {
        dims: UVec3,
        voxel_size: f32,
        iso_level: f32,
        limits: ExtractLimits,
    },
    /// Updates `density` in place
    ApplyEdit {
        origin: Vec3,
        voxel_size: f32,
        dims: UVec3,
        op: EditOp,
    },
}

impl KernelJob {
    pub fn name(&self) -> &'static str {
        match self {
            KernelJob::GenerateDensity { .. } => "generate_density",
            KernelJob::ExtractSurface { .. } => "extract_surface",
            KernelJob::ApplyEdit { .. } => "apply_edit",
        }
    }
}

/// Buffers bound to a dispatch
#[derive(Debug)]
pub struct ComputeBuffers {
    pub density: BufferHandle,
    pub materials: Option<BufferHandle>,
}

impl ComputeBuffers {
    /// Give every buffer back to the pool
    pub fn release_into(self, pool: &mut dyn BufferPool) {
        pool.release(self.density);
        if let Some(materials) = self.materials {
            pool.release(materials);
        }
    }
}

/// What a finished kernel produced besides its buffers
#[derive(Debug)]
pub enum KernelOutput {
    Density { stats: DensityStats },
    Surface { vertices: Vec<MeshVertex>, indices: Vec<u32>, truncated: bool },
    Edit { changed: usize },
}

/// Non-blocking readback state
#[derive(Debug)]
pub enum Readback {
    Pending,
    Ready { output: KernelOutput, buffers: ComputeBuffers },
    /// `buffers` is `None` only when the kernel itself was lost
    Failed { error: ComputeError, buffers: Option<ComputeBuffers> },
}

/// Asynchronous kernel executor
pub trait ComputeBackend: Send + Sync {
    fn is_available(&self) -> bool;

    /// Submit a kernel; errors are reported by [`poll`](Self::poll)
    fn dispatch(&self, job: KernelJob, buffers: ComputeBuffers) -> DispatchId;

    fn poll(&self, id: DispatchId) -> Readback;

    /// Block until the dispatch completes
    fn wait(&self, id: DispatchId) -> Readback;

    fn name(&self) -> &'static str;
}

type KernelResult = Result<(KernelOutput, ComputeBuffers), (ComputeError, ComputeBuffers)>;

/// Kernels executed on a host thread pool
pub struct HostComputeBackend {
    pool: Arc<dyn TaskScheduler>,
    in_flight: Mutex<HashMap<DispatchId, TaskHandle<KernelResult>>>,
    next_id: AtomicU64,
    available: AtomicBool,
    fail_next: AtomicU32,
    paused: AtomicBool,
}

impl HostComputeBackend {
    /// Backend with its own pool; `threads == 0` uses one per core
    pub fn new(threads: usize) -> crate::core::Result<Self> {
        Ok(Self::with_scheduler(Arc::new(WorkerPool::new(threads)?)))
    }

    pub fn with_scheduler(pool: Arc<dyn TaskScheduler>) -> Self {
        Self {
            pool,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Make the next `count` dispatches fail
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::Relaxed);
    }

    /// Hold finished readbacks back from [`poll`](ComputeBackend::poll)
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DispatchId, TaskHandle<KernelResult>>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn to_readback(state: TaskState<KernelResult>) -> Readback {
    match state {
        TaskState::Pending => Readback::Pending,
        TaskState::Done(Ok((output, buffers))) => Readback::Ready { output, buffers },
        TaskState::Done(Err((error, buffers))) => Readback::Failed { error, buffers: Some(buffers) },
        TaskState::Failed(message) => Readback::Failed { error: ComputeError::KernelFailed(message), buffers: None },
    }
}

fn check_len(buffer: &BufferHandle, expected: usize) -> Result<(), ComputeError> {
    let actual = buffer.bytes().len();
    if actual < expected {
        return Err(ComputeError::BufferTooSmall { expected, actual });
    }
    Ok(())
}

/// Load a density buffer into a grid of `dims`
fn grid_from_buffer(dims: UVec3, buffer: &BufferHandle) -> Result<DensityGrid, ComputeError> {
    let count = DensityGrid::sample_count_for(dims);
    check_len(buffer, count * 4)?;
    let mut grid = DensityGrid::new(dims);
    grid.copy_from(&buffer.read::<f32>()[..count], None);
    Ok(grid)
}

fn run_kernel(job: KernelJob, buffers: &mut ComputeBuffers) -> Result<KernelOutput, ComputeError> {
    match job {
        KernelJob::GenerateDensity { origin, voxel_size, dims, field } => {
            let count = DensityGrid::sample_count_for(dims);
            check_len(&buffers.density, count * 4)?;
            let materials = buffers
                .materials
                .as_mut()
                .ok_or_else(|| ComputeError::KernelFailed("material buffer not bound".to_string()))?;
            check_len(materials, count)?;
            let stats = sample_parallel(
                &field,
                origin,
                voxel_size,
                dims,
                &mut buffers.density.read_mut::<f32>()[..count],
                &mut materials.read_mut::<u8>()[..count],
            );
            Ok(KernelOutput::Density { stats })
        }
        KernelJob::ExtractSurface { dims, voxel_size, iso_level, limits } => {
            let grid = grid_from_buffer(dims, &buffers.density)?;
            let gradients = GradientGrid::from_density(&grid, voxel_size);
            let mesh = extract_parallel(&grid, &gradients, iso_level, voxel_size, limits);
            Ok(KernelOutput::Surface {
                vertices: mesh.interleaved(),
                indices: mesh.indices,
                truncated: mesh.truncated,
            })
        }
        KernelJob::ApplyEdit { origin, voxel_size, dims, op } => {
            let mut grid = grid_from_buffer(dims, &buffers.density)?;
            let changed = op.apply(&mut grid, origin, voxel_size);
            buffers.density.write(grid.values());
            Ok(KernelOutput::Edit { changed })
        }
    }
}

impl ComputeBackend for HostComputeBackend {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn dispatch(&self, job: KernelJob, mut buffers: ComputeBuffers) -> DispatchId {
        let id = DispatchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let name = job.name();
        let fail = !self.is_available() || self.take_failure();
        log::trace!("Dispatch {} ({}) submitted", id.0, name);

        let handle = self.pool.submit(move || -> KernelResult {
            if fail {
                return Err((ComputeError::KernelFailed(format!("{name} rejected by device")), buffers));
            }
            match run_kernel(job, &mut buffers) {
                Ok(output) => Ok((output, buffers)),
                Err(error) => Err((error, buffers)),
            }
        });
        self.lock().insert(id, handle);
        id
    }

    fn poll(&self, id: DispatchId) -> Readback {
        if self.paused.load(Ordering::Relaxed) {
            return if self.lock().contains_key(&id) {
                Readback::Pending
            } else {
                Readback::Failed { error: ComputeError::UnknownDispatch(id.0), buffers: None }
            };
        }

        let mut in_flight = self.lock();
        let Some(handle) = in_flight.get_mut(&id) else {
            return Readback::Failed { error: ComputeError::UnknownDispatch(id.0), buffers: None };
        };
        let readback = to_readback(handle.poll());
        if !matches!(readback, Readback::Pending) {
            in_flight.remove(&id);
        }
        readback
    }

    fn wait(&self, id: DispatchId) -> Readback {
        // Never block while holding the lock
        let Some(handle) = self.lock().remove(&id) else {
            return Readback::Failed { error: ComputeError::UnknownDispatch(id.0), buffers: None };
        };
        match handle.wait() {
            Ok(result) => to_readback(TaskState::Done(result)),
            Err(e) => Readback::Failed { error: ComputeError::KernelFailed(e.to_string()), buffers: None },
        }
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

/// Which stage of the pipeline wants to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkKind {
    Density,
    Meshing,
    Edit,
}

/// Compute backend, buffer pool and the mode deciding between them and the CPU
///
/// Owned by the terrain system and lent to the scheduler and edit service.
pub struct ComputeResources {
    backend: Option<Arc<dyn ComputeBackend>>,
    pub buffers: Box<dyn BufferPool>,
    mode: ProcessingMode,
    disabled: bool,
    disable_warning: WarnOnce,
}

impl ComputeResources {
    pub fn new(mode: ProcessingMode, backend: Option<Arc<dyn ComputeBackend>>, buffers: Box<dyn BufferPool>) -> Self {
        let resources = Self {
            backend,
            buffers,
            mode,
            disabled: false,
            disable_warning: WarnOnce::new(),
        };
        resources.check_mode();
        resources
    }

    fn check_mode(&self) {
        if self.mode == ProcessingMode::Cpu {
            return;
        }
        match &self.backend {
            None => log::warn!("Processing mode {:?} requested without a compute backend, using the CPU", self.mode),
            Some(backend) if !backend.is_available() => log::warn!(
                "Compute backend '{}' is unavailable, processing mode {:?} falls back to the CPU",
                backend.name(),
                self.mode
            ),
            Some(backend) => log::info!("Using compute backend '{}' in {:?} mode", backend.name(), self.mode),
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Switch mode, e.g. on config reload; clears an earlier failure
    pub fn set_mode(&mut self, mode: ProcessingMode) {
        self.mode = mode;
        self.disabled = false;
        self.check_mode();
    }

    pub fn backend(&self) -> Option<&Arc<dyn ComputeBackend>> {
        self.backend.as_ref()
    }

    /// Whether `kind` should be dispatched to the backend right now
    pub fn use_backend(&self, kind: WorkKind) -> bool {
        let wanted = match kind {
            WorkKind::Density => self.mode.density_on_backend(),
            WorkKind::Meshing => self.mode.meshing_on_backend(),
            WorkKind::Edit => self.mode.edits_on_backend(),
        };
        wanted && !self.disabled && self.backend.as_ref().is_some_and(|b| b.is_available())
    }

    /// Stop using the backend after a failure; logged once
    pub fn disable_backend(&mut self, reason: &ComputeError) {
        self.disabled = true;
        crate::warn_once!(
            self.disable_warning,
            "Compute backend failed ({}), continuing on the CPU",
            reason
        );
    }

    pub fn backend_disabled(&self) -> bool {
        self.disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerrainConfig;
    use crate::streaming::buffers::{BufferDesc, BufferUsage, RecyclingBufferPool};
    use crate::streaming::tasks::InlineScheduler;

    fn inline_backend() -> HostComputeBackend {
        HostComputeBackend::with_scheduler(Arc::new(InlineScheduler))
    }

    fn density_buffers(pool: &mut RecyclingBufferPool, dims: UVec3) -> ComputeBuffers {
        let count = DensityGrid::sample_count_for(dims);
        ComputeBuffers {
            density: pool.request(BufferDesc::of::<f32>(count, BufferUsage::Density)),
            materials: Some(pool.request(BufferDesc::of::<u8>(count, BufferUsage::Materials))),
        }
    }

    #[test]
    fn test_generate_matches_cpu_fill() {
        let backend = inline_backend();
        let mut pool = RecyclingBufferPool::new();
        let field = Arc::new(DensityField::from_config(&TerrainConfig::default()));
        let dims = UVec3::splat(6);
        let origin = Vec3::new(-3.0, 10.0, 7.0);

        let id = backend.dispatch(
            KernelJob::GenerateDensity { origin, voxel_size: 1.5, dims, field: field.clone() },
            density_buffers(&mut pool, dims),
        );
        let Readback::Ready { output, buffers } = backend.poll(id) else { panic!("expected readback") };
        assert!(matches!(output, KernelOutput::Density { .. }));

        let mut expected = DensityGrid::new(dims);
        expected.fill(&field, origin, 1.5);
        let count = expected.len();
        assert_eq!(&buffers.density.read::<f32>()[..count], expected.values());
        buffers.release_into(&mut pool);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_extract_surface_readback() {
        let backend = inline_backend();
        let mut pool = RecyclingBufferPool::new();
        let dims = UVec3::splat(4);
        let mut grid = DensityGrid::new(dims);
        for i in 0..grid.len() {
            let p = grid.coord_of(i);
            grid.set(p.x, p.y, p.z, p.y as f32 - 2.5);
        }
        let mut buffers = density_buffers(&mut pool, dims);
        buffers.density.write(grid.values());

        let id = backend.dispatch(
            KernelJob::ExtractSurface { dims, voxel_size: 1.0, iso_level: 0.0, limits: ExtractLimits::default() },
            buffers,
        );
        let Readback::Ready { output: KernelOutput::Surface { vertices, indices, truncated }, .. } = backend.wait(id)
        else {
            panic!("expected a surface")
        };
        assert!(!truncated);
        assert_eq!(indices.len(), 4 * 4 * 2 * 3);
        assert!(vertices.iter().all(|v| (v.position[1] - 2.5).abs() < 1e-5));
    }

    #[test]
    fn test_injected_failure_returns_buffers() {
        let backend = inline_backend();
        let mut pool = RecyclingBufferPool::new();
        backend.fail_next(1);
        let dims = UVec3::splat(2);
        let op = EditOp::new(Vec3::ONE, 1.0, 1.0);

        let id = backend.dispatch(
            KernelJob::ApplyEdit { origin: Vec3::ZERO, voxel_size: 1.0, dims, op },
            density_buffers(&mut pool, dims),
        );
        let Readback::Failed { error, buffers: Some(buffers) } = backend.poll(id) else {
            panic!("expected a failure")
        };
        assert!(matches!(error, ComputeError::KernelFailed(_)));
        buffers.release_into(&mut pool);

        // Only one failure was requested
        let id = backend.dispatch(
            KernelJob::ApplyEdit { origin: Vec3::ZERO, voxel_size: 1.0, dims, op },
            density_buffers(&mut pool, dims),
        );
        assert!(matches!(backend.poll(id), Readback::Ready { output: KernelOutput::Edit { .. }, .. }));
        assert!(matches!(backend.poll(id), Readback::Failed { error: ComputeError::UnknownDispatch(_), .. }));
    }

    #[test]
    fn test_paused_poll_stays_pending() {
        let backend = inline_backend();
        let mut pool = RecyclingBufferPool::new();
        let dims = UVec3::splat(2);
        backend.set_paused(true);
        let id = backend.dispatch(
            KernelJob::ApplyEdit { origin: Vec3::ZERO, voxel_size: 1.0, dims, op: EditOp::new(Vec3::ONE, 1.0, 1.0) },
            density_buffers(&mut pool, dims),
        );
        assert!(matches!(backend.poll(id), Readback::Pending));
        assert_eq!(backend.in_flight(), 1);
        backend.set_paused(false);
        assert!(matches!(backend.poll(id), Readback::Ready { .. }));
    }

    #[test]
    fn test_resources_mode_gating() {
        let backend: Arc<dyn ComputeBackend> = Arc::new(inline_backend());
        let pool = || Box::new(RecyclingBufferPool::new()) as Box<dyn BufferPool>;

        let cpu = ComputeResources::new(ProcessingMode::Cpu, Some(backend.clone()), pool());
        assert!(!cpu.use_backend(WorkKind::Density));

        let mut hybrid = ComputeResources::new(ProcessingMode::Hybrid, Some(backend.clone()), pool());
        assert!(hybrid.use_backend(WorkKind::Density));
        assert!(hybrid.use_backend(WorkKind::Edit));
        assert!(!hybrid.use_backend(WorkKind::Meshing));

        hybrid.disable_backend(&ComputeError::Unavailable);
        assert!(!hybrid.use_backend(WorkKind::Density));
        hybrid.set_mode(ProcessingMode::Gpu);
        assert!(hybrid.use_backend(WorkKind::Meshing));

        let missing = ComputeResources::new(ProcessingMode::Gpu, None, pool());
        assert!(!missing.use_backend(WorkKind::Density));
    }
}
