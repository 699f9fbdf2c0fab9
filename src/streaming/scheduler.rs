//! Per-chunk generation pipeline
//!
//! Every chunk moves through
//! `Idle -> GeneratingDensity -> AwaitingDensity -> Meshing -> AwaitingMesh -> Settled`.
//! The queued phases wait for budget; the awaiting phases have exactly one
//! task or dispatch in flight. Requests that arrive while work is in flight
//! set a deferred flag instead of starting a second task.
//!
//! Work goes to the compute backend when the processing mode asks for it and
//! the backend is healthy, otherwise to the task scheduler. A failed dispatch
//! disables the backend and the same unit is rerun on the CPU straight away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;

use super::budget::AdaptiveBudget;
use super::buffers::{BufferDesc, BufferUsage};
use super::compute::{
    ComputeBuffers, ComputeError, ComputeResources, DispatchId, KernelJob, KernelOutput, Readback, WorkKind,
};
use super::tasks::{TaskHandle, TaskScheduler, TaskState};
use crate::config::TerrainConfig;
use crate::mesh::marching_cubes::{mesh_grid, ExtractLimits};
use crate::mesh::surface::SurfaceMesh;
use crate::terrain::density::DensityField;
use crate::voxel::chunk::{Chunk, ChunkCoord, ChunkMesh, MeshHandle};
use crate::voxel::grid::DensityGrid;
use crate::voxel::store::ChunkStore;

/// Where a chunk is in the pipeline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkPhase {
    #[default]
    Idle,
    GeneratingDensity,
    AwaitingDensity,
    Meshing,
    AwaitingMesh,
    Settled,
}

impl ChunkPhase {
    /// Waiting for budget
    pub fn is_queued(self) -> bool {
        matches!(self, Self::GeneratingDensity | Self::Meshing)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::AwaitingDensity | Self::AwaitingMesh)
    }
}

/// Surface extraction parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshingSettings {
    pub iso_level: f32,
    pub limits: ExtractLimits,
    /// Publish the render surface as the collision mesh too
    pub collision_meshes: bool,
}

impl MeshingSettings {
    pub fn from_config(config: &TerrainConfig) -> Self {
        Self {
            iso_level: config.iso_level,
            limits: ExtractLimits { max_vertices: config.max_vertices_per_chunk },
            collision_meshes: config.collision_meshes,
        }
    }
}

/// Something the coordinating tick should react to
#[derive(Debug)]
pub enum SchedulerEvent {
    /// Generated density landed; edits for the chunk may be replayed now
    DensityReady { coord: ChunkCoord, lod: u32, duration_ms: f64, on_backend: bool },
    MeshReady { coord: ChunkCoord, lod: u32, mesh: ChunkMesh, duration_ms: f64, on_backend: bool },
    /// A result was discarded because the chunk changed underneath it
    Stale { coord: ChunkCoord, kind: WorkKind },
    /// The backend failed and the unit was rerun on the CPU
    BackendFallback { coord: ChunkCoord, kind: WorkKind, error: ComputeError },
    TaskFailed { coord: ChunkCoord, kind: WorkKind, message: String },
}

#[derive(Clone, Copy, Debug, Default)]
struct ChunkWork {
    phase: ChunkPhase,
    regen_pending: bool,
    remesh_pending: bool,
}

enum InFlight {
    /// The chunk's grid travels with the task and comes back filled
    CpuDensity(TaskHandle<DensityGrid>),
    BackendDensity(DispatchId),
    CpuMesh(TaskHandle<SurfaceMesh>),
    BackendMesh(DispatchId),
}

struct PendingTask {
    kind: WorkKind,
    work: InFlight,
    captured_version: u64,
    started: Instant,
}

enum Landed {
    CpuDensity(DensityGrid),
    BackendDensity(ComputeBuffers),
    CpuSurface(SurfaceMesh),
    BackendSurface(SurfaceMesh, ComputeBuffers),
    BackendFailed(ComputeError, Option<ComputeBuffers>),
    TaskFailed(String),
}

/// Issues density generation and meshing under a per-tick budget
pub struct GenerationScheduler {
    work: HashMap<ChunkCoord, ChunkWork>,
    pending: HashMap<ChunkCoord, PendingTask>,
    budget: AdaptiveBudget,
    tasks: Arc<dyn TaskScheduler>,
    field: Arc<DensityField>,
    meshing: MeshingSettings,
    next_handle: u64,
}

impl GenerationScheduler {
    pub fn new(
        tasks: Arc<dyn TaskScheduler>,
        field: Arc<DensityField>,
        budget: AdaptiveBudget,
        meshing: MeshingSettings,
    ) -> Self {
        Self {
            work: HashMap::new(),
            pending: HashMap::new(),
            budget,
            tasks,
            field,
            meshing,
            next_handle: 0,
        }
    }

    pub fn phase(&self, coord: ChunkCoord) -> ChunkPhase {
        self.work.get(&coord).map(|w| w.phase).unwrap_or_default()
    }

    /// Queued or in flight
    pub fn is_busy(&self, coord: ChunkCoord) -> bool {
        let phase = self.phase(coord);
        phase.is_queued() || phase.is_in_flight()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn queued(&self) -> usize {
        self.work.values().filter(|w| w.phase.is_queued()).count()
    }

    pub fn budget(&self) -> &AdaptiveBudget {
        &self.budget
    }

    pub fn record_frame(&mut self, dt: f32) {
        self.budget.record_frame(dt);
    }

    /// Swap the density field; only affects generation started afterwards
    pub fn set_field(&mut self, field: Arc<DensityField>) {
        self.field = field;
    }

    pub fn set_budget(&mut self, budget: AdaptiveBudget) {
        self.budget = budget;
    }

    pub fn set_meshing(&mut self, meshing: MeshingSettings) {
        self.meshing = meshing;
    }

    /// Queue a full regeneration
    pub fn request_generation(&mut self, coord: ChunkCoord) {
        let work = self.work.entry(coord).or_default();
        if work.phase.is_in_flight() {
            work.regen_pending = true;
        } else {
            work.phase = ChunkPhase::GeneratingDensity;
            work.remesh_pending = false;
        }
    }

    /// Queue remeshing from the current grid
    pub fn request_mesh(&mut self, coord: ChunkCoord) {
        let work = self.work.entry(coord).or_default();
        match work.phase {
            // Meshing follows generation anyway
            ChunkPhase::GeneratingDensity | ChunkPhase::AwaitingDensity => {}
            ChunkPhase::AwaitingMesh => work.remesh_pending = true,
            ChunkPhase::Idle | ChunkPhase::Meshing | ChunkPhase::Settled => work.phase = ChunkPhase::Meshing,
        }
    }

    /// Start queued work, nearest to the viewer first, within this tick's budget
    ///
    /// Returns how many units were started.
    pub fn dispatch(&mut self, store: &mut ChunkStore, resources: &mut ComputeResources, viewer: Vec3) -> usize {
        let size = store.chunk_size();
        let mut queued: Vec<(f32, ChunkCoord)> = self
            .work
            .iter()
            .filter(|(_, w)| w.phase.is_queued())
            .map(|(coord, _)| (viewer.distance_squared(coord.world_center(size)), *coord))
            .collect();
        queued.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut started = 0;
        for (_, coord) in queued.into_iter().take(self.budget.chunks_this_tick()) {
            if self.start(coord, store, resources) {
                started += 1;
            }
        }
        if started > 0 {
            log::trace!("Started {} chunk units, {} in flight", started, self.pending.len());
        }
        started
    }

    fn start(&mut self, coord: ChunkCoord, store: &mut ChunkStore, resources: &mut ComputeResources) -> bool {
        let Some(chunk) = store.get_mut(coord) else {
            self.work.remove(&coord);
            return false;
        };
        let Some(phase) = self.work.get(&coord).map(|w| w.phase) else { return false };

        let task = match phase {
            ChunkPhase::GeneratingDensity => self.start_density(chunk, resources),
            ChunkPhase::Meshing if !chunk.generated => self.start_density(chunk, resources),
            ChunkPhase::Meshing => self.start_mesh(chunk, resources),
            _ => return false,
        };

        let next = match task.kind {
            WorkKind::Density => ChunkPhase::AwaitingDensity,
            _ => ChunkPhase::AwaitingMesh,
        };
        if let Some(work) = self.work.get_mut(&coord) {
            work.phase = next;
        }
        self.pending.insert(coord, task);
        true
    }

    fn start_density(&mut self, chunk: &mut Chunk, resources: &mut ComputeResources) -> PendingTask {
        let started = Instant::now();
        let captured_version = chunk.density_version();
        let dims = chunk.dims();
        chunk.generated = false;

        let backend = resources.backend().cloned().filter(|_| resources.use_backend(WorkKind::Density));
        let work = match backend {
            Some(backend) => {
                let count = DensityGrid::sample_count_for(dims);
                let buffers = ComputeBuffers {
                    density: resources.buffers.request(BufferDesc::of::<f32>(count, BufferUsage::Density)),
                    materials: Some(resources.buffers.request(BufferDesc::of::<u8>(count, BufferUsage::Materials))),
                };
                let job = KernelJob::GenerateDensity {
                    origin: chunk.origin,
                    voxel_size: chunk.voxel_size,
                    dims,
                    field: self.field.clone(),
                };
                InFlight::BackendDensity(backend.dispatch(job, buffers))
            }
            None => {
                let mut grid = std::mem::replace(&mut chunk.grid, DensityGrid::detached(dims));
                grid.reset(dims);
                let field = self.field.clone();
                let (origin, voxel_size) = (chunk.origin, chunk.voxel_size);
                InFlight::CpuDensity(self.tasks.submit(move || {
                    grid.fill(&field, origin, voxel_size);
                    grid
                }))
            }
        };

        log::trace!("Generating chunk {} at LOD {}", chunk.coord, chunk.lod);
        PendingTask { kind: WorkKind::Density, work, captured_version, started }
    }

    fn start_mesh(&mut self, chunk: &mut Chunk, resources: &mut ComputeResources) -> PendingTask {
        let started = Instant::now();
        let captured_version = chunk.density_version();
        let MeshingSettings { iso_level, limits, .. } = self.meshing;
        let voxel_size = chunk.voxel_size;

        let backend = resources.backend().cloned().filter(|_| resources.use_backend(WorkKind::Meshing));
        let work = match backend {
            Some(backend) => {
                let mut density = resources
                    .buffers
                    .request(BufferDesc::of::<f32>(chunk.grid.len(), BufferUsage::Density));
                density.write(chunk.grid.values());
                let job = KernelJob::ExtractSurface { dims: chunk.dims(), voxel_size, iso_level, limits };
                InFlight::BackendMesh(backend.dispatch(job, ComputeBuffers { density, materials: None }))
            }
            None => {
                let grid = chunk.grid.clone();
                InFlight::CpuMesh(self.tasks.submit(move || mesh_grid(&grid, iso_level, voxel_size, limits)))
            }
        };

        log::trace!("Meshing chunk {} at LOD {}", chunk.coord, chunk.lod);
        PendingTask { kind: WorkKind::Meshing, work, captured_version, started }
    }

    /// Collect finished work without blocking and apply it to the store
    pub fn poll(&mut self, store: &mut ChunkStore, resources: &mut ComputeResources) -> Vec<SchedulerEvent> {
        let backend = resources.backend().cloned();
        let mut coords: Vec<ChunkCoord> = self.pending.keys().copied().collect();
        coords.sort();

        let mut events = Vec::new();
        for coord in coords {
            let Some(task) = self.pending.get_mut(&coord) else { continue };
            let landed = match &mut task.work {
                InFlight::CpuDensity(handle) => match handle.poll() {
                    TaskState::Pending => continue,
                    TaskState::Done(grid) => Landed::CpuDensity(grid),
                    TaskState::Failed(message) => Landed::TaskFailed(message),
                },
                InFlight::CpuMesh(handle) => match handle.poll() {
                    TaskState::Pending => continue,
                    TaskState::Done(mesh) => Landed::CpuSurface(mesh),
                    TaskState::Failed(message) => Landed::TaskFailed(message),
                },
                InFlight::BackendDensity(id) | InFlight::BackendMesh(id) => match backend.as_ref() {
                    Some(backend) => match readback_to_landed(backend.poll(*id)) {
                        Some(landed) => landed,
                        None => continue,
                    },
                    None => Landed::BackendFailed(ComputeError::Unavailable, None),
                },
            };
            if let Some(task) = self.pending.remove(&coord) {
                self.land(coord, task, landed, store, resources, &mut events);
            }
        }
        events
    }

    fn land(
        &mut self,
        coord: ChunkCoord,
        task: PendingTask,
        landed: Landed,
        store: &mut ChunkStore,
        resources: &mut ComputeResources,
        events: &mut Vec<SchedulerEvent>,
    ) {
        let duration_ms = task.started.elapsed().as_secs_f64() * 1000.0;
        let Some(chunk) = store.get_mut(coord) else {
            if let Landed::BackendDensity(buffers) | Landed::BackendSurface(_, buffers) = landed {
                buffers.release_into(resources.buffers.as_mut());
            }
            self.work.remove(&coord);
            return;
        };
        let mut work = self.work.get(&coord).copied().unwrap_or_default();

        match landed {
            Landed::CpuDensity(grid) => {
                chunk.grid = grid;
                self.finish_density(chunk, &mut work, task.captured_version, duration_ms, false, events);
            }
            Landed::BackendDensity(buffers) => {
                let count = DensityGrid::sample_count_for(chunk.dims());
                let copied = match &buffers.materials {
                    Some(materials) => chunk
                        .grid
                        .copy_from(&buffers.density.read::<f32>()[..count], Some(&materials.read::<u8>()[..count])),
                    None => false,
                };
                buffers.release_into(resources.buffers.as_mut());
                if copied {
                    self.finish_density(chunk, &mut work, task.captured_version, duration_ms, true, events);
                } else {
                    let error = ComputeError::KernelFailed("density readback does not match the chunk".to_string());
                    self.fall_back(coord, task.kind, error, store, resources, events);
                    return;
                }
            }
            Landed::CpuSurface(mesh) => {
                self.finish_mesh(chunk, &mut work, mesh, task.captured_version, duration_ms, false, events);
            }
            Landed::BackendSurface(mesh, buffers) => {
                buffers.release_into(resources.buffers.as_mut());
                self.finish_mesh(chunk, &mut work, mesh, task.captured_version, duration_ms, true, events);
            }
            Landed::BackendFailed(error, buffers) => {
                if let Some(buffers) = buffers {
                    buffers.release_into(resources.buffers.as_mut());
                }
                self.fall_back(coord, task.kind, error, store, resources, events);
                return;
            }
            Landed::TaskFailed(message) => {
                log::error!("{:?} task for chunk {} failed: {}", task.kind, coord, message);
                if chunk.grid.is_empty() {
                    chunk.grid = DensityGrid::new(chunk.dims());
                }
                work.phase = ChunkPhase::Idle;
                events.push(SchedulerEvent::TaskFailed { coord, kind: task.kind, message });
            }
        }

        self.work.insert(coord, work);
    }

    fn finish_density(
        &mut self,
        chunk: &mut Chunk,
        work: &mut ChunkWork,
        captured_version: u64,
        duration_ms: f64,
        on_backend: bool,
        events: &mut Vec<SchedulerEvent>,
    ) {
        if chunk.density_version() != captured_version || work.regen_pending {
            log::debug!("Discarding stale density for chunk {}", chunk.coord);
            work.regen_pending = false;
            work.phase = ChunkPhase::GeneratingDensity;
            events.push(SchedulerEvent::Stale { coord: chunk.coord, kind: WorkKind::Density });
            return;
        }

        chunk.generated = true;
        chunk.dirty = true;
        chunk.bump_density_version();
        let anomalies = chunk.grid.anomalies();
        if anomalies > 0 {
            chunk.anomalous = true;
            log::warn!("Chunk {} produced {} non-finite density samples", chunk.coord, anomalies);
        }

        work.phase = ChunkPhase::Meshing;
        events.push(SchedulerEvent::DensityReady { coord: chunk.coord, lod: chunk.lod, duration_ms, on_backend });
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_mesh(
        &mut self,
        chunk: &mut Chunk,
        work: &mut ChunkWork,
        surface: SurfaceMesh,
        captured_version: u64,
        duration_ms: f64,
        on_backend: bool,
        events: &mut Vec<SchedulerEvent>,
    ) {
        // Both paths below mesh again, which covers a pending remesh
        if work.regen_pending {
            work.regen_pending = false;
            work.remesh_pending = false;
            work.phase = ChunkPhase::GeneratingDensity;
            return;
        }
        if chunk.density_version() != captured_version {
            log::debug!("Discarding stale mesh for chunk {}", chunk.coord);
            work.remesh_pending = false;
            work.phase = ChunkPhase::Meshing;
            events.push(SchedulerEvent::Stale { coord: chunk.coord, kind: WorkKind::Meshing });
            return;
        }

        self.next_handle += 1;
        let surface = Arc::new(surface);
        let mesh = ChunkMesh {
            handle: MeshHandle(self.next_handle),
            collision: self.meshing.collision_meshes.then(|| surface.clone()),
            surface,
            density_version: captured_version,
        };
        chunk.mesh = Some(mesh.clone());
        chunk.mesh_version += 1;
        chunk.dirty = false;

        work.phase = if work.remesh_pending {
            work.remesh_pending = false;
            ChunkPhase::Meshing
        } else {
            ChunkPhase::Settled
        };
        log::debug!(
            "Chunk {} meshed at LOD {}: {} triangles in {:.2} ms",
            chunk.coord,
            chunk.lod,
            mesh.surface.triangle_count(),
            duration_ms
        );
        events.push(SchedulerEvent::MeshReady { coord: chunk.coord, lod: chunk.lod, mesh, duration_ms, on_backend });
    }

    /// Disable the backend and rerun the failed unit on the CPU now
    fn fall_back(
        &mut self,
        coord: ChunkCoord,
        kind: WorkKind,
        error: ComputeError,
        store: &mut ChunkStore,
        resources: &mut ComputeResources,
        events: &mut Vec<SchedulerEvent>,
    ) {
        resources.disable_backend(&error);
        let work = self.work.entry(coord).or_default();
        work.phase = match kind {
            WorkKind::Density => ChunkPhase::GeneratingDensity,
            _ => ChunkPhase::Meshing,
        };
        events.push(SchedulerEvent::BackendFallback { coord, kind, error });
        self.start(coord, store, resources);
    }

    /// Force-complete and discard any work for `coord`, then forget it
    ///
    /// Blocks until the task or dispatch finishes. Buffers go back to the
    /// pool and a grid out on a worker is returned to the chunk.
    pub fn cancel(&mut self, coord: ChunkCoord, store: &mut ChunkStore, resources: &mut ComputeResources) {
        self.work.remove(&coord);
        let Some(task) = self.pending.remove(&coord) else { return };

        match task.work {
            InFlight::CpuDensity(handle) => {
                let grid = handle.wait();
                if let Some(chunk) = store.get_mut(coord) {
                    chunk.grid = match grid {
                        Ok(grid) => grid,
                        Err(_) => DensityGrid::new(chunk.dims()),
                    };
                    chunk.generated = false;
                }
            }
            InFlight::CpuMesh(handle) => {
                let _ = handle.wait();
            }
            InFlight::BackendDensity(id) | InFlight::BackendMesh(id) => {
                if let Some(backend) = resources.backend().cloned() {
                    release_readback(backend.wait(id), resources);
                }
            }
        }
        log::debug!("Cancelled {:?} work for chunk {}", task.kind, coord);
    }

    /// Forget a chunk that has no work in flight
    pub fn forget(&mut self, coord: ChunkCoord) {
        if !self.pending.contains_key(&coord) {
            self.work.remove(&coord);
        }
    }

    /// Cancel everything outstanding
    pub fn shutdown(&mut self, store: &mut ChunkStore, resources: &mut ComputeResources) {
        let mut coords: Vec<ChunkCoord> = self.pending.keys().copied().collect();
        coords.sort();
        let count = coords.len();
        for coord in coords {
            self.cancel(coord, store, resources);
        }
        self.work.clear();
        if count > 0 {
            log::info!("Generation scheduler stopped, {} tasks cancelled", count);
        }
    }
}

fn readback_to_landed(readback: Readback) -> Option<Landed> {
    match readback {
        Readback::Pending => None,
        Readback::Ready { output: KernelOutput::Density { .. }, buffers } => Some(Landed::BackendDensity(buffers)),
        Readback::Ready { output: KernelOutput::Surface { vertices, indices, truncated }, buffers } => {
            let mut mesh = SurfaceMesh::from_interleaved(&vertices, &indices);
            mesh.truncated = truncated;
            Some(Landed::BackendSurface(mesh, buffers))
        }
        Readback::Ready { output: KernelOutput::Edit { .. }, buffers } => Some(Landed::BackendFailed(
            ComputeError::KernelFailed("unexpected edit readback".to_string()),
            Some(buffers),
        )),
        Readback::Failed { error, buffers } => Some(Landed::BackendFailed(error, buffers)),
    }
}

/// Return whatever buffers a discarded readback carries
pub(crate) fn release_readback(readback: Readback, resources: &mut ComputeResources) {
    match readback {
        Readback::Ready { buffers, .. } | Readback::Failed { buffers: Some(buffers), .. } => {
            buffers.release_into(resources.buffers.as_mut());
        }
        Readback::Pending | Readback::Failed { buffers: None, .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetSettings, ProcessingMode};
    use crate::streaming::buffers::RecyclingBufferPool;
    use crate::streaming::compute::{ComputeBackend, HostComputeBackend};
    use crate::streaming::tasks::InlineScheduler;
    use glam::UVec3;

    struct Fixture {
        store: ChunkStore,
        resources: ComputeResources,
        scheduler: GenerationScheduler,
        backend: Arc<HostComputeBackend>,
    }

    fn fixture(mode: ProcessingMode, per_tick: u32) -> Fixture {
        let config = TerrainConfig::flat(4.5);
        let backend = Arc::new(HostComputeBackend::with_scheduler(Arc::new(InlineScheduler)));
        let resources = ComputeResources::new(
            mode,
            Some(backend.clone() as Arc<dyn ComputeBackend>),
            Box::new(RecyclingBufferPool::new()),
        );
        let budget = AdaptiveBudget::new(BudgetSettings { adaptive: false, chunks_per_tick: per_tick, ..Default::default() });
        let scheduler = GenerationScheduler::new(
            Arc::new(InlineScheduler),
            Arc::new(DensityField::from_config(&config)),
            budget,
            MeshingSettings::from_config(&config),
        );
        Fixture { store: ChunkStore::new(Vec3::splat(8.0)), resources, scheduler, backend }
    }

    impl Fixture {
        fn load(&mut self, coord: ChunkCoord) {
            self.store.acquire(coord, 0, UVec3::splat(8), 1.0);
            self.scheduler.request_generation(coord);
        }

        fn step(&mut self) -> Vec<SchedulerEvent> {
            self.scheduler.dispatch(&mut self.store, &mut self.resources, Vec3::ZERO);
            self.scheduler.poll(&mut self.store, &mut self.resources)
        }
    }

    #[test]
    fn test_cpu_pipeline_settles_without_buffers() {
        let mut f = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.load(coord);

        let events = f.step();
        assert!(matches!(events.as_slice(), [SchedulerEvent::DensityReady { on_backend: false, .. }]));
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::Meshing);

        let events = f.step();
        let [SchedulerEvent::MeshReady { mesh, .. }] = events.as_slice() else { panic!("expected a mesh") };
        assert_eq!(mesh.surface.triangle_count(), 8 * 8 * 2);
        assert!(Arc::ptr_eq(&mesh.surface, mesh.collision.as_ref().unwrap()));
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::Settled);

        let chunk = f.store.get(coord).unwrap();
        assert!(chunk.generated && !chunk.dirty);
        assert_eq!(chunk.mesh_version, 1);
        assert_eq!(f.resources.buffers.stats().requests, 0);
    }

    #[test]
    fn test_repeated_requests_are_deferred() {
        let mut f = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.load(coord);
        f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO);
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::AwaitingDensity);

        f.scheduler.request_mesh(coord);
        f.scheduler.request_generation(coord);
        assert_eq!(f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO), 0);
        assert_eq!(f.scheduler.in_flight(), 1);

        // The deferred regeneration replaces the landed result
        let version = f.store.get(coord).unwrap().density_version();
        let events = f.scheduler.poll(&mut f.store, &mut f.resources);
        assert_eq!(f.store.get(coord).unwrap().density_version(), version);
        assert!(matches!(events.as_slice(), [SchedulerEvent::Stale { kind: WorkKind::Density, .. }]));
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::GeneratingDensity);
    }

    #[test]
    fn test_nearest_first_within_budget() {
        let mut f = fixture(ProcessingMode::Cpu, 1);
        let far = ChunkCoord::new(5, 0, 0);
        let near = ChunkCoord::new(0, 0, 1);
        f.load(far);
        f.load(near);

        assert_eq!(f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO), 1);
        assert_eq!(f.scheduler.phase(near), ChunkPhase::AwaitingDensity);
        assert_eq!(f.scheduler.phase(far), ChunkPhase::GeneratingDensity);
        assert_eq!(f.scheduler.queued(), 1);
    }

    #[test]
    fn test_backend_pipeline_matches_cpu() {
        let mut gpu = fixture(ProcessingMode::Gpu, 4);
        let mut cpu = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        gpu.load(coord);
        cpu.load(coord);
        for _ in 0..2 {
            gpu.step();
            cpu.step();
        }

        let gpu_chunk = gpu.store.get(coord).unwrap();
        let cpu_chunk = cpu.store.get(coord).unwrap();
        assert_eq!(gpu_chunk.grid.values(), cpu_chunk.grid.values());
        assert_eq!(
            gpu_chunk.mesh.as_ref().unwrap().surface.triangle_count(),
            cpu_chunk.mesh.as_ref().unwrap().surface.triangle_count()
        );
        let stats = gpu.resources.buffers.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_backend_failure_falls_back_once() {
        let mut f = fixture(ProcessingMode::Gpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.backend.fail_next(1);
        f.load(coord);

        let events = f.step();
        assert!(matches!(
            events.as_slice(),
            [SchedulerEvent::BackendFallback { kind: WorkKind::Density, .. }]
        ));
        assert!(f.resources.backend_disabled());
        // Rerun on the CPU immediately
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::AwaitingDensity);

        let events = f.scheduler.poll(&mut f.store, &mut f.resources);
        assert!(matches!(events.as_slice(), [SchedulerEvent::DensityReady { on_backend: false, .. }]));
        assert_eq!(f.resources.buffers.stats().outstanding, 0);
    }

    #[test]
    fn test_stale_mesh_is_discarded() {
        let mut f = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.load(coord);
        f.step();
        f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO);

        // An edit lands while the mesh is in flight
        let before = f.store.get(coord).unwrap().density_version();
        f.store.get_mut(coord).unwrap().bump_density_version();
        let edited = f.store.get(coord).unwrap().density_version();
        assert_eq!(edited, before + 1);

        let events = f.scheduler.poll(&mut f.store, &mut f.resources);
        assert!(matches!(events.as_slice(), [SchedulerEvent::Stale { kind: WorkKind::Meshing, .. }]));
        assert!(f.store.get(coord).unwrap().mesh.is_none());
        assert_eq!(f.store.get(coord).unwrap().density_version(), edited);

        let events = f.step();
        let [SchedulerEvent::MeshReady { mesh, .. }] = events.as_slice() else { panic!("expected a mesh") };
        assert_eq!(mesh.density_version, edited);
        assert_eq!(f.store.get(coord).unwrap().density_version(), edited);
    }

    #[test]
    fn test_stale_mesh_drops_pending_remesh() {
        let mut f = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.load(coord);
        f.step();
        f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO);
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::AwaitingMesh);

        // Edit and remesh request while the mesh is in flight
        f.store.get_mut(coord).unwrap().bump_density_version();
        f.scheduler.request_mesh(coord);

        let events = f.scheduler.poll(&mut f.store, &mut f.resources);
        assert!(matches!(events.as_slice(), [SchedulerEvent::Stale { kind: WorkKind::Meshing, .. }]));

        // One fresh mesh settles the chunk, no second pass
        let events = f.step();
        assert!(matches!(events.as_slice(), [SchedulerEvent::MeshReady { .. }]));
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::Settled);
        assert_eq!(f.scheduler.queued(), 0);
        assert_eq!(f.store.get(coord).unwrap().mesh_version, 1);
    }

    #[test]
    fn test_density_version_rises_once_per_accepted_result() {
        let mut f = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.load(coord);
        let initial = f.store.get(coord).unwrap().density_version();

        // Regeneration requested while density is in flight: the result is stale
        f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO);
        f.scheduler.request_generation(coord);
        let events = f.scheduler.poll(&mut f.store, &mut f.resources);
        assert!(matches!(events.as_slice(), [SchedulerEvent::Stale { kind: WorkKind::Density, .. }]));
        assert_eq!(f.store.get(coord).unwrap().density_version(), initial);
        assert!(!f.store.get(coord).unwrap().generated);

        let events = f.step();
        assert!(matches!(events.as_slice(), [SchedulerEvent::DensityReady { .. }]));
        assert_eq!(f.store.get(coord).unwrap().density_version(), initial + 1);

        // Meshing reads the version, it never moves it
        let events = f.step();
        assert!(matches!(events.as_slice(), [SchedulerEvent::MeshReady { .. }]));
        assert_eq!(f.store.get(coord).unwrap().density_version(), initial + 1);
    }

    #[test]
    fn test_cancel_releases_buffers() {
        let mut f = fixture(ProcessingMode::Gpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.backend.set_paused(true);
        f.load(coord);
        f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO);
        assert!(matches!(f.scheduler.poll(&mut f.store, &mut f.resources).as_slice(), []));
        assert_eq!(f.resources.buffers.stats().outstanding, 2);

        f.scheduler.cancel(coord, &mut f.store, &mut f.resources);
        assert_eq!(f.resources.buffers.stats().outstanding, 0);
        assert_eq!(f.scheduler.phase(coord), ChunkPhase::Idle);
        assert_eq!(f.scheduler.in_flight(), 0);
        assert_eq!(f.backend.in_flight(), 0);
    }

    #[test]
    fn test_cancel_returns_cpu_grid() {
        let mut f = fixture(ProcessingMode::Cpu, 4);
        let coord = ChunkCoord::new(0, 0, 0);
        f.load(coord);
        f.scheduler.dispatch(&mut f.store, &mut f.resources, Vec3::ZERO);
        assert!(f.store.get(coord).unwrap().grid.is_empty());

        f.scheduler.cancel(coord, &mut f.store, &mut f.resources);
        let chunk = f.store.get(coord).unwrap();
        assert_eq!(chunk.grid.len(), DensityGrid::sample_count_for(UVec3::splat(8)));
        assert!(!chunk.generated);
    }
}
