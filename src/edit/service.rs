//! Runtime terrain deformation
//!
//! Every edit is journaled first, then applied to each resident chunk whose
//! padded sample box it reaches. Chunks without density yet pick the edit up
//! from the journal when their generation lands.
//!
//! On the CPU the brush is applied to the live grid immediately. On the
//! compute backend a snapshot of the grid is edited asynchronously; the
//! readback is accepted only if the chunk's density version has not moved
//! since the snapshot, otherwise the edit is redone from a fresh snapshot,
//! and after `max_edit_retries` attempts applied on the CPU.

use super::brush::EditOp;
use super::journal::EditJournal;
use crate::streaming::buffers::{BufferDesc, BufferUsage};
use crate::streaming::compute::{ComputeBuffers, ComputeResources, DispatchId, KernelJob, KernelOutput, Readback, WorkKind};
use crate::streaming::scheduler::{release_readback, GenerationScheduler};
use crate::voxel::chunk::{Chunk, ChunkCoord};
use crate::voxel::store::ChunkStore;

/// What one `modify` call did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EditOutcome {
    /// Resident chunks the brush reached
    pub visited: usize,
    /// Chunks changed on the CPU right away
    pub applied: Vec<ChunkCoord>,
    /// Chunks handed to the compute backend
    pub dispatched: Vec<ChunkCoord>,
    /// Chunks without density yet; covered by the journal
    pub deferred: Vec<ChunkCoord>,
}

struct PendingEdit {
    coord: ChunkCoord,
    op: EditOp,
    dispatch: DispatchId,
    captured_version: u64,
    attempt: u32,
}

pub struct TerrainEditService {
    journal: EditJournal,
    pending: Vec<PendingEdit>,
    max_retries: u32,
}

impl TerrainEditService {
    pub fn new(max_retries: u32) -> Self {
        Self {
            journal: EditJournal::new(),
            pending: Vec::new(),
            max_retries,
        }
    }

    pub fn journal(&self) -> &EditJournal {
        &self.journal
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    /// Backend edits not yet read back
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Apply a brush to every resident chunk it reaches
    pub fn modify(
        &mut self,
        op: EditOp,
        store: &mut ChunkStore,
        scheduler: &mut GenerationScheduler,
        resources: &mut ComputeResources,
    ) -> EditOutcome {
        let mut outcome = EditOutcome::default();
        if !op.is_valid() {
            log::warn!("Ignoring invalid edit at {} (radius {}, strength {})", op.center, op.radius, op.strength);
            return outcome;
        }
        self.journal.record(op);

        let bounds = op.bounds();
        let reached: Vec<ChunkCoord> = store
            .coords()
            .into_iter()
            .filter(|c| store.get(*c).is_some_and(|chunk| chunk.padded_bounds().intersects(&bounds)))
            .collect();
        outcome.visited = reached.len();

        for coord in reached {
            let Some(chunk) = store.get_mut(coord) else { continue };
            if !chunk.generated {
                outcome.deferred.push(coord);
            } else if resources.use_backend(WorkKind::Edit) {
                self.dispatch(chunk, op, 0, resources);
                outcome.dispatched.push(coord);
            } else if apply_cpu(chunk, op) {
                queue_remesh(coord, store, scheduler);
                outcome.applied.push(coord);
            }
        }

        log::debug!(
            "Edit at {} r={} reached {} chunks ({} applied, {} dispatched, {} deferred)",
            op.center,
            op.radius,
            outcome.visited,
            outcome.applied.len(),
            outcome.dispatched.len(),
            outcome.deferred.len()
        );
        outcome
    }

    fn dispatch(&mut self, chunk: &Chunk, op: EditOp, attempt: u32, resources: &mut ComputeResources) -> bool {
        let Some(backend) = resources.backend().cloned() else { return false };
        let mut density = resources
            .buffers
            .request(BufferDesc::of::<f32>(chunk.grid.len(), BufferUsage::Density));
        density.write(chunk.grid.values());

        let job = KernelJob::ApplyEdit {
            origin: chunk.origin,
            voxel_size: chunk.voxel_size,
            dims: chunk.dims(),
            op,
        };
        let dispatch = backend.dispatch(job, ComputeBuffers { density, materials: None });
        self.pending.push(PendingEdit {
            coord: chunk.coord,
            op,
            dispatch,
            captured_version: chunk.density_version(),
            attempt,
        });
        true
    }

    /// Collect backend edits without blocking
    ///
    /// Returns the chunks whose density changed.
    pub fn poll(
        &mut self,
        store: &mut ChunkStore,
        scheduler: &mut GenerationScheduler,
        resources: &mut ComputeResources,
    ) -> Vec<ChunkCoord> {
        let mut changed = Vec::new();
        if self.pending.is_empty() {
            return changed;
        }
        let Some(backend) = resources.backend().cloned() else {
            // Nothing can complete; fall back for everything
            for edit in std::mem::take(&mut self.pending) {
                if self.apply_fallback(edit.coord, edit.op, store) {
                    queue_remesh(edit.coord, store, scheduler);
                    changed.push(edit.coord);
                }
            }
            return changed;
        };

        for edit in std::mem::take(&mut self.pending) {
            match backend.poll(edit.dispatch) {
                Readback::Pending => self.pending.push(edit),
                Readback::Ready { output, buffers } => {
                    let Some(chunk) = store.get_mut(edit.coord).filter(|c| c.generated) else {
                        // Unloaded or regenerating; the journal has it
                        buffers.release_into(resources.buffers.as_mut());
                        continue;
                    };

                    if chunk.density_version() != edit.captured_version {
                        buffers.release_into(resources.buffers.as_mut());
                        if edit.attempt < self.max_retries && resources.use_backend(WorkKind::Edit) {
                            log::debug!("Stale edit for chunk {}, retry {}", edit.coord, edit.attempt + 1);
                            self.dispatch(chunk, edit.op, edit.attempt + 1, resources);
                        } else {
                            log::debug!("Stale edit for chunk {}, applying on the CPU", edit.coord);
                            if apply_cpu(chunk, edit.op) {
                                queue_remesh(edit.coord, store, scheduler);
                                changed.push(edit.coord);
                            }
                        }
                        continue;
                    }

                    let touched = matches!(output, KernelOutput::Edit { changed: n } if n > 0);
                    let accepted = touched && chunk.grid.copy_from(buffers.density.read::<f32>(), None);
                    buffers.release_into(resources.buffers.as_mut());
                    if accepted {
                        mark_edited(chunk);
                        queue_remesh(edit.coord, store, scheduler);
                        changed.push(edit.coord);
                    }
                }
                Readback::Failed { error, buffers } => {
                    if let Some(buffers) = buffers {
                        buffers.release_into(resources.buffers.as_mut());
                    }
                    resources.disable_backend(&error);
                    if self.apply_fallback(edit.coord, edit.op, store) {
                        queue_remesh(edit.coord, store, scheduler);
                        changed.push(edit.coord);
                    }
                }
            }
        }
        changed
    }

    fn apply_fallback(&self, coord: ChunkCoord, op: EditOp, store: &mut ChunkStore) -> bool {
        store.get_mut(coord).filter(|c| c.generated).is_some_and(|chunk| apply_cpu(chunk, op))
    }

    /// Re-apply journaled edits to a chunk whose density just landed
    ///
    /// Returns true if the grid changed.
    pub fn replay(&self, chunk: &mut Chunk) -> bool {
        if self.journal.is_empty() || !chunk.generated {
            return false;
        }
        let applied = self.journal.replay(chunk);
        if applied > 0 {
            mark_edited(chunk);
            log::debug!("Replayed {} edits into chunk {}", applied, chunk.coord);
        }
        applied > 0
    }

    /// Force-complete and drop backend edits for one chunk
    pub fn cancel_for(&mut self, coord: ChunkCoord, resources: &mut ComputeResources) {
        let (cancelled, kept): (Vec<PendingEdit>, Vec<PendingEdit>) =
            std::mem::take(&mut self.pending).into_iter().partition(|e| e.coord == coord);
        self.pending = kept;
        let Some(backend) = resources.backend().cloned() else { return };
        for edit in cancelled {
            release_readback(backend.wait(edit.dispatch), resources);
        }
    }

    /// Force-complete and drop every backend edit
    pub fn shutdown(&mut self, resources: &mut ComputeResources) {
        let pending = std::mem::take(&mut self.pending);
        let Some(backend) = resources.backend().cloned() else { return };
        for edit in pending {
            release_readback(backend.wait(edit.dispatch), resources);
        }
    }

    /// Forget every recorded edit
    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }
}

fn mark_edited(chunk: &mut Chunk) {
    chunk.bump_density_version();
    chunk.modified = true;
    chunk.dirty = true;
}

fn apply_cpu(chunk: &mut Chunk, op: EditOp) -> bool {
    let (origin, voxel_size) = (chunk.origin, chunk.voxel_size);
    if op.apply(&mut chunk.grid, origin, voxel_size) == 0 {
        return false;
    }
    mark_edited(chunk);
    true
}

/// Remesh a chunk and its resident face neighbours
fn queue_remesh(coord: ChunkCoord, store: &ChunkStore, scheduler: &mut GenerationScheduler) {
    scheduler.request_mesh(coord);
    for neighbor in coord.neighbors() {
        if store.get(neighbor).is_some_and(|c| c.generated) {
            scheduler.request_mesh(neighbor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetSettings, ProcessingMode, TerrainConfig};
    use crate::streaming::budget::AdaptiveBudget;
    use crate::streaming::buffers::RecyclingBufferPool;
    use crate::streaming::compute::{ComputeBackend, HostComputeBackend};
    use crate::streaming::scheduler::{ChunkPhase, MeshingSettings};
    use crate::streaming::tasks::InlineScheduler;
    use crate::terrain::density::DensityField;
    use glam::{IVec3, UVec3, Vec3};
    use std::sync::Arc;

    fn nearest_sample(chunk: &Chunk, pos: Vec3) -> IVec3 {
        ((pos - chunk.origin) / chunk.voxel_size).round().as_ivec3()
    }

    struct World {
        store: ChunkStore,
        scheduler: GenerationScheduler,
        resources: ComputeResources,
        backend: Arc<HostComputeBackend>,
        field: DensityField,
        service: TerrainEditService,
    }

    fn world(mode: ProcessingMode, retries: u32) -> World {
        let config = TerrainConfig::flat(20.0);
        let field = DensityField::from_config(&config);
        let backend = Arc::new(HostComputeBackend::with_scheduler(Arc::new(InlineScheduler)));
        World {
            store: ChunkStore::new(Vec3::splat(32.0)),
            scheduler: GenerationScheduler::new(
                Arc::new(InlineScheduler),
                Arc::new(field.clone()),
                AdaptiveBudget::new(BudgetSettings::default()),
                MeshingSettings::from_config(&config),
            ),
            resources: ComputeResources::new(
                mode,
                Some(backend.clone() as Arc<dyn ComputeBackend>),
                Box::new(RecyclingBufferPool::new()),
            ),
            backend,
            field,
            service: TerrainEditService::new(retries),
        }
    }

    impl World {
        /// Resident chunk with generated density, 16 cells of 2 units
        fn generated(&mut self, coord: ChunkCoord) {
            let (chunk, _) = self.store.acquire(coord, 1, UVec3::splat(16), 2.0);
            let origin = chunk.origin;
            chunk.grid.fill(&self.field, origin, 2.0);
            chunk.generated = true;
        }

        fn modify(&mut self, op: EditOp) -> EditOutcome {
            self.service.modify(op, &mut self.store, &mut self.scheduler, &mut self.resources)
        }

        fn poll(&mut self) -> Vec<ChunkCoord> {
            self.service.poll(&mut self.store, &mut self.scheduler, &mut self.resources)
        }

        fn density_at(&self, coord: ChunkCoord, pos: Vec3) -> f32 {
            let chunk = self.store.get(coord).unwrap();
            let s = nearest_sample(chunk, pos);
            chunk.grid.get(s.x, s.y, s.z)
        }
    }

    #[test]
    fn test_cpu_edit_is_local_and_queues_neighbours() {
        let mut w = world(ProcessingMode::Cpu, 3);
        let home = ChunkCoord::new(0, 0, 0);
        w.generated(home);
        w.generated(ChunkCoord::new(1, 0, 0));
        w.generated(ChunkCoord::new(0, 0, 1));
        let version = w.store.get(home).unwrap().density_version();

        let outcome = w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 2.0, -1.0));
        assert_eq!(outcome.applied, vec![home]);
        assert_eq!(w.resources.buffers.stats().requests, 0);

        let chunk = w.store.get(home).unwrap();
        assert!(chunk.density_version() > version);
        assert!(chunk.modified);
        // Negative strength carves the centre sample out
        assert_eq!(w.density_at(home, Vec3::new(10.0, 20.0, 10.0)), 1.0);
        // Samples at 2.5+ units away are untouched
        assert_eq!(w.density_at(home, Vec3::new(10.0, 20.0, 14.0)), 0.0);
        assert_eq!(w.density_at(home, Vec3::new(10.0, 24.0, 10.0)), 1.0);

        assert_eq!(w.scheduler.phase(home), ChunkPhase::Meshing);
        assert_eq!(w.scheduler.phase(ChunkCoord::new(1, 0, 0)), ChunkPhase::Meshing);
        assert_eq!(w.scheduler.phase(ChunkCoord::new(0, 0, 1)), ChunkPhase::Meshing);
    }

    #[test]
    fn test_edit_across_chunk_border() {
        let mut w = world(ProcessingMode::Cpu, 3);
        let left = ChunkCoord::new(0, 0, 0);
        let right = ChunkCoord::new(1, 0, 0);
        w.generated(left);
        w.generated(right);

        let outcome = w.modify(EditOp::new(Vec3::new(32.0, 20.0, 8.0), 3.0, 0.5));
        assert_eq!(outcome.visited, 2);
        assert_eq!(outcome.applied.len(), 2);
        // The shared boundary sample agrees on both sides
        let at = Vec3::new(32.0, 20.0, 8.0);
        assert_eq!(w.density_at(left, at), w.density_at(right, at));
    }

    #[test]
    fn test_ungenerated_chunk_gets_edit_on_replay() {
        let mut w = world(ProcessingMode::Cpu, 3);
        let coord = ChunkCoord::new(0, 0, 0);
        w.store.acquire(coord, 1, UVec3::splat(16), 2.0);

        let outcome = w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 4.0, 1.0));
        assert_eq!(outcome.deferred, vec![coord]);
        assert_eq!(w.service.journal().len(), 1);

        w.generated(coord);
        let version = w.store.get(coord).unwrap().density_version();
        assert!(w.service.replay(w.store.get_mut(coord).unwrap()));
        assert!(w.store.get(coord).unwrap().density_version() > version);
        assert_eq!(w.density_at(coord, Vec3::new(10.0, 20.0, 10.0)), -1.0);
    }

    #[test]
    fn test_backend_edit_applies_on_readback() {
        let mut w = world(ProcessingMode::Hybrid, 3);
        let coord = ChunkCoord::new(0, 0, 0);
        w.generated(coord);

        let outcome = w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 2.0, 0.5));
        assert_eq!(outcome.dispatched, vec![coord]);
        assert!(outcome.applied.is_empty());
        assert_eq!(w.density_at(coord, Vec3::new(10.0, 20.0, 10.0)), 0.0);

        assert_eq!(w.poll(), vec![coord]);
        assert_eq!(w.density_at(coord, Vec3::new(10.0, 20.0, 10.0)), -0.5);
        assert_eq!(w.service.in_flight(), 0);
        assert_eq!(w.resources.buffers.stats().outstanding, 0);
    }

    #[test]
    fn test_stale_backend_edit_is_retried() {
        let mut w = world(ProcessingMode::Hybrid, 3);
        let coord = ChunkCoord::new(0, 0, 0);
        w.generated(coord);

        w.backend.set_paused(true);
        w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 2.0, 0.5));
        // Something else mutates the chunk while the edit is out
        let mutated = w.store.get_mut(coord).unwrap().bump_density_version();
        w.backend.set_paused(false);

        // The stale readback is dropped without touching the version
        assert!(w.poll().is_empty());
        assert_eq!(w.service.in_flight(), 1);
        assert_eq!(w.store.get(coord).unwrap().density_version(), mutated);

        assert_eq!(w.poll(), vec![coord]);
        assert_eq!(w.density_at(coord, Vec3::new(10.0, 20.0, 10.0)), -0.5);
        assert_eq!(w.store.get(coord).unwrap().density_version(), mutated + 1);
    }

    #[test]
    fn test_stale_edit_without_retries_applies_on_cpu() {
        let mut w = world(ProcessingMode::Hybrid, 0);
        let coord = ChunkCoord::new(0, 0, 0);
        w.generated(coord);

        w.backend.set_paused(true);
        w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 2.0, 0.5));
        w.store.get_mut(coord).unwrap().bump_density_version();
        w.backend.set_paused(false);

        assert_eq!(w.poll(), vec![coord]);
        assert_eq!(w.service.in_flight(), 0);
        assert_eq!(w.density_at(coord, Vec3::new(10.0, 20.0, 10.0)), -0.5);
    }

    #[test]
    fn test_backend_failure_disables_and_applies_on_cpu() {
        let mut w = world(ProcessingMode::Gpu, 3);
        let coord = ChunkCoord::new(0, 0, 0);
        w.generated(coord);
        w.backend.fail_next(1);

        w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 2.0, 0.5));
        assert_eq!(w.poll(), vec![coord]);
        assert!(w.resources.backend_disabled());
        assert_eq!(w.density_at(coord, Vec3::new(10.0, 20.0, 10.0)), -0.5);

        // Later edits go straight to the CPU
        let outcome = w.modify(EditOp::new(Vec3::new(10.0, 20.0, 20.0), 2.0, 0.5));
        assert_eq!(outcome.applied, vec![coord]);
        assert_eq!(w.resources.buffers.stats().outstanding, 0);
    }

    #[test]
    fn test_cancel_releases_edit_buffers() {
        let mut w = world(ProcessingMode::Hybrid, 3);
        let coord = ChunkCoord::new(0, 0, 0);
        w.generated(coord);
        w.backend.set_paused(true);
        w.modify(EditOp::new(Vec3::new(10.0, 20.0, 10.0), 2.0, 0.5));
        assert_eq!(w.resources.buffers.stats().outstanding, 1);

        w.service.cancel_for(coord, &mut w.resources);
        assert_eq!(w.service.in_flight(), 0);
        assert_eq!(w.resources.buffers.stats().outstanding, 0);
    }
}
