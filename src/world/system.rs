//! The coordinating terrain system
//!
//! Owned by the application loop, which calls [`TerrainSystem::tick`] once
//! per frame. A tick:
//! 1. feeds the frame time to the adaptive budget
//! 2. unloads chunks past the load radius plus hysteresis
//! 3. creates missing chunks (and recreates ones whose LOD changed)
//! 4. collects finished generation, meshing and edit work
//! 5. starts new work, nearest first, within the budget
//! 6. brings LOD seams up to date
//!
//! Everything the renderer or physics needs comes out of
//! [`TerrainSystem::drain_events`].

use std::sync::Arc;

use deepfield_diagnostics::{DiagnosticEvent, DiagnosticsSink, EventCategory};
use glam::Vec3;

use super::builder::TerrainSystemBuilder;
use crate::config::TerrainConfig;
use crate::core::types::Result;
use crate::edit::brush::EditOp;
use crate::edit::journal::EditJournal;
use crate::edit::service::{EditOutcome, TerrainEditService};
use crate::math::Frustum;
use crate::mesh::surface::SurfaceMesh;
use crate::mesh::transition::TransitionKey;
use crate::streaming::budget::AdaptiveBudget;
use crate::streaming::buffers::BufferStats;
use crate::streaming::compute::{ComputeResources, WorkKind};
use crate::streaming::lod::{LodPolicy, TransitionChange};
use crate::streaming::scheduler::{GenerationScheduler, MeshingSettings, SchedulerEvent};
use crate::streaming::tasks::TaskScheduler;
use crate::terrain::density::DensityField;
use crate::voxel::chunk::{ChunkCoord, ChunkMesh};
use crate::voxel::store::{ChunkStore, ReleasedChunk};

/// Where the terrain is looked at from
#[derive(Clone, Copy, Debug)]
pub struct Viewer {
    pub position: Vec3,
    /// Chunks outside it are not created, except next to the viewer
    pub frustum: Option<Frustum>,
}

impl Viewer {
    pub fn at(position: Vec3) -> Self {
        Self { position, frustum: None }
    }

    pub fn with_frustum(mut self, frustum: Frustum) -> Self {
        self.frustum = Some(frustum);
        self
    }
}

/// Outbound change for the renderer and physics
#[derive(Clone, Debug)]
pub enum TerrainEvent {
    /// New or replaced surface for a chunk
    MeshReady { coord: ChunkCoord, lod: u32, mesh: ChunkMesh },
    MeshRemoved { coord: ChunkCoord },
    TransitionReady { key: TransitionKey, mesh: Arc<SurfaceMesh> },
    TransitionRemoved { key: TransitionKey },
}

/// What one tick did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub loaded: usize,
    pub unloaded: usize,
    /// Recreated at a different LOD
    pub recreated: usize,
    /// Skipped because they were outside the view frustum
    pub culled: usize,
    /// Generation or meshing units started
    pub started: usize,
    pub meshed: usize,
    /// Chunks changed by backend edits landing this tick
    pub edited: usize,
}

pub struct TerrainSystem {
    config: TerrainConfig,
    field: Arc<DensityField>,
    lod: LodPolicy,
    store: ChunkStore,
    scheduler: GenerationScheduler,
    edits: TerrainEditService,
    resources: ComputeResources,
    diagnostics: Box<dyn DiagnosticsSink>,
    events: Vec<TerrainEvent>,
    shut_down: bool,
}

impl TerrainSystem {
    pub fn builder(config: TerrainConfig) -> TerrainSystemBuilder {
        TerrainSystemBuilder::new(config)
    }

    pub(super) fn from_parts(
        config: TerrainConfig,
        tasks: Arc<dyn TaskScheduler>,
        resources: ComputeResources,
        diagnostics: Box<dyn DiagnosticsSink>,
    ) -> Self {
        let field = Arc::new(DensityField::from_config(&config));
        let scheduler = GenerationScheduler::new(
            tasks,
            field.clone(),
            AdaptiveBudget::new(config.budget.clone()),
            MeshingSettings::from_config(&config),
        );
        Self {
            field,
            lod: LodPolicy::from_config(&config),
            store: ChunkStore::new(config.chunk_extent()),
            scheduler,
            edits: TerrainEditService::new(config.max_edit_retries),
            resources,
            diagnostics,
            events: Vec::new(),
            shut_down: false,
            config,
        }
    }

    /// Advance streaming, generation, edits and seams by one frame
    pub fn tick(&mut self, dt: f32, viewer: &Viewer) -> TickStats {
        let mut stats = TickStats::default();
        if self.shut_down {
            return stats;
        }

        let budget_before = self.scheduler.budget().chunks_this_tick();
        self.scheduler.record_frame(dt);
        let budget = self.scheduler.budget().chunks_this_tick();
        if budget != budget_before {
            let fps = self.scheduler.budget().smoothed_fps().unwrap_or_default();
            self.record(
                DiagnosticEvent::new(EventCategory::Budget)
                    .with_count("chunks_per_tick", budget as u64)
                    .with_message(format!("{fps:.1} fps")),
            );
        }

        let center = ChunkCoord::from_world_pos(viewer.position, self.store.chunk_size());
        self.stream(center, viewer, &mut stats);
        self.collect(&mut stats);
        stats.started = self.scheduler.dispatch(&mut self.store, &mut self.resources, viewer.position);
        self.refresh_seams();

        if stats.loaded + stats.unloaded + stats.recreated > 0 {
            log::debug!(
                "Tick: {} loaded, {} unloaded, {} recreated, {} resident",
                stats.loaded,
                stats.unloaded,
                stats.recreated,
                self.store.len()
            );
        }
        stats
    }

    fn stream(&mut self, center: ChunkCoord, viewer: &Viewer, stats: &mut TickStats) {
        let radius = self.config.load_radius_chunks();
        let vertical = self.config.vertical_load_radius;
        let margin = self.config.unload_hysteresis;

        for coord in self.store.coords_beyond(radius + margin, vertical + margin, center) {
            self.unload(coord);
            stats.unloaded += 1;
        }

        let mut wanted: Vec<ChunkCoord> = ChunkStore::get_visible(radius, vertical, center).into_iter().collect();
        wanted.sort();
        for coord in wanted {
            let lod = self.lod.level_for_chunk(coord, viewer.position);
            match self.store.get(coord) {
                Some(chunk) if chunk.lod == lod => continue,
                Some(_) => stats.recreated += 1,
                None if !self.in_view(coord, center, viewer) => {
                    stats.culled += 1;
                    continue;
                }
                None => stats.loaded += 1,
            }
            self.load(coord, lod);
        }
    }

    fn in_view(&self, coord: ChunkCoord, center: ChunkCoord, viewer: &Viewer) -> bool {
        let Some(frustum) = &viewer.frustum else { return true };
        let adjacent = (coord.as_ivec3() - center.as_ivec3()).abs().max_element() <= 1;
        adjacent || frustum.intersects_aabb(&coord.world_bounds(self.store.chunk_size()))
    }

    fn load(&mut self, coord: ChunkCoord, lod: u32) {
        let dims = self.lod.dimensions(lod);
        let voxel_size = self.lod.voxel_size(lod);
        // Work for the old chunk must not land on its replacement
        self.scheduler.cancel(coord, &mut self.store, &mut self.resources);
        self.edits.cancel_for(coord, &mut self.resources);
        let (_, replaced) = self.store.acquire(coord, lod, dims, voxel_size);
        if let Some(released) = replaced {
            self.announce_release(released);
        }
        self.scheduler.request_generation(coord);
        self.record(
            DiagnosticEvent::new(EventCategory::Lifecycle)
                .with_chunk(coord.to_array())
                .with_lod(lod)
                .with_message("acquired"),
        );
    }

    /// Cancel work for a chunk, release it and announce what disappeared
    fn unload(&mut self, coord: ChunkCoord) {
        self.scheduler.cancel(coord, &mut self.store, &mut self.resources);
        self.edits.cancel_for(coord, &mut self.resources);
        if let Some(released) = self.store.release(coord) {
            self.announce_release(released);
        }
    }

    fn announce_release(&mut self, released: ReleasedChunk) {
        let coord = released.coord;
        if released.had_mesh {
            self.events.push(TerrainEvent::MeshRemoved { coord });
        }
        for key in &released.transitions {
            self.events.push(TerrainEvent::TransitionRemoved { key: *key });
        }
        self.record(
            DiagnosticEvent::new(EventCategory::Lifecycle)
                .with_chunk(coord.to_array())
                .with_lod(released.lod)
                .with_count("transitions", released.transitions.len() as u64)
                .with_message("released"),
        );
    }

    fn collect(&mut self, stats: &mut TickStats) {
        for event in self.scheduler.poll(&mut self.store, &mut self.resources) {
            match event {
                SchedulerEvent::DensityReady { coord, lod, duration_ms, on_backend } => {
                    let replayed = self.store.get_mut(coord).is_some_and(|chunk| self.edits.replay(chunk));
                    self.record(
                        DiagnosticEvent::new(EventCategory::Generation)
                            .with_chunk(coord.to_array())
                            .with_lod(lod)
                            .with_count("replayed", replayed as u64)
                            .with_count("backend", on_backend as u64)
                            .with_duration_ms(duration_ms as f32),
                    );
                }
                SchedulerEvent::MeshReady { coord, lod, mesh, duration_ms, on_backend } => {
                    stats.meshed += 1;
                    self.record(
                        DiagnosticEvent::new(EventCategory::Meshing)
                            .with_chunk(coord.to_array())
                            .with_lod(lod)
                            .with_count("vertices", mesh.surface.vertex_count() as u64)
                            .with_count("triangles", mesh.surface.triangle_count() as u64)
                            .with_count("truncated", mesh.surface.truncated as u64)
                            .with_count("backend", on_backend as u64)
                            .with_duration_ms(duration_ms as f32),
                    );
                    self.events.push(TerrainEvent::MeshReady { coord, lod, mesh });
                }
                SchedulerEvent::Stale { coord, kind } => {
                    self.record(
                        DiagnosticEvent::new(category_for(kind))
                            .with_chunk(coord.to_array())
                            .with_message("stale result discarded"),
                    );
                }
                SchedulerEvent::BackendFallback { coord, kind, error } => {
                    self.record(
                        DiagnosticEvent::new(EventCategory::Fallback)
                            .with_chunk(coord.to_array())
                            .with_message(format!("{kind:?} moved to the CPU: {error}")),
                    );
                }
                SchedulerEvent::TaskFailed { coord, kind, message } => {
                    self.record(
                        DiagnosticEvent::new(category_for(kind))
                            .with_chunk(coord.to_array())
                            .with_message(message),
                    );
                    // Try again next tick rather than leave a hole
                    match self.store.get(coord) {
                        Some(chunk) if chunk.generated => self.scheduler.request_mesh(coord),
                        Some(_) => self.scheduler.request_generation(coord),
                        None => {}
                    }
                }
            }
        }

        let edited = self.edits.poll(&mut self.store, &mut self.scheduler, &mut self.resources);
        stats.edited = edited.len();
        for coord in edited {
            self.record(
                DiagnosticEvent::new(EventCategory::Edit)
                    .with_chunk(coord.to_array())
                    .with_message("backend edit applied"),
            );
        }
    }

    fn refresh_seams(&mut self) {
        let scheduler = &self.scheduler;
        let changes = self.lod.refresh_transitions(&mut self.store, |coord| scheduler.is_busy(coord));
        for change in changes {
            match change {
                TransitionChange::Built(transition) => {
                    self.record(
                        DiagnosticEvent::new(EventCategory::Transition)
                            .with_chunk(transition.key.fine.to_array())
                            .with_lod(transition.fine_lod)
                            .with_count("triangles", transition.mesh.triangle_count() as u64)
                            .with_count("coarse_lod", transition.coarse_lod as u64),
                    );
                    self.events.push(TerrainEvent::TransitionReady {
                        key: transition.key,
                        mesh: transition.mesh,
                    });
                }
                TransitionChange::Removed(key) => {
                    self.record(
                        DiagnosticEvent::new(EventCategory::Transition)
                            .with_chunk(key.fine.to_array())
                            .with_message("removed"),
                    );
                    self.events.push(TerrainEvent::TransitionRemoved { key });
                }
            }
        }
    }

    /// Deform the terrain with a spherical brush
    ///
    /// The only way to mutate density. Positive strength adds material,
    /// negative strength carves it away.
    pub fn request_terrain_modification(&mut self, point: Vec3, radius: f32, strength: f32) -> EditOutcome {
        if self.shut_down {
            return EditOutcome::default();
        }
        let op = EditOp::new(point, radius, strength);
        let outcome = self.edits.modify(op, &mut self.store, &mut self.scheduler, &mut self.resources);
        if op.is_valid() {
            self.record(
                DiagnosticEvent::new(EventCategory::Edit)
                    .with_count("visited", outcome.visited as u64)
                    .with_count("applied", outcome.applied.len() as u64)
                    .with_count("dispatched", outcome.dispatched.len() as u64)
                    .with_count("deferred", outcome.deferred.len() as u64)
                    .with_message(format!("r={radius} s={strength} at {point}")),
            );
        }
        outcome
    }

    /// Force a resident chunk to be remeshed
    ///
    /// Returns false if the chunk is not resident.
    pub fn queue_chunk_for_update(&mut self, coord: ChunkCoord) -> bool {
        if !self.store.contains(coord) {
            return false;
        }
        self.scheduler.request_mesh(coord);
        true
    }

    pub fn drain_events(&mut self) -> Vec<TerrainEvent> {
        std::mem::take(&mut self.events)
    }

    /// Switch to a new configuration at runtime
    ///
    /// Outstanding work is cancelled and every resident chunk regenerates
    /// from the new field with its journaled edits. A changed chunk layout
    /// unloads everything instead. An invalid config is rejected and the
    /// current one stays in effect.
    pub fn apply_config(&mut self, config: TerrainConfig) -> Result<()> {
        if let Err(err) = config.validate() {
            log::warn!("Ignoring terrain config update: {}", err);
            return Err(err);
        }

        self.scheduler.shutdown(&mut self.store, &mut self.resources);
        self.edits.shutdown(&mut self.resources);

        self.field = Arc::new(DensityField::from_config(&config));
        self.scheduler.set_field(self.field.clone());
        self.scheduler.set_budget(AdaptiveBudget::new(config.budget.clone()));
        self.scheduler.set_meshing(MeshingSettings::from_config(&config));
        self.resources.set_mode(config.processing_mode);
        self.edits.set_max_retries(config.max_edit_retries);
        self.lod = LodPolicy::from_config(&config);

        let layout_changed =
            config.chunk_size != self.config.chunk_size || config.base_voxel_size != self.config.base_voxel_size;
        let resident = self.store.coords();
        if layout_changed {
            for coord in &resident {
                self.unload(*coord);
            }
            self.store = ChunkStore::new(config.chunk_extent());
        } else {
            for coord in &resident {
                self.scheduler.request_generation(*coord);
            }
        }
        self.config = config;

        log::info!(
            "Terrain config applied: {} chunks {}",
            resident.len(),
            if layout_changed { "unloaded" } else { "regenerating" }
        );
        self.record(
            DiagnosticEvent::new(EventCategory::Lifecycle)
                .with_count("chunks", resident.len() as u64)
                .with_message("config applied"),
        );
        Ok(())
    }

    /// Wait for all outstanding work and return its buffers
    ///
    /// Called by `Drop`; ticking afterwards does nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.scheduler.shutdown(&mut self.store, &mut self.resources);
        self.edits.shutdown(&mut self.resources);
        self.diagnostics.flush();

        let buffers = self.resources.buffers.stats();
        log::info!(
            "Terrain system stopped: {} chunks resident, {} buffers outstanding",
            self.store.len(),
            buffers.outstanding
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    pub fn field(&self) -> &DensityField {
        &self.field
    }

    pub fn lod_policy(&self) -> &LodPolicy {
        &self.lod
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn scheduler(&self) -> &GenerationScheduler {
        &self.scheduler
    }

    pub fn journal(&self) -> &EditJournal {
        self.edits.journal()
    }

    pub fn resources(&self) -> &ComputeResources {
        &self.resources
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.resources.buffers.stats()
    }

    fn record(&mut self, event: DiagnosticEvent) {
        self.diagnostics.record(event);
    }
}

impl Drop for TerrainSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn category_for(kind: WorkKind) -> EventCategory {
    match kind {
        WorkKind::Density => EventCategory::Generation,
        WorkKind::Meshing => EventCategory::Meshing,
        WorkKind::Edit => EventCategory::Edit,
    }
}
