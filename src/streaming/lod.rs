//! Level of Detail (LOD) selection and seam upkeep
//!
//! Each level doubles the voxel size and halves the cells per axis, so a
//! chunk covers the same world extent at every LOD. The level comes from the
//! distance between the viewer and the chunk centre:
//! - LOD 0: closer than the first threshold
//! - LOD n: past n thresholds, capped at `max_level`
//!
//! Wherever two face neighbours end up at different levels, the finer one
//! owns a skirt hiding the crack between them.

use std::sync::Arc;

use glam::{UVec3, Vec3};

use crate::config::TerrainConfig;
use crate::mesh::surface::SurfaceMesh;
use crate::mesh::transition::{build_skirt, TransitionKey, TransitionMesh};
use crate::voxel::chunk::{ChunkCoord, Face};
use crate::voxel::store::ChunkStore;

/// Relative slack allowed when checking that voxels tile a chunk
const TILING_TOLERANCE: f32 = 1e-4;

/// Cells per axis when voxels of `voxel_size` tile `chunk_size` exactly
///
/// `None` when any axis would need a fractional cell or less than one cell,
/// since the chunk would then cover a different extent than its neighbours.
pub fn exact_cells(chunk_size: Vec3, voxel_size: f32) -> Option<UVec3> {
    let cells = chunk_size / voxel_size;
    let rounded = cells.round();
    let slack = Vec3::splat(TILING_TOLERANCE) * rounded.max(Vec3::ONE);
    let whole = (cells - rounded).abs().cmple(slack).all();
    (whole && rounded.cmpge(Vec3::ONE).all()).then(|| rounded.as_uvec3())
}

/// Deepest level up to `limit` whose voxels still tile the chunk exactly
pub fn deepest_exact_level(chunk_size: Vec3, base_voxel_size: f32, limit: u32) -> u32 {
    (0..=limit.min(62))
        .take_while(|lod| exact_cells(chunk_size, base_voxel_size * (1u64 << lod) as f32).is_some())
        .last()
        .unwrap_or(0)
}

/// Outcome of a seam refresh, in application order
#[derive(Clone, Debug)]
pub enum TransitionChange {
    Built(TransitionMesh),
    Removed(TransitionKey),
}

/// Distance-based LOD table
#[derive(Clone, Debug, PartialEq)]
pub struct LodPolicy {
    thresholds: Vec<f32>,
    max_level: u32,
    base_voxel_size: f32,
    chunk_size: Vec3,
    seam_stitching: bool,
}

impl LodPolicy {
    pub fn new(
        mut thresholds: Vec<f32>,
        max_level: u32,
        base_voxel_size: f32,
        chunk_size: Vec3,
        seam_stitching: bool,
    ) -> Self {
        thresholds.sort_by(f32::total_cmp);
        let exact = deepest_exact_level(chunk_size, base_voxel_size, max_level);
        if exact < max_level {
            log::warn!(
                "LOD {} does not tile a {:?} chunk with {} unit voxels, capping at LOD {}",
                max_level,
                chunk_size,
                base_voxel_size,
                exact
            );
        }
        let max_level = exact;
        Self {
            thresholds,
            max_level,
            base_voxel_size,
            chunk_size,
            seam_stitching,
        }
    }

    pub fn from_config(config: &TerrainConfig) -> Self {
        Self::new(
            config.lod.thresholds.clone(),
            config.lod.max_level,
            config.base_voxel_size,
            config.chunk_extent(),
            config.lod.seam_stitching,
        )
    }

    /// Calculate LOD level from distance
    ///
    /// # Examples
    /// ```
    /// use deepfield::streaming::lod::LodPolicy;
    /// use glam::Vec3;
    ///
    /// let policy = LodPolicy::new(vec![64.0, 128.0, 256.0], 3, 1.0, Vec3::splat(32.0), true);
    /// assert_eq!(policy.level_for(32.0), 0);
    /// assert_eq!(policy.level_for(64.0), 1);
    /// assert_eq!(policy.level_for(200.0), 2);
    /// assert_eq!(policy.level_for(5000.0), 3);
    /// ```
    pub fn level_for(&self, distance: f32) -> u32 {
        let passed = self.thresholds.iter().take_while(|t| **t <= distance).count() as u32;
        passed.min(self.max_level)
    }

    /// Level for a chunk, measured to its centre
    pub fn level_for_chunk(&self, coord: ChunkCoord, viewer: Vec3) -> u32 {
        self.level_for(viewer.distance(coord.world_center(self.chunk_size)))
    }

    /// Voxel size at a level: base * 2^lod, with lod capped at `max_level`
    pub fn voxel_size(&self, lod: u32) -> f32 {
        self.base_voxel_size * (1u64 << lod.min(self.max_level)) as f32
    }

    /// Cells per axis at a level; `dimensions * voxel_size` is the chunk size
    pub fn dimensions(&self, lod: u32) -> UVec3 {
        (self.chunk_size / self.voxel_size(lod)).round().max(Vec3::ONE).as_uvec3()
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn chunk_size(&self) -> Vec3 {
        self.chunk_size
    }

    pub fn seam_stitching(&self) -> bool {
        self.seam_stitching
    }

    /// Bring every seam in the store up to date
    ///
    /// A seam exists for each face-adjacent pair where the neighbour is
    /// coarser and both sides have a published mesh. Pairs with a busy side
    /// are left exactly as they are until the work lands.
    pub fn refresh_transitions(
        &self,
        store: &mut ChunkStore,
        is_busy: impl Fn(ChunkCoord) -> bool,
    ) -> Vec<TransitionChange> {
        struct Plan {
            key: TransitionKey,
            face: Face,
            surface: Arc<SurfaceMesh>,
            depth: f32,
            fine_lod: u32,
            coarse_lod: u32,
            fine_version: u64,
            coarse_version: u64,
        }

        let mut builds = Vec::new();
        let mut removals = Vec::new();

        for coord in store.coords() {
            let Some(chunk) = store.get(coord) else { continue };
            let busy = is_busy(coord);
            let mut wanted = Vec::new();

            for face in Face::ALL {
                let neighbor = coord.offset(face);
                let Some(other) = store.get(neighbor) else { continue };
                if !self.seam_stitching || other.lod <= chunk.lod {
                    continue;
                }
                let (Some(fine_mesh), Some(_)) = (&chunk.mesh, &other.mesh) else { continue };
                wanted.push(neighbor);

                if busy || is_busy(neighbor) {
                    continue;
                }
                let current = chunk.transitions.get(&neighbor).is_some_and(|t| {
                    t.is_current(chunk.lod, other.lod, chunk.mesh_version, other.mesh_version)
                });
                if !current {
                    builds.push(Plan {
                        key: TransitionKey { fine: coord, coarse: neighbor },
                        face,
                        surface: fine_mesh.surface.clone(),
                        depth: other.voxel_size,
                        fine_lod: chunk.lod,
                        coarse_lod: other.lod,
                        fine_version: chunk.mesh_version,
                        coarse_version: other.mesh_version,
                    });
                }
            }

            let mut stale: Vec<ChunkCoord> =
                chunk.transitions.keys().filter(|c| !wanted.contains(c)).copied().collect();
            stale.sort();
            removals.extend(stale.into_iter().map(|coarse| TransitionKey { fine: coord, coarse }));
        }

        let mut changes = Vec::with_capacity(removals.len() + builds.len());
        for key in removals {
            if let Some(chunk) = store.get_mut(key.fine) {
                chunk.transitions.remove(&key.coarse);
            }
            log::trace!("Removed seam {} -> {}", key.fine, key.coarse);
            changes.push(TransitionChange::Removed(key));
        }

        for plan in builds {
            let skirt = build_skirt(&plan.surface, plan.face, self.chunk_size, plan.depth);
            let transition = TransitionMesh {
                key: plan.key,
                mesh: Arc::new(skirt),
                fine_lod: plan.fine_lod,
                coarse_lod: plan.coarse_lod,
                fine_mesh_version: plan.fine_version,
                coarse_mesh_version: plan.coarse_version,
            };
            if let Some(chunk) = store.get_mut(plan.key.fine) {
                log::trace!(
                    "Built seam {} -> {} ({} triangles)",
                    plan.key.fine,
                    plan.key.coarse,
                    transition.mesh.triangle_count()
                );
                chunk.transitions.insert(plan.key.coarse, transition.clone());
                changes.push(TransitionChange::Built(transition));
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerrainConfig;
    use crate::mesh::marching_cubes::{mesh_grid, ExtractLimits};
    use crate::terrain::density::DensityField;
    use crate::voxel::chunk::{ChunkMesh, MeshHandle};

    fn policy(chunk: f32, stitching: bool) -> LodPolicy {
        LodPolicy::new(vec![256.0, 64.0, 128.0], 3, 1.0, Vec3::splat(chunk), stitching)
    }

    fn load_meshed(store: &mut ChunkStore, policy: &LodPolicy, field: &DensityField, coord: ChunkCoord, lod: u32) {
        let voxel = policy.voxel_size(lod);
        let (chunk, _) = store.acquire(coord, lod, policy.dimensions(lod), voxel);
        let origin = chunk.origin;
        chunk.grid.fill(field, origin, voxel);
        let surface = Arc::new(mesh_grid(&chunk.grid, 0.0, voxel, ExtractLimits::default()));
        chunk.mesh_version += 1;
        chunk.mesh = Some(ChunkMesh {
            handle: MeshHandle(chunk.mesh_version),
            surface,
            collision: None,
            density_version: chunk.density_version(),
        });
    }

    #[test]
    fn test_level_for_sorted_thresholds() {
        let policy = policy(32.0, true);
        assert_eq!(policy.level_for(0.0), 0);
        assert_eq!(policy.level_for(63.9), 0);
        assert_eq!(policy.level_for(64.0), 1);
        assert_eq!(policy.level_for(130.0), 2);
        assert_eq!(policy.level_for(1e9), 3);

        let capped = LodPolicy::new(vec![10.0, 20.0, 30.0], 1, 1.0, Vec3::splat(32.0), true);
        assert_eq!(capped.level_for(100.0), 1);
    }

    #[test]
    fn test_constant_extent_across_levels() {
        let policy = policy(32.0, true);
        for lod in 0..=policy.max_level() {
            let extent = policy.dimensions(lod).as_vec3() * policy.voxel_size(lod);
            assert_eq!(extent, Vec3::splat(32.0), "lod {}", lod);
        }
        assert_eq!(policy.dimensions(0), UVec3::splat(32));
        assert_eq!(policy.dimensions(2), UVec3::splat(8));
        assert_eq!(policy.voxel_size(2), 4.0);
    }

    #[test]
    fn test_max_level_capped_to_exact_tiling() {
        // 48 = 3 * 16, so 32 unit voxels no longer fit
        let policy = LodPolicy::new(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0], 6, 1.0, Vec3::splat(48.0), true);
        assert_eq!(policy.max_level(), 4);
        assert_eq!(policy.level_for(1e9), 4);
        for lod in 0..=6 {
            let extent = policy.dimensions(lod).as_vec3() * policy.voxel_size(lod);
            assert_eq!(extent, Vec3::splat(48.0), "lod {}", lod);
        }

        assert_eq!(exact_cells(Vec3::new(48.0, 16.0, 48.0), 16.0), Some(UVec3::new(3, 1, 3)));
        assert_eq!(exact_cells(Vec3::splat(48.0), 32.0), None);
        assert_eq!(exact_cells(Vec3::splat(8.0), 16.0), None);
        assert_eq!(deepest_exact_level(Vec3::splat(0.75), 1.0, 3), 0);
    }

    #[test]
    fn test_level_for_chunk_uses_centre() {
        let policy = policy(32.0, true);
        // Centre of (2, 0, 0) is 80 units away along x
        assert_eq!(policy.level_for_chunk(ChunkCoord::new(2, 0, 0), Vec3::new(0.0, 16.0, 16.0)), 1);
        assert_eq!(policy.level_for_chunk(ChunkCoord::new(0, 0, 0), Vec3::splat(16.0)), 0);
    }

    #[test]
    fn test_seam_between_fine_and_coarse() {
        let policy = policy(8.0, true);
        let field = DensityField::from_config(&TerrainConfig::flat(4.5));
        let mut store = ChunkStore::new(Vec3::splat(8.0));
        let fine = ChunkCoord::new(0, 0, 0);
        let coarse = ChunkCoord::new(1, 0, 0);
        load_meshed(&mut store, &policy, &field, fine, 0);
        load_meshed(&mut store, &policy, &field, coarse, 1);

        let changes = policy.refresh_transitions(&mut store, |_| false);
        assert_eq!(changes.len(), 1);
        let TransitionChange::Built(seam) = &changes[0] else { panic!("expected a build") };
        assert_eq!(seam.key, TransitionKey { fine, coarse });
        assert!(!seam.mesh.is_empty());
        assert!(seam.mesh.vertices.iter().all(|v| (v.x - 8.0).abs() < 1e-4));
        assert!(store.get(fine).unwrap().transitions.contains_key(&coarse));

        // Nothing changed, nothing to do
        assert!(policy.refresh_transitions(&mut store, |_| false).is_empty());
    }

    #[test]
    fn test_seam_waits_for_busy_side() {
        let policy = policy(8.0, true);
        let field = DensityField::from_config(&TerrainConfig::flat(4.5));
        let mut store = ChunkStore::new(Vec3::splat(8.0));
        let fine = ChunkCoord::new(0, 0, 0);
        let coarse = ChunkCoord::new(0, 0, 1);
        load_meshed(&mut store, &policy, &field, fine, 0);
        load_meshed(&mut store, &policy, &field, coarse, 2);

        assert!(policy.refresh_transitions(&mut store, |c| c == coarse).is_empty());
        assert!(store.get(fine).unwrap().transitions.is_empty());

        let changes = policy.refresh_transitions(&mut store, |_| false);
        assert!(matches!(changes.as_slice(), [TransitionChange::Built(_)]));

        // A new coarse mesh makes the seam stale
        store.get_mut(coarse).unwrap().mesh_version += 1;
        let changes = policy.refresh_transitions(&mut store, |_| false);
        let [TransitionChange::Built(seam)] = changes.as_slice() else { panic!("expected a rebuild") };
        assert_eq!(seam.coarse_mesh_version, 2);
    }

    #[test]
    fn test_seam_removed_when_levels_match() {
        let policy = policy(8.0, true);
        let field = DensityField::from_config(&TerrainConfig::flat(4.5));
        let mut store = ChunkStore::new(Vec3::splat(8.0));
        let fine = ChunkCoord::new(0, 0, 0);
        let coarse = ChunkCoord::new(1, 0, 0);
        load_meshed(&mut store, &policy, &field, fine, 0);
        load_meshed(&mut store, &policy, &field, coarse, 1);
        policy.refresh_transitions(&mut store, |_| false);

        load_meshed(&mut store, &policy, &field, coarse, 0);
        let changes = policy.refresh_transitions(&mut store, |_| false);
        // Recreating the neighbour already tore the seam down with it
        assert!(changes.is_empty());
        assert!(store.get(fine).unwrap().transitions.is_empty());

        load_meshed(&mut store, &policy, &field, coarse, 1);
        policy.refresh_transitions(&mut store, |_| false);
        store.get_mut(coarse).unwrap().lod = 0;
        let changes = policy.refresh_transitions(&mut store, |_| false);
        let [TransitionChange::Removed(key)] = changes.as_slice() else { panic!("expected a removal") };
        assert_eq!(*key, TransitionKey { fine, coarse });
    }

    #[test]
    fn test_stitching_disabled_tears_down() {
        let field = DensityField::from_config(&TerrainConfig::flat(4.5));
        let mut store = ChunkStore::new(Vec3::splat(8.0));
        let on = policy(8.0, true);
        load_meshed(&mut store, &on, &field, ChunkCoord::new(0, 0, 0), 0);
        load_meshed(&mut store, &on, &field, ChunkCoord::new(-1, 0, 0), 1);
        assert_eq!(on.refresh_transitions(&mut store, |_| false).len(), 1);

        let off = policy(8.0, false);
        let changes = off.refresh_transitions(&mut store, |_| false);
        assert!(matches!(changes.as_slice(), [TransitionChange::Removed(_)]));
    }
}
