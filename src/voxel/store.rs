//! Resident chunks keyed by coordinate

use std::collections::{HashMap, HashSet};

use glam::{UVec3, Vec3};

use super::chunk::{Chunk, ChunkCoord};
use super::pool::{ChunkPool, PoolStats};
use crate::mesh::transition::TransitionKey;

/// What was torn down when a chunk left the store
#[derive(Clone, Debug, PartialEq)]
pub struct ReleasedChunk {
    pub coord: ChunkCoord,
    pub lod: u32,
    /// The chunk had a published mesh
    pub had_mesh: bool,
    /// Seams removed with it, its own and its neighbours'
    pub transitions: Vec<TransitionKey>,
}

/// Map from chunk coordinate to chunk, backed by a reuse pool
pub struct ChunkStore {
    chunks: HashMap<ChunkCoord, Chunk>,
    pool: ChunkPool,
    chunk_size: Vec3,
}

impl ChunkStore {
    pub fn new(chunk_size: Vec3) -> Self {
        Self::with_pool(chunk_size, ChunkPool::default())
    }

    pub fn with_pool(chunk_size: Vec3, pool: ChunkPool) -> Self {
        Self {
            chunks: HashMap::new(),
            pool,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> Vec3 {
        self.chunk_size
    }

    /// Make `coord` resident at `lod`, reusing a pooled chunk when possible
    ///
    /// A chunk already resident at `coord` is released first and returned
    /// with the new one, so there is never more than one chunk per coordinate
    /// and the caller still learns which mesh and seams went away.
    pub fn acquire(
        &mut self,
        coord: ChunkCoord,
        lod: u32,
        dims: UVec3,
        voxel_size: f32,
    ) -> (&mut Chunk, Option<ReleasedChunk>) {
        let replaced = self.release(coord);
        if replaced.is_some() {
            log::debug!("Chunk {} replaced while resident", coord);
        }
        let origin = coord.world_origin(self.chunk_size);
        let chunk = self.pool.acquire(coord, lod, dims, voxel_size, origin);
        log::debug!("Acquired chunk {} at LOD {} ({} cells)", coord, lod, dims);
        (self.chunks.entry(coord).or_insert(chunk), replaced)
    }

    /// Detach a chunk, tear down every seam touching it and pool it
    pub fn release(&mut self, coord: ChunkCoord) -> Option<ReleasedChunk> {
        let chunk = self.chunks.remove(&coord)?;

        let mut transitions: Vec<TransitionKey> = chunk.transition_keys().collect();
        for neighbor in coord.neighbors() {
            if let Some(other) = self.chunks.get_mut(&neighbor) {
                if other.transitions.remove(&coord).is_some() {
                    transitions.push(TransitionKey { fine: neighbor, coarse: coord });
                }
            }
        }

        let released = ReleasedChunk {
            coord,
            lod: chunk.lod,
            had_mesh: chunk.mesh.is_some(),
            transitions,
        };
        self.pool.release(chunk);
        log::debug!("Released chunk {}", coord);
        Some(released)
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord)
    }

    pub fn get_mut(&mut self, coord: ChunkCoord) -> Option<&mut Chunk> {
        self.chunks.get_mut(&coord)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks.values_mut()
    }

    /// Resident coordinates in a stable order
    pub fn coords(&self) -> Vec<ChunkCoord> {
        let mut coords: Vec<ChunkCoord> = self.chunks.keys().copied().collect();
        coords.sort();
        coords
    }

    /// Coordinates within a horizontal disc and vertical band around `viewer`
    pub fn get_visible(radius: i32, vertical_radius: i32, viewer: ChunkCoord) -> HashSet<ChunkCoord> {
        let mut visible = HashSet::new();
        let r2 = radius * radius;
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dz * dz > r2 {
                    continue;
                }
                for dy in -vertical_radius..=vertical_radius {
                    visible.insert(ChunkCoord::new(viewer.x + dx, viewer.y + dy, viewer.z + dz));
                }
            }
        }
        visible
    }

    /// Resident coordinates outside the disc and band, in a stable order
    pub fn coords_beyond(&self, radius: i32, vertical_radius: i32, viewer: ChunkCoord) -> Vec<ChunkCoord> {
        let r2 = radius as i64 * radius as i64;
        let mut beyond: Vec<ChunkCoord> = self
            .chunks
            .keys()
            .filter(|c| {
                let dx = (c.x - viewer.x) as i64;
                let dz = (c.z - viewer.z) as i64;
                dx * dx + dz * dz > r2 || (c.y - viewer.y).abs() > vertical_radius
            })
            .copied()
            .collect();
        beyond.sort();
        beyond
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::mesh::surface::SurfaceMesh;
    use crate::mesh::transition::TransitionMesh;
    use crate::voxel::chunk::{ChunkMesh, MeshHandle};

    fn store() -> ChunkStore {
        ChunkStore::new(Vec3::splat(32.0))
    }

    #[test]
    fn test_one_chunk_per_coordinate() {
        let mut store = store();
        let coord = ChunkCoord::new(1, 0, -1);
        let (_, replaced) = store.acquire(coord, 0, UVec3::splat(8), 4.0);
        assert!(replaced.is_none());
        let (chunk, _) = store.acquire(coord, 1, UVec3::splat(4), 8.0);
        assert_eq!(chunk.lod, 1);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(coord).unwrap().lod, 1);
        assert_eq!(store.get(coord).unwrap().origin, Vec3::new(32.0, 0.0, -32.0));
    }

    #[test]
    fn test_replacing_a_chunk_reports_what_it_lost() {
        let mut store = store();
        let fine = ChunkCoord::new(0, 0, 0);
        let coarse = ChunkCoord::new(1, 0, 0);
        store.acquire(fine, 0, UVec3::splat(8), 4.0);
        let (chunk, _) = store.acquire(coarse, 1, UVec3::splat(4), 8.0);
        chunk.mesh = Some(ChunkMesh {
            handle: MeshHandle(1),
            surface: Arc::new(SurfaceMesh::new()),
            collision: None,
            density_version: 0,
        });
        store
            .get_mut(fine)
            .unwrap()
            .transitions
            .insert(coarse, TransitionMesh::empty(TransitionKey { fine, coarse }));

        let (chunk, replaced) = store.acquire(coarse, 0, UVec3::splat(8), 4.0);
        assert!(chunk.mesh.is_none());
        let replaced = replaced.expect("coarse chunk was resident");
        assert_eq!(replaced.lod, 1);
        assert!(replaced.had_mesh);
        assert_eq!(replaced.transitions, vec![TransitionKey { fine, coarse }]);
        assert!(store.get(fine).unwrap().transitions.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_released_coordinate_reacquirable() {
        let mut store = store();
        let coord = ChunkCoord::new(0, 0, 0);
        store.acquire(coord, 0, UVec3::splat(8), 4.0);

        let released = store.release(coord).unwrap();
        assert_eq!(released.coord, coord);
        assert!(!store.contains(coord));
        assert!(store.release(coord).is_none());

        store.acquire(coord, 0, UVec3::splat(8), 4.0);
        assert!(store.contains(coord));
        assert_eq!(store.pool_stats().reused, 1);
    }

    #[test]
    fn test_release_tears_down_neighbour_seams() {
        let mut store = store();
        let fine = ChunkCoord::new(0, 0, 0);
        let coarse = ChunkCoord::new(1, 0, 0);
        store.acquire(fine, 0, UVec3::splat(8), 4.0);
        store.acquire(coarse, 1, UVec3::splat(4), 8.0);
        store
            .get_mut(fine)
            .unwrap()
            .transitions
            .insert(coarse, TransitionMesh::empty(TransitionKey { fine, coarse }));

        let released = store.release(coarse).unwrap();
        assert_eq!(released.transitions, vec![TransitionKey { fine, coarse }]);
        assert!(store.get(fine).unwrap().transitions.is_empty());
    }

    #[test]
    fn test_visible_disc_and_band() {
        let viewer = ChunkCoord::new(10, 0, 10);
        let visible = ChunkStore::get_visible(2, 1, viewer);

        assert!(visible.contains(&ChunkCoord::new(12, 0, 10)));
        assert!(visible.contains(&ChunkCoord::new(11, -1, 11)));
        assert!(!visible.contains(&ChunkCoord::new(12, 0, 12)));
        assert!(!visible.contains(&ChunkCoord::new(10, 2, 10)));
        // 13 columns in a radius-2 disc, 3 layers
        assert_eq!(visible.len(), 13 * 3);
    }

    #[test]
    fn test_coords_beyond() {
        let mut store = store();
        for x in 0..5 {
            store.acquire(ChunkCoord::new(x, 0, 0), 0, UVec3::splat(2), 16.0);
        }
        store.acquire(ChunkCoord::new(0, 3, 0), 0, UVec3::splat(2), 16.0);

        let beyond = store.coords_beyond(2, 1, ChunkCoord::new(0, 0, 0));
        assert_eq!(
            beyond,
            vec![ChunkCoord::new(0, 3, 0), ChunkCoord::new(3, 0, 0), ChunkCoord::new(4, 0, 0)]
        );
    }
}
