//! Reuse pool for chunk objects and their grid allocations

use glam::{UVec3, Vec3};

use super::chunk::{Chunk, ChunkCoord};
use super::grid::DensityGrid;

/// Default number of idle chunks kept around
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Pool usage counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks allocated from scratch
    pub created: u64,
    /// Acquisitions served from the pool
    pub reused: u64,
    /// Chunks returned to the pool
    pub released: u64,
    /// Chunks dropped because the pool was full
    pub discarded: u64,
}

/// Idle chunks waiting to be reacquired
pub struct ChunkPool {
    free: Vec<Chunk>,
    capacity: usize,
    stats: PoolStats,
}

impl ChunkPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
            stats: PoolStats::default(),
        }
    }

    /// Take a chunk for `coord`, preferring one whose grid already fits `dims`
    pub fn acquire(&mut self, coord: ChunkCoord, lod: u32, dims: UVec3, voxel_size: f32, origin: Vec3) -> Chunk {
        let needed = DensityGrid::sample_count_for(dims);
        let fit = self
            .free
            .iter()
            .position(|c| c.grid.capacity() >= needed)
            .or_else(|| self.free.len().checked_sub(1));

        match fit {
            Some(index) => {
                let mut chunk = self.free.swap_remove(index);
                chunk.on_acquire(coord, lod, dims, voxel_size, origin);
                self.stats.reused += 1;
                chunk
            }
            None => {
                self.stats.created += 1;
                Chunk::new(coord, lod, dims, voxel_size, origin)
            }
        }
    }

    /// Return a chunk; it is reset and kept unless the pool is full
    pub fn release(&mut self, mut chunk: Chunk) {
        chunk.on_release();
        self.stats.released += 1;
        if self.free.len() < self.capacity {
            self.free.push(chunk);
        } else {
            self.stats.discarded += 1;
        }
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_after_release() {
        let mut pool = ChunkPool::new(4);
        let chunk = pool.acquire(ChunkCoord::new(0, 0, 0), 0, UVec3::splat(8), 1.0, Vec3::ZERO);
        assert_eq!(pool.stats().created, 1);

        pool.release(chunk);
        assert_eq!(pool.idle(), 1);

        let chunk = pool.acquire(ChunkCoord::new(5, 0, 0), 0, UVec3::splat(8), 1.0, Vec3::new(160.0, 0.0, 0.0));
        assert_eq!(chunk.coord, ChunkCoord::new(5, 0, 0));
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_prefers_large_enough_grid() {
        let mut pool = ChunkPool::new(4);
        let small = pool.acquire(ChunkCoord::new(0, 0, 0), 2, UVec3::splat(2), 4.0, Vec3::ZERO);
        let large = pool.acquire(ChunkCoord::new(1, 0, 0), 0, UVec3::splat(8), 1.0, Vec3::ZERO);
        let large_capacity = large.grid.capacity();
        pool.release(large);
        pool.release(small);

        let chunk = pool.acquire(ChunkCoord::new(2, 0, 0), 0, UVec3::splat(8), 1.0, Vec3::ZERO);
        assert_eq!(chunk.grid.capacity(), large_capacity);
    }

    #[test]
    fn test_full_pool_discards() {
        let mut pool = ChunkPool::new(1);
        let a = pool.acquire(ChunkCoord::new(0, 0, 0), 0, UVec3::splat(2), 1.0, Vec3::ZERO);
        let b = pool.acquire(ChunkCoord::new(1, 0, 0), 0, UVec3::splat(2), 1.0, Vec3::ZERO);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().discarded, 1);
    }
}
