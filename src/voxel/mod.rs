//! Chunk data: density grids, chunks, pooling and the resident store

pub mod grid;
pub mod chunk;
pub mod pool;
pub mod store;

pub use grid::{DensityGrid, DensityStats, GradientGrid};
pub use chunk::{Chunk, ChunkCoord, ChunkMesh, Face, MeshHandle};
pub use pool::{ChunkPool, PoolStats};
pub use store::{ChunkStore, ReleasedChunk};
