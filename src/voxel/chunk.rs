//! Chunk coordinates and the per-chunk density/mesh state

use std::collections::HashMap;
use std::sync::Arc;

use glam::{IVec3, UVec3, Vec3};

use crate::math::Aabb;
use crate::mesh::surface::SurfaceMesh;
use crate::mesh::transition::{TransitionKey, TransitionMesh};
use crate::voxel::grid::DensityGrid;

/// Integer coordinate identifying a chunk in the world grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Convert world position to chunk coordinate
    pub fn from_world_pos(pos: Vec3, chunk_size: Vec3) -> Self {
        let c = (pos / chunk_size).floor();
        Self::new(c.x as i32, c.y as i32, c.z as i32)
    }

    /// Get the world-space origin (minimum corner) of this chunk
    pub fn world_origin(&self, chunk_size: Vec3) -> Vec3 {
        self.as_ivec3().as_vec3() * chunk_size
    }

    pub fn world_center(&self, chunk_size: Vec3) -> Vec3 {
        self.world_origin(chunk_size) + chunk_size * 0.5
    }

    pub fn world_bounds(&self, chunk_size: Vec3) -> Aabb {
        let origin = self.world_origin(chunk_size);
        Aabb::new(origin, origin + chunk_size)
    }

    /// Face-adjacent neighbour
    pub fn offset(&self, face: Face) -> Self {
        let o = face.offset();
        Self::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }

    pub fn neighbors(&self) -> [ChunkCoord; 6] {
        Face::ALL.map(|face| self.offset(face))
    }

    /// Face of `self` shared with `other`, if they are face-adjacent
    pub fn face_towards(&self, other: ChunkCoord) -> Option<Face> {
        Face::ALL.into_iter().find(|face| self.offset(*face) == other)
    }

    pub fn as_ivec3(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    pub fn to_array(&self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// The six axis-aligned chunk faces
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Face {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl Face {
    pub const ALL: [Face; 6] = [Face::PosX, Face::NegX, Face::PosY, Face::NegY, Face::PosZ, Face::NegZ];

    pub fn offset(self) -> IVec3 {
        match self {
            Face::PosX => IVec3::X,
            Face::NegX => IVec3::NEG_X,
            Face::PosY => IVec3::Y,
            Face::NegY => IVec3::NEG_Y,
            Face::PosZ => IVec3::Z,
            Face::NegZ => IVec3::NEG_Z,
        }
    }

    /// 0 = x, 1 = y, 2 = z
    pub fn axis(self) -> usize {
        match self {
            Face::PosX | Face::NegX => 0,
            Face::PosY | Face::NegY => 1,
            Face::PosZ | Face::NegZ => 2,
        }
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Face::PosX | Face::PosY | Face::PosZ)
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::PosX => Face::NegX,
            Face::NegX => Face::PosX,
            Face::PosY => Face::NegY,
            Face::NegY => Face::PosY,
            Face::PosZ => Face::NegZ,
            Face::NegZ => Face::PosZ,
        }
    }
}

/// Opaque id of a published mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(pub u64);

/// Render surface of a settled chunk, optionally reused for collision
#[derive(Clone, Debug)]
pub struct ChunkMesh {
    pub handle: MeshHandle,
    pub surface: Arc<SurfaceMesh>,
    /// Same allocation as `surface` when collision meshes are enabled
    pub collision: Option<Arc<SurfaceMesh>>,
    /// Density version the surface was extracted from
    pub density_version: u64,
}

/// One cubical region of terrain at one LOD
///
/// Owned exclusively by the chunk store. Pooled: a released chunk keeps its
/// grid allocation and is reinitialized by [`Chunk::on_acquire`].
#[derive(Debug)]
pub struct Chunk {
    pub coord: ChunkCoord,
    pub lod: u32,
    /// World position of sample (0, 0, 0)
    pub origin: Vec3,
    pub voxel_size: f32,
    pub grid: DensityGrid,
    /// Needs (re)meshing
    pub dirty: bool,
    /// Grid holds generated density
    pub generated: bool,
    density_version: u64,
    pub mesh: Option<ChunkMesh>,
    /// Bumped every time a new mesh is published
    pub mesh_version: u64,
    /// A non-finite density was sanitized in this grid
    pub anomalous: bool,
    /// Edited since generation
    pub modified: bool,
    /// Seams owned by this chunk, keyed by the coarser neighbour
    pub transitions: HashMap<ChunkCoord, TransitionMesh>,
}

impl Chunk {
    /// Create a new empty chunk at the given coordinate
    pub fn new(coord: ChunkCoord, lod: u32, dims: UVec3, voxel_size: f32, origin: Vec3) -> Self {
        Self {
            coord,
            lod,
            origin,
            voxel_size,
            grid: DensityGrid::new(dims),
            dirty: true,
            generated: false,
            density_version: 0,
            mesh: None,
            mesh_version: 0,
            anomalous: false,
            modified: false,
            transitions: HashMap::new(),
        }
    }

    /// Reinitialize a pooled chunk for a new coordinate and LOD
    pub fn on_acquire(&mut self, coord: ChunkCoord, lod: u32, dims: UVec3, voxel_size: f32, origin: Vec3) {
        self.coord = coord;
        self.lod = lod;
        self.origin = origin;
        self.voxel_size = voxel_size;
        self.grid.reset(dims);
        self.dirty = true;
        self.generated = false;
        self.anomalous = false;
        self.modified = false;
        // The version keeps counting across reuse so stale results never match
        self.density_version += 1;
    }

    /// Drop per-coordinate state before the chunk goes back to the pool
    pub fn on_release(&mut self) {
        self.mesh = None;
        self.transitions.clear();
        self.dirty = false;
        self.generated = false;
    }

    pub fn density_version(&self) -> u64 {
        self.density_version
    }

    /// Record an accepted density mutation
    pub fn bump_density_version(&mut self) -> u64 {
        self.density_version += 1;
        self.density_version
    }

    pub fn dims(&self) -> UVec3 {
        self.grid.dims()
    }

    /// World position of a sample coordinate
    pub fn sample_position(&self, sample: IVec3) -> Vec3 {
        self.origin + sample.as_vec3() * self.voxel_size
    }

    /// World bounds of the core samples
    pub fn world_bounds(&self) -> Aabb {
        let extent = self.dims().as_vec3() * self.voxel_size;
        Aabb::new(self.origin, self.origin + extent)
    }

    /// World bounds including the halo samples
    pub fn padded_bounds(&self) -> Aabb {
        self.world_bounds().inflated(self.voxel_size)
    }

    pub fn transition_keys(&self) -> impl Iterator<Item = TransitionKey> + '_ {
        self.transitions.keys().map(|coarse| TransitionKey { fine: self.coord, coarse: *coarse })
    }
}
