//! Surface extraction and seam meshes

pub mod tables;
pub mod surface;
pub mod marching_cubes;
pub mod transition;

pub use surface::{MeshVertex, SurfaceMesh};
pub use marching_cubes::{extract, extract_parallel, mesh_grid, ExtractLimits};
pub use transition::{build_skirt, TransitionKey, TransitionMesh};
