//! Deepfield - deformable volumetric terrain
//!
//! A procedural density field is sampled into chunks, triangulated with
//! marching cubes, stitched across LOD boundaries and edited at runtime.
//! [`world::TerrainSystem`] ties the pieces together behind a per-frame
//! `tick`.

pub mod core;
pub mod math;
pub mod config;
pub mod terrain;
pub mod voxel;
pub mod mesh;
pub mod streaming;
pub mod edit;
pub mod world;
