//! Terrain system facade driven by the application loop

pub mod builder;
pub mod system;

pub use builder::TerrainSystemBuilder;
pub use system::{TerrainEvent, TerrainSystem, TickStats, Viewer};
