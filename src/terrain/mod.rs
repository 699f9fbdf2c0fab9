//! Procedural density field

pub mod noise;
pub mod biome;
pub mod density;

pub use biome::{BiomeProfile, BiomeTable, BlendedBiome};
pub use density::{DensityField, DensitySample};
