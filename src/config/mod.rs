//! Terrain configuration, loaded once at startup from JSON
//!
//! Every field has a default, so an empty object (`{}`) is a valid config.
//! Unknown fields are rejected to catch typos early.

use std::path::Path;

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::core::Error;
use crate::streaming::lod::exact_cells;
use crate::terrain::biome::BiomeProfile;

/// Where density generation, meshing and edits run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Everything on the worker pool
    #[default]
    Cpu,
    /// Density, meshing and edits on the compute backend
    Gpu,
    /// Density and edits on the compute backend, meshing on the worker pool
    Hybrid,
}

impl ProcessingMode {
    pub fn density_on_backend(self) -> bool {
        matches!(self, Self::Gpu | Self::Hybrid)
    }

    pub fn meshing_on_backend(self) -> bool {
        matches!(self, Self::Gpu)
    }

    pub fn edits_on_backend(self) -> bool {
        matches!(self, Self::Gpu | Self::Hybrid)
    }
}

/// Distance-based level of detail
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LodSettings {
    /// Ascending distances (world units) where the next level starts
    pub thresholds: Vec<f32>,
    pub max_level: u32,
    /// Build seam meshes between chunks of different levels
    pub seam_stitching: bool,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            thresholds: vec![64.0, 128.0, 256.0],
            max_level: 3,
            seam_stitching: true,
        }
    }
}

/// Per-tick generation budget
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetSettings {
    /// Adapt chunks-per-tick to the measured frame rate
    pub adaptive: bool,
    /// Fixed budget, and the starting point of the adaptive one
    pub chunks_per_tick: u32,
    pub min_chunks_per_tick: u32,
    pub max_chunks_per_tick: u32,
    pub target_fps: f32,
    /// Tolerance band around `target_fps`
    pub fps_buffer: f32,
    /// Seconds between adjustments
    pub adjust_interval: f32,
    /// Weight of the newest frame in the moving average (0..1]
    pub smoothing: f32,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            adaptive: true,
            chunks_per_tick: 4,
            min_chunks_per_tick: 1,
            max_chunks_per_tick: 16,
            target_fps: 60.0,
            fps_buffer: 5.0,
            adjust_interval: 0.5,
            smoothing: 0.1,
        }
    }
}

/// Global noise parameters shared by every biome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NoiseSettings {
    pub seed: u32,
    /// Frequency of the biome selector
    pub biome_scale: f32,
    /// Width of the selector band blended below each biome threshold
    pub biome_blend_width: f32,
    pub temperature_scale: f32,
    pub humidity_scale: f32,
    /// Relative change of height impact at extreme temperature
    pub temperature_influence: f32,
    /// Relative change of cave impact at extreme humidity
    pub humidity_influence: f32,
    /// Ground level shift in world units at extreme climate
    pub climate_ground_shift: f32,
    pub river_scale: f32,
    /// River noise magnitude below which a channel is carved
    pub river_threshold: f32,
    pub river_depth: f32,
    /// Depth over which caves fade in below the surface
    pub cave_fade_depth: f32,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            seed: 12345,
            biome_scale: 0.002,
            biome_blend_width: 0.05,
            temperature_scale: 0.0015,
            humidity_scale: 0.0017,
            temperature_influence: 0.25,
            humidity_influence: 0.25,
            climate_ground_shift: 4.0,
            river_scale: 0.003,
            river_threshold: 0.04,
            river_depth: 6.0,
            cave_fade_depth: 8.0,
        }
    }
}

/// Top-level terrain configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerrainConfig {
    /// World size of one chunk
    pub chunk_size: [f32; 3],
    /// Voxel size at LOD 0
    pub base_voxel_size: f32,
    /// Horizontal load distance in world units
    pub load_distance: f32,
    /// Vertical load radius in chunks
    pub vertical_load_radius: i32,
    /// Extra chunks beyond the load radius before a chunk unloads
    pub unload_hysteresis: i32,
    pub iso_level: f32,
    pub lod: LodSettings,
    pub budget: BudgetSettings,
    pub processing_mode: ProcessingMode,
    pub biomes: Vec<BiomeProfile>,
    pub noise: NoiseSettings,
    /// Vertex cap per extracted surface
    pub max_vertices_per_chunk: usize,
    /// Compute-backend edit retries on a stale readback before applying on the CPU
    pub max_edit_retries: u32,
    /// Publish the render surface as the collision mesh too
    pub collision_meshes: bool,
    /// Worker pool size, 0 = one per core
    pub worker_threads: usize,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            chunk_size: [32.0, 32.0, 32.0],
            base_voxel_size: 1.0,
            load_distance: 160.0,
            vertical_load_radius: 2,
            unload_hysteresis: 1,
            iso_level: 0.0,
            lod: LodSettings::default(),
            budget: BudgetSettings::default(),
            processing_mode: ProcessingMode::Cpu,
            biomes: vec![BiomeProfile::default()],
            noise: NoiseSettings::default(),
            max_vertices_per_chunk: 1_048_576,
            max_edit_retries: 3,
            collision_meshes: true,
            worker_threads: 0,
        }
    }
}

impl TerrainConfig {
    /// Single flat biome with the surface at `ground_level` and nothing carved
    pub fn flat(ground_level: f32) -> Self {
        Self {
            biomes: vec![BiomeProfile::flat(ground_level)],
            noise: NoiseSettings {
                climate_ground_shift: 0.0,
                river_depth: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        log::info!("Loaded terrain config from {}", path.display());
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(Error::Config(format!(
                "chunk_size must be positive, got {:?}",
                self.chunk_size
            )));
        }
        if !self.base_voxel_size.is_finite() || self.base_voxel_size <= 0.0 {
            return Err(Error::Config(format!(
                "base_voxel_size must be positive, got {}",
                self.base_voxel_size
            )));
        }
        if !self.load_distance.is_finite() || self.load_distance < 0.0 {
            return Err(Error::Config("load_distance must be non-negative".to_string()));
        }
        if self.vertical_load_radius < 0 || self.unload_hysteresis < 0 {
            return Err(Error::Config(
                "vertical_load_radius and unload_hysteresis must be non-negative".to_string(),
            ));
        }
        if self.lod.thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(Error::Config("lod thresholds must be non-negative".to_string()));
        }
        if self.lod.max_level > 16 {
            return Err(Error::Config(format!(
                "lod.max_level {} is out of range (0..=16)",
                self.lod.max_level
            )));
        }
        // Exact at the coarsest level implies exact at every finer one
        let coarsest_voxel = self.base_voxel_size * (1u32 << self.lod.max_level) as f32;
        if exact_cells(self.chunk_extent(), coarsest_voxel).is_none() {
            return Err(Error::Config(format!(
                "chunk_size {:?} is not a whole number of {} unit voxels at lod {}",
                self.chunk_size, coarsest_voxel, self.lod.max_level
            )));
        }

        let budget = &self.budget;
        if budget.min_chunks_per_tick == 0 || budget.min_chunks_per_tick > budget.max_chunks_per_tick {
            return Err(Error::Config(format!(
                "budget bounds must satisfy 1 <= min ({}) <= max ({})",
                budget.min_chunks_per_tick, budget.max_chunks_per_tick
            )));
        }
        if budget.chunks_per_tick == 0 {
            return Err(Error::Config("budget.chunks_per_tick must be at least 1".to_string()));
        }
        if budget.target_fps <= 0.0 || budget.fps_buffer < 0.0 || budget.adjust_interval <= 0.0 {
            return Err(Error::Config(
                "budget target_fps and adjust_interval must be positive".to_string(),
            ));
        }
        if !(budget.smoothing > 0.0 && budget.smoothing <= 1.0) {
            return Err(Error::Config(format!(
                "budget.smoothing must be in (0, 1], got {}",
                budget.smoothing
            )));
        }
        if self.max_vertices_per_chunk < 3 {
            return Err(Error::Config("max_vertices_per_chunk must allow one triangle".to_string()));
        }

        for biome in &self.biomes {
            biome.validate()?;
        }
        Ok(())
    }

    pub fn chunk_extent(&self) -> Vec3 {
        Vec3::from_array(self.chunk_size)
    }

    /// Horizontal load radius in chunks
    pub fn load_radius_chunks(&self) -> i32 {
        let horizontal = self.chunk_size[0].min(self.chunk_size[2]);
        (self.load_distance / horizontal).ceil() as i32
    }

    /// Cells per axis at LOD 0
    pub fn base_dimensions(&self) -> UVec3 {
        let cells = self.chunk_extent() / self.base_voxel_size;
        cells.round().as_uvec3().max(UVec3::ONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TerrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.load_radius_chunks(), 5);
        assert_eq!(config.base_dimensions(), UVec3::splat(32));
        assert_eq!(config.processing_mode, ProcessingMode::Cpu);
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: TerrainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TerrainConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "chunk_size": [16, 16, 16],
            "processing_mode": "hybrid",
            "lod": { "thresholds": [32, 96] },
            "budget": { "adaptive": false, "chunks_per_tick": 2 }
        }"#;
        let config: TerrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.chunk_size, [16.0; 3]);
        assert_eq!(config.processing_mode, ProcessingMode::Hybrid);
        assert_eq!(config.lod.thresholds, vec![32.0, 96.0]);
        assert_eq!(config.lod.max_level, 3);
        assert!(!config.budget.adaptive);
        assert_eq!(config.budget.max_chunks_per_tick, 16);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<TerrainConfig>(r#"{"chunk_sise": [1,1,1]}"#).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = TerrainConfig::default();
        config.chunk_size = [32.0, 0.0, 32.0];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TerrainConfig::default();
        config.budget.min_chunks_per_tick = 8;
        config.budget.max_chunks_per_tick = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TerrainConfig::default();
        config.budget.smoothing = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_must_tile_at_every_level() {
        let mut config = TerrainConfig::default();
        config.chunk_size = [48.0; 3];
        config.base_voxel_size = 1.0;
        config.lod.max_level = 6;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.lod.max_level = 4;
        config.validate().unwrap();

        config.base_voxel_size = 0.7;
        assert!(config.validate().is_err());

        config.base_voxel_size = 64.0;
        config.lod.max_level = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs").join("terrain.json");

        let mut config = TerrainConfig::flat(12.0);
        config.processing_mode = ProcessingMode::Gpu;
        config.max_edit_retries = 5;
        config.save(&path).unwrap();

        let loaded = TerrainConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"base_voxel_size": -1}"#).unwrap();
        assert!(matches!(TerrainConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(TerrainConfig::load(&path), Err(Error::Json(_))));
    }

    #[test]
    fn test_mode_routing() {
        assert!(!ProcessingMode::Cpu.density_on_backend());
        assert!(ProcessingMode::Hybrid.density_on_backend());
        assert!(!ProcessingMode::Hybrid.meshing_on_backend());
        assert!(ProcessingMode::Gpu.meshing_on_backend());
    }
}
