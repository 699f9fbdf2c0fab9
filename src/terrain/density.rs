//! Procedural density field
//!
//! Negative density is solid, non-negative is empty; the zero crossing is the
//! terrain surface. Values are clamped to [-1, 1]. Evaluation is pure and
//! deterministic so the field can be shared across worker threads.

use glam::{Vec2, Vec3};

use super::biome::{smoothstep, BiomeProfile, BiomeTable, BlendedBiome, MAX_WARP_LAYERS};
use super::noise::{ridged, NoiseLayer, WarpNoise};
use crate::config::{NoiseSettings, TerrainConfig};
use crate::core::logging::WarnOnce;

static NON_FINITE_SAMPLE: WarnOnce = WarnOnce::new();

/// Replace a non-finite density: NaN and +inf read as empty, -inf as solid
///
/// Finite values are clamped to [-1, 1]. The flag is set when the input was
/// not finite.
pub fn sanitize(value: f32) -> (f32, bool) {
    if value.is_nan() || value == f32::INFINITY {
        (1.0, true)
    } else if value == f32::NEG_INFINITY {
        (-1.0, true)
    } else {
        (value.clamp(-1.0, 1.0), false)
    }
}

/// Density plus the material tag of the dominant biome
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensitySample {
    pub density: f32,
    pub material: u8,
}

/// Seed offsets so every layer gets an independent permutation table
mod seeds {
    pub const SELECTOR: u32 = 0;
    pub const TEMPERATURE: u32 = 1;
    pub const HUMIDITY: u32 = 2;
    pub const HEIGHT: u32 = 3;
    pub const EXTRA: u32 = 4;
    pub const CLIFF: u32 = 5;
    pub const PLATEAU: u32 = 6;
    pub const SURFACE_CAVES: u32 = 7;
    pub const CAVE: u32 = 8;
    pub const CAVE_EXTRA: u32 = 9;
    pub const RIVER: u32 = 10;
    pub const WARP: u32 = 16;
    pub const CAVE_WARP: u32 = 32;
}

/// The terrain density function
#[derive(Clone)]
pub struct DensityField {
    biomes: BiomeTable,
    settings: NoiseSettings,
    selector: NoiseLayer,
    temperature: NoiseLayer,
    humidity: NoiseLayer,
    height: NoiseLayer,
    extra: NoiseLayer,
    cliff: NoiseLayer,
    plateau: NoiseLayer,
    surface_caves: NoiseLayer,
    cave: NoiseLayer,
    cave_extra: NoiseLayer,
    river: NoiseLayer,
    warps: [WarpNoise; MAX_WARP_LAYERS],
    cave_warp: WarpNoise,
}

impl DensityField {
    pub fn new(biomes: Vec<BiomeProfile>, settings: NoiseSettings) -> Self {
        let seed = settings.seed;
        let layer = |offset: u32| NoiseLayer::new(seed.wrapping_add(offset));

        Self {
            biomes: BiomeTable::new(biomes, settings.biome_blend_width),
            selector: layer(seeds::SELECTOR),
            temperature: layer(seeds::TEMPERATURE),
            humidity: layer(seeds::HUMIDITY),
            height: layer(seeds::HEIGHT),
            extra: layer(seeds::EXTRA),
            cliff: layer(seeds::CLIFF),
            plateau: layer(seeds::PLATEAU),
            surface_caves: layer(seeds::SURFACE_CAVES),
            cave: layer(seeds::CAVE),
            cave_extra: layer(seeds::CAVE_EXTRA),
            river: layer(seeds::RIVER),
            warps: [
                WarpNoise::new(seed.wrapping_add(seeds::WARP)),
                WarpNoise::new(seed.wrapping_add(seeds::WARP + 4)),
            ],
            cave_warp: WarpNoise::new(seed.wrapping_add(seeds::CAVE_WARP)),
            settings,
        }
    }

    pub fn from_config(config: &TerrainConfig) -> Self {
        Self::new(config.biomes.clone(), config.noise.clone())
    }

    pub fn biomes(&self) -> &BiomeTable {
        &self.biomes
    }

    /// Density at a world position, in [-1, 1]
    pub fn density(&self, pos: Vec3) -> f32 {
        self.sample(pos).density
    }

    /// Density and material at a world position
    ///
    /// Never panics: non-finite or far-out positions still give a density in
    /// [-1, 1], with non-finite results replaced as in [`sanitize`].
    pub fn sample(&self, pos: Vec3) -> DensitySample {
        let xz = Vec2::new(pos.x, pos.z);
        let biome = self.climate_adjusted(xz);
        let surface_height = self.surface_height_for(xz, &biome);

        let depth = surface_height - pos.y;
        let mut density = pos.y - surface_height;

        if depth > 0.0 && biome.cave_impact != 0.0 {
            let fade = smoothstep(0.0, self.settings.cave_fade_depth, depth);
            density -= self.cave_signal(pos, &biome) * biome.cave_impact * fade;
        }

        if depth > 0.0 {
            if let Some(mask) = &biome.surface_caves {
                let m = self.surface_caves.sample2_unit(xz * mask.scale);
                if m > mask.threshold {
                    let openness = (m - mask.threshold) / (1.0 - mask.threshold).max(f32::EPSILON);
                    let attenuation = 1.0 - smoothstep(0.0, mask.max_depth, depth);
                    density += openness * mask.strength * attenuation;
                }
            }
        }

        let lowering = self.river_lowering(xz);
        if lowering > 0.0 && depth < self.settings.river_depth {
            density = density.max(pos.y - (surface_height - lowering));
        }

        let (density, anomalous) = sanitize(density);
        if anomalous {
            crate::warn_once!(
                NON_FINITE_SAMPLE,
                "Non-finite density at {}, substituting {}",
                pos,
                density
            );
        }

        DensitySample {
            density,
            material: biome.dominant.min(u8::MAX as usize) as u8,
        }
    }

    /// Terrain surface height at (x, z) with river channels, ignoring caves
    pub fn surface_height(&self, x: f32, z: f32) -> f32 {
        let xz = Vec2::new(x, z);
        let biome = self.climate_adjusted(xz);
        self.surface_height_for(xz, &biome) - self.river_lowering(xz)
    }

    /// Blended biome parameters after temperature and humidity modifiers
    pub fn biome_at(&self, x: f32, z: f32) -> BlendedBiome {
        self.climate_adjusted(Vec2::new(x, z))
    }

    fn climate_adjusted(&self, xz: Vec2) -> BlendedBiome {
        let s = &self.settings;
        let selector = self.selector.sample2_unit(xz * s.biome_scale);
        let mut biome = self.biomes.blend(self.biomes.weights(selector));

        let temperature = self.temperature.sample2(xz * s.temperature_scale);
        let humidity = self.humidity.sample2(xz * s.humidity_scale);

        biome.height_impact *= 1.0 + s.temperature_influence * temperature;
        biome.cave_impact *= 1.0 + s.humidity_influence * humidity;
        // Warm dry regions sit higher than cold wet ones
        biome.ground_level += s.climate_ground_shift * 0.5 * (temperature - humidity);
        biome
    }

    fn surface_height_for(&self, xz: Vec2, biome: &BlendedBiome) -> f32 {
        let mut warped = xz;
        for (warp, layer) in self.warps.iter().zip(biome.warp_layers.iter()) {
            if let Some(layer) = layer {
                warped = warp.warp2(warped, layer.scale, layer.strength, layer.ridged);
            }
        }

        let mut height = 0.0;
        if biome.height_impact != 0.0 {
            let base = self.height.fbm2(
                warped * biome.height_scale,
                biome.octaves,
                biome.lacunarity,
                biome.persistence,
            );
            height = base * biome.height_impact;
        }

        if let Some(extra) = &biome.extra_layer {
            height += self.extra.sample2(warped * extra.scale) * extra.amplitude;
        }

        if let Some(cliff) = &biome.cliff {
            let r = ridged(self.cliff.sample2(warped * cliff.scale));
            if r > cliff.threshold {
                let mask = (r - cliff.threshold) / (1.0 - cliff.threshold).max(f32::EPSILON);
                height -= mask * cliff.strength;
            }
        }

        if let Some(plateau) = &biome.plateau {
            let m = self.plateau.sample2_unit(warped * plateau.scale);
            if m > plateau.threshold && plateau.step_height > 0.0 {
                let mask = smoothstep(plateau.threshold, 1.0, m) * plateau.strength.clamp(0.0, 1.0);
                let stepped = (height / plateau.step_height).round() * plateau.step_height;
                height += (stepped - height) * mask;
            }
        }

        biome.ground_level + height
    }

    fn cave_signal(&self, pos: Vec3, biome: &BlendedBiome) -> f32 {
        let mut p = pos;
        if let Some(warp) = &biome.cave_warp {
            p = self.cave_warp.warp3(p, warp.scale, warp.strength, warp.ridged);
        }

        let mut signal = self.cave.fbm3(
            p * biome.cave_scale,
            biome.octaves,
            biome.lacunarity,
            biome.persistence,
        );
        if let Some(extra) = &biome.cave_extra_layer {
            signal += self.cave_extra.sample3(p * extra.scale) * extra.amplitude;
        }
        signal
    }

    /// How far a river lowers the surface at (x, z)
    fn river_lowering(&self, xz: Vec2) -> f32 {
        let s = &self.settings;
        if s.river_depth <= 0.0 || s.river_threshold <= 0.0 {
            return 0.0;
        }
        let r = self.river.sample2(xz * s.river_scale).abs();
        if r >= s.river_threshold {
            return 0.0;
        }
        let proximity = 1.0 - r / s.river_threshold;
        s.river_depth * smoothstep(0.0, 1.0, proximity)
    }
}
