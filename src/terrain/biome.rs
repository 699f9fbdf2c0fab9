//! Biome profiles and the threshold-sorted table used to blend between them

use serde::{Deserialize, Serialize};

use crate::core::logging::WarnOnce;
use crate::core::types::Result;
use crate::core::Error;

static EMPTY_BIOME_LIST: WarnOnce = WarnOnce::new();

/// Maximum number of stacked domain-warp layers per profile
pub const MAX_WARP_LAYERS: usize = 2;

/// Displaces the sampling position by another noise function
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarpLayer {
    /// Noise frequency
    pub scale: f32,
    /// Displacement in world units
    pub strength: f32,
    /// Use `1 - |n|` instead of raw noise
    pub ridged: bool,
}

impl Default for WarpLayer {
    fn default() -> Self {
        Self { scale: 0.004, strength: 24.0, ridged: false }
    }
}

/// Secondary additive noise layer
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtraLayer {
    pub scale: f32,
    pub amplitude: f32,
}

impl Default for ExtraLayer {
    fn default() -> Self {
        Self { scale: 0.03, amplitude: 4.0 }
    }
}

/// Ridged mask that cuts steep drops into the height field
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliffLayer {
    pub scale: f32,
    /// Ridged values above this start cutting
    pub threshold: f32,
    /// Height removed at full mask
    pub strength: f32,
}

impl Default for CliffLayer {
    fn default() -> Self {
        Self { scale: 0.01, threshold: 0.7, strength: 12.0 }
    }
}

/// Quantizes height toward multiples of `step_height` where the mask is high
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlateauLayer {
    pub scale: f32,
    pub threshold: f32,
    pub step_height: f32,
    /// 0 = untouched, 1 = fully stepped
    pub strength: f32,
}

impl Default for PlateauLayer {
    fn default() -> Self {
        Self { scale: 0.006, threshold: 0.3, step_height: 8.0, strength: 0.8 }
    }
}

/// 2D mask that opens caves close to the surface
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurfaceCaveMask {
    pub scale: f32,
    pub threshold: f32,
    /// Depth below the surface where the opening fades out
    pub max_depth: f32,
    pub strength: f32,
}

impl Default for SurfaceCaveMask {
    fn default() -> Self {
        Self { scale: 0.02, threshold: 0.6, max_depth: 6.0, strength: 8.0 }
    }
}

/// Shape parameters for one biome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BiomeProfile {
    pub name: String,
    /// Selector value in [0, 1] where this biome starts
    pub threshold: f32,
    pub octaves: u32,
    pub lacunarity: f32,
    pub persistence: f32,
    pub ground_level: f32,
    pub height_impact: f32,
    pub height_scale: f32,
    pub cave_impact: f32,
    pub cave_scale: f32,
    pub warp_layers: Vec<WarpLayer>,
    pub extra_layer: Option<ExtraLayer>,
    pub cliff: Option<CliffLayer>,
    pub plateau: Option<PlateauLayer>,
    pub surface_caves: Option<SurfaceCaveMask>,
    pub cave_warp: Option<WarpLayer>,
    pub cave_extra_layer: Option<ExtraLayer>,
}

impl Default for BiomeProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            threshold: 0.0,
            octaves: 5,
            lacunarity: 2.0,
            persistence: 0.5,
            ground_level: 20.0,
            height_impact: 24.0,
            height_scale: 0.008,
            cave_impact: 16.0,
            cave_scale: 0.04,
            warp_layers: Vec::new(),
            extra_layer: None,
            cliff: None,
            plateau: None,
            surface_caves: None,
            cave_warp: None,
            cave_extra_layer: None,
        }
    }
}

impl BiomeProfile {
    /// Flat ground at `ground_level` with no height or cave signal
    pub fn flat(ground_level: f32) -> Self {
        Self {
            name: "flat".to_string(),
            ground_level,
            height_impact: 0.0,
            cave_impact: 0.0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.warp_layers.len() > MAX_WARP_LAYERS {
            return Err(Error::Config(format!(
                "biome '{}' has {} warp layers, at most {} are supported",
                self.name,
                self.warp_layers.len(),
                MAX_WARP_LAYERS
            )));
        }
        if !self.threshold.is_finite() {
            return Err(Error::Config(format!("biome '{}' has a non-finite threshold", self.name)));
        }
        if self.lacunarity <= 0.0 || self.height_scale < 0.0 || self.cave_scale < 0.0 {
            return Err(Error::Config(format!(
                "biome '{}' needs positive lacunarity and non-negative scales",
                self.name
            )));
        }
        if let Some(plateau) = &self.plateau {
            if plateau.step_height <= 0.0 {
                return Err(Error::Config(format!(
                    "biome '{}' plateau step_height must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Hermite smoothstep, returns 0 below `edge0` and 1 above `edge1`
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Optional layers blend field-wise; a missing side counts as zero strength
trait BlendLayer: Copy {
    fn lerp(&self, other: &Self, t: f32) -> Self;
    fn scaled(&self, factor: f32) -> Self;
}

impl BlendLayer for WarpLayer {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            scale: lerp(self.scale, other.scale, t),
            strength: lerp(self.strength, other.strength, t),
            ridged: if t < 0.5 { self.ridged } else { other.ridged },
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        Self { strength: self.strength * factor, ..*self }
    }
}

impl BlendLayer for ExtraLayer {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            scale: lerp(self.scale, other.scale, t),
            amplitude: lerp(self.amplitude, other.amplitude, t),
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        Self { amplitude: self.amplitude * factor, ..*self }
    }
}

impl BlendLayer for CliffLayer {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            scale: lerp(self.scale, other.scale, t),
            threshold: lerp(self.threshold, other.threshold, t),
            strength: lerp(self.strength, other.strength, t),
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        Self { strength: self.strength * factor, ..*self }
    }
}

impl BlendLayer for PlateauLayer {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            scale: lerp(self.scale, other.scale, t),
            threshold: lerp(self.threshold, other.threshold, t),
            step_height: lerp(self.step_height, other.step_height, t),
            strength: lerp(self.strength, other.strength, t),
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        Self { strength: self.strength * factor, ..*self }
    }
}

impl BlendLayer for SurfaceCaveMask {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            scale: lerp(self.scale, other.scale, t),
            threshold: lerp(self.threshold, other.threshold, t),
            max_depth: lerp(self.max_depth, other.max_depth, t),
            strength: lerp(self.strength, other.strength, t),
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        Self { strength: self.strength * factor, ..*self }
    }
}

fn blend_layer<L: BlendLayer>(a: Option<&L>, b: Option<&L>, t: f32) -> Option<L> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.lerp(b, t)),
        (Some(a), None) => Some(a.scaled(1.0 - t)),
        (None, Some(b)) => Some(b.scaled(t)),
        (None, None) => None,
    }
}

/// Per-sample shape parameters after biome blending
#[derive(Clone, Debug, PartialEq)]
pub struct BlendedBiome {
    pub octaves: u32,
    pub lacunarity: f32,
    pub persistence: f32,
    pub ground_level: f32,
    pub height_impact: f32,
    pub height_scale: f32,
    pub cave_impact: f32,
    pub cave_scale: f32,
    pub warp_layers: [Option<WarpLayer>; MAX_WARP_LAYERS],
    pub extra_layer: Option<ExtraLayer>,
    pub cliff: Option<CliffLayer>,
    pub plateau: Option<PlateauLayer>,
    pub surface_caves: Option<SurfaceCaveMask>,
    pub cave_warp: Option<WarpLayer>,
    pub cave_extra_layer: Option<ExtraLayer>,
    /// Index of the biome with the larger weight
    pub dominant: usize,
}

/// Which biomes contribute at a selector value and by how much
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiomeWeights {
    pub primary: usize,
    pub secondary: usize,
    /// Weight of `secondary`, 0 when not blending
    pub t: f32,
}

impl BiomeWeights {
    pub fn dominant(&self) -> usize {
        if self.t < 0.5 { self.primary } else { self.secondary }
    }
}

/// Biome profiles flattened and sorted by threshold
#[derive(Clone, Debug)]
pub struct BiomeTable {
    profiles: Vec<BiomeProfile>,
    blend_width: f32,
}

impl BiomeTable {
    /// Sort profiles by threshold; an empty list falls back to the default profile
    pub fn new(mut profiles: Vec<BiomeProfile>, blend_width: f32) -> Self {
        if profiles.is_empty() {
            crate::warn_once!(
                EMPTY_BIOME_LIST,
                "Biome list is empty, falling back to the default profile"
            );
            profiles.push(BiomeProfile::default());
        }
        profiles.sort_by(|a, b| a.threshold.total_cmp(&b.threshold));
        Self { profiles, blend_width: blend_width.max(0.0) }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[BiomeProfile] {
        &self.profiles
    }

    /// Pick the biome for a selector value in [0, 1]
    pub fn weights(&self, selector: f32) -> BiomeWeights {
        // Greatest threshold <= selector, first biome if none
        let primary = self
            .profiles
            .iter()
            .rposition(|p| p.threshold <= selector)
            .unwrap_or(0);

        let Some(next) = self.profiles.get(primary + 1) else {
            return BiomeWeights { primary, secondary: primary, t: 0.0 };
        };

        if self.blend_width <= 0.0 || selector < self.profiles[primary].threshold {
            return BiomeWeights { primary, secondary: primary, t: 0.0 };
        }

        let t = smoothstep(next.threshold - self.blend_width, next.threshold, selector);
        BiomeWeights { primary, secondary: primary + 1, t }
    }

    /// Blend every scalar parameter of the two contributing biomes
    pub fn blend(&self, weights: BiomeWeights) -> BlendedBiome {
        let a = &self.profiles[weights.primary];
        let b = &self.profiles[weights.secondary];
        let t = weights.t;

        let mut warp_layers = [None; MAX_WARP_LAYERS];
        for (i, slot) in warp_layers.iter_mut().enumerate() {
            *slot = blend_layer(a.warp_layers.get(i), b.warp_layers.get(i), t);
        }

        BlendedBiome {
            octaves: lerp(a.octaves as f32, b.octaves as f32, t).round() as u32,
            lacunarity: lerp(a.lacunarity, b.lacunarity, t),
            persistence: lerp(a.persistence, b.persistence, t),
            ground_level: lerp(a.ground_level, b.ground_level, t),
            height_impact: lerp(a.height_impact, b.height_impact, t),
            height_scale: lerp(a.height_scale, b.height_scale, t),
            cave_impact: lerp(a.cave_impact, b.cave_impact, t),
            cave_scale: lerp(a.cave_scale, b.cave_scale, t),
            warp_layers,
            extra_layer: blend_layer(a.extra_layer.as_ref(), b.extra_layer.as_ref(), t),
            cliff: blend_layer(a.cliff.as_ref(), b.cliff.as_ref(), t),
            plateau: blend_layer(a.plateau.as_ref(), b.plateau.as_ref(), t),
            surface_caves: blend_layer(a.surface_caves.as_ref(), b.surface_caves.as_ref(), t),
            cave_warp: blend_layer(a.cave_warp.as_ref(), b.cave_warp.as_ref(), t),
            cave_extra_layer: blend_layer(a.cave_extra_layer.as_ref(), b.cave_extra_layer.as_ref(), t),
            dominant: weights.dominant(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, threshold: f32, ground_level: f32) -> BiomeProfile {
        BiomeProfile {
            name: name.to_string(),
            threshold,
            ground_level,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_list_falls_back() {
        let table = BiomeTable::new(Vec::new(), 0.1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.profiles()[0], BiomeProfile::default());
    }

    #[test]
    fn test_sorted_by_threshold() {
        let table = BiomeTable::new(
            vec![profile("hills", 0.6, 30.0), profile("plains", 0.0, 10.0), profile("coast", 0.3, 5.0)],
            0.0,
        );
        let names: Vec<&str> = table.profiles().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["plains", "coast", "hills"]);
    }

    #[test]
    fn test_hard_switch_without_blend_width() {
        let table = BiomeTable::new(vec![profile("low", 0.0, 10.0), profile("high", 0.5, 30.0)], 0.0);

        let w = table.weights(0.49);
        assert_eq!(w, BiomeWeights { primary: 0, secondary: 0, t: 0.0 });
        assert_eq!(table.weights(0.5).primary, 1);
        assert_eq!(table.blend(table.weights(0.7)).ground_level, 30.0);
    }

    #[test]
    fn test_selector_below_first_threshold_uses_first() {
        let table = BiomeTable::new(vec![profile("a", 0.2, 10.0), profile("b", 0.8, 30.0)], 0.1);
        let w = table.weights(0.05);
        assert_eq!(w.primary, 0);
        assert_eq!(w.t, 0.0);
    }

    #[test]
    fn test_blend_band_is_continuous() {
        let table = BiomeTable::new(vec![profile("low", 0.0, 10.0), profile("high", 0.5, 30.0)], 0.2);

        assert_eq!(table.blend(table.weights(0.25)).ground_level, 10.0);

        let mid = table.blend(table.weights(0.4)).ground_level;
        assert!(mid > 10.0 && mid < 30.0, "mid-band ground level {mid}");

        let below = table.blend(table.weights(0.49999)).ground_level;
        let above = table.blend(table.weights(0.5)).ground_level;
        assert!((below - above).abs() < 0.01);
    }

    #[test]
    fn test_missing_layer_blends_as_zero_strength() {
        let mut cliffy = profile("cliffs", 0.5, 20.0);
        cliffy.cliff = Some(CliffLayer { strength: 10.0, ..Default::default() });
        let table = BiomeTable::new(vec![profile("plain", 0.0, 20.0), cliffy], 0.2);

        let weights = BiomeWeights { primary: 0, secondary: 1, t: 0.25 };
        let blended = table.blend(weights);
        let cliff = blended.cliff.unwrap();
        assert!((cliff.strength - 2.5).abs() < 1e-5);
        assert_eq!(blended.dominant, 0);
    }

    #[test]
    fn test_too_many_warp_layers_rejected() {
        let mut p = BiomeProfile::default();
        p.warp_layers = vec![WarpLayer::default(); 3];
        assert!(matches!(p.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_profile_json_defaults() {
        let p: BiomeProfile = serde_json::from_str(r#"{"name":"dunes","threshold":0.4}"#).unwrap();
        assert_eq!(p.name, "dunes");
        assert_eq!(p.octaves, BiomeProfile::default().octaves);
        assert!(serde_json::from_str::<BiomeProfile>(r#"{"bogus":1}"#).is_err());
    }
}
