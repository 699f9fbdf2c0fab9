//! Seeded Perlin layers and amplitude-normalized fractal sums

use glam::{Vec2, Vec3};
use noise::{NoiseFn, Perlin};

/// Per-octave sampling offset so octaves don't share lattice points
const OCTAVE_OFFSET: f64 = 31.416;

/// Coordinates past this magnitude are folded back before reaching Perlin
const LATTICE_LIMIT: f64 = 1_048_576.0;

/// Keep a noise coordinate where the lattice lookup is defined
///
/// Non-finite values read as the origin. Finite values beyond
/// `LATTICE_LIMIT` wrap into `[-LATTICE_LIMIT, LATTICE_LIMIT)`.
fn lattice(v: f64) -> f64 {
    if !v.is_finite() {
        0.0
    } else if v.abs() <= LATTICE_LIMIT {
        v
    } else {
        (v + LATTICE_LIMIT).rem_euclid(2.0 * LATTICE_LIMIT) - LATTICE_LIMIT
    }
}

/// One independent Perlin source
#[derive(Clone)]
pub struct NoiseLayer {
    perlin: Perlin,
}

impl NoiseLayer {
    pub fn new(seed: u32) -> Self {
        Self { perlin: Perlin::new(seed) }
    }

    /// Raw 2D noise in roughly [-1, 1]
    pub fn sample2(&self, p: Vec2) -> f32 {
        self.perlin.get([lattice(p.x as f64), lattice(p.y as f64)]) as f32
    }

    /// Raw 3D noise in roughly [-1, 1]
    pub fn sample3(&self, p: Vec3) -> f32 {
        self.perlin.get([lattice(p.x as f64), lattice(p.y as f64), lattice(p.z as f64)]) as f32
    }

    /// Noise remapped to [0, 1]
    pub fn sample2_unit(&self, p: Vec2) -> f32 {
        (self.sample2(p) * 0.5 + 0.5).clamp(0.0, 1.0)
    }

    /// Fractal sum over XZ divided by the total amplitude
    ///
    /// Zero octaves contribute nothing.
    pub fn fbm2(&self, p: Vec2, octaves: u32, lacunarity: f32, persistence: f32) -> f32 {
        let mut sum = 0.0f64;
        let mut amplitude = 1.0f64;
        let mut total = 0.0f64;
        let mut frequency = 1.0f64;

        for octave in 0..octaves {
            let offset = octave as f64 * OCTAVE_OFFSET;
            let x = lattice(p.x as f64 * frequency + offset);
            let y = lattice(p.y as f64 * frequency + offset);
            sum += self.perlin.get([x, y]) * amplitude;
            total += amplitude;
            amplitude *= persistence as f64;
            frequency *= lacunarity as f64;
        }

        if total <= 0.0 { 0.0 } else { (sum / total) as f32 }
    }

    /// 3D variant of [`fbm2`](Self::fbm2)
    pub fn fbm3(&self, p: Vec3, octaves: u32, lacunarity: f32, persistence: f32) -> f32 {
        let mut sum = 0.0f64;
        let mut amplitude = 1.0f64;
        let mut total = 0.0f64;
        let mut frequency = 1.0f64;

        for octave in 0..octaves {
            let offset = octave as f64 * OCTAVE_OFFSET;
            let point = [
                lattice(p.x as f64 * frequency + offset),
                lattice(p.y as f64 * frequency + offset),
                lattice(p.z as f64 * frequency + offset),
            ];
            sum += self.perlin.get(point) * amplitude;
            total += amplitude;
            amplitude *= persistence as f64;
            frequency *= lacunarity as f64;
        }

        if total <= 0.0 { 0.0 } else { (sum / total) as f32 }
    }
}

/// Ridge transform `1 - |n|`
pub fn ridged(n: f32) -> f32 {
    1.0 - n.abs()
}

/// Decorrelated per-axis sources displacing a position
#[derive(Clone)]
pub struct WarpNoise {
    x: NoiseLayer,
    y: NoiseLayer,
    z: NoiseLayer,
}

impl WarpNoise {
    pub fn new(seed: u32) -> Self {
        Self {
            x: NoiseLayer::new(seed),
            y: NoiseLayer::new(seed.wrapping_add(1)),
            z: NoiseLayer::new(seed.wrapping_add(2)),
        }
    }

    fn shape(n: f32, ridge: bool) -> f32 {
        // Ridged output lives in [0, 1], recentre so the warp stays unbiased
        if ridge { ridged(n) * 2.0 - 1.0 } else { n }
    }

    /// Offset an XZ position
    pub fn warp2(&self, p: Vec2, scale: f32, strength: f32, ridge: bool) -> Vec2 {
        if strength == 0.0 {
            return p;
        }
        let q = p * scale;
        let dx = Self::shape(self.x.sample2(q), ridge);
        let dz = Self::shape(self.z.sample2(q), ridge);
        p + Vec2::new(dx, dz) * strength
    }

    /// Offset a 3D position
    pub fn warp3(&self, p: Vec3, scale: f32, strength: f32, ridge: bool) -> Vec3 {
        if strength == 0.0 {
            return p;
        }
        let q = p * scale;
        let d = Vec3::new(
            Self::shape(self.x.sample3(q), ridge),
            Self::shape(self.y.sample3(q), ridge),
            Self::shape(self.z.sample3(q), ridge),
        );
        p + d * strength
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_octaves_is_zero() {
        let layer = NoiseLayer::new(7);
        assert_eq!(layer.fbm2(Vec2::new(3.3, 4.4), 0, 2.0, 0.5), 0.0);
        assert_eq!(layer.fbm3(Vec3::new(1.1, 2.2, 3.3), 0, 2.0, 0.5), 0.0);
    }

    #[test]
    fn test_fbm_normalized() {
        let layer = NoiseLayer::new(42);
        for i in 0..200 {
            let p = Vec2::new(i as f32 * 0.731, i as f32 * -0.377);
            let v = layer.fbm2(p, 6, 2.0, 0.5);
            assert!(v.abs() <= 1.01, "fbm out of range: {v}");
        }
    }

    #[test]
    fn test_same_seed_same_values() {
        let a = NoiseLayer::new(99);
        let b = NoiseLayer::new(99);
        let p = Vec3::new(12.5, -3.25, 7.75);
        assert_eq!(a.fbm3(p, 4, 2.0, 0.5).to_bits(), b.fbm3(p, 4, 2.0, 0.5).to_bits());
    }

    #[test]
    fn test_zero_strength_warp_is_identity() {
        let warp = WarpNoise::new(5);
        let p = Vec2::new(10.3, -4.1);
        assert_eq!(warp.warp2(p, 0.01, 0.0, true), p);
    }

    #[test]
    fn test_ridged() {
        assert_eq!(ridged(0.0), 1.0);
        assert_eq!(ridged(-1.0), 0.0);
        assert_eq!(ridged(0.25), 0.75);
    }
}
