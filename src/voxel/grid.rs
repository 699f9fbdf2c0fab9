//! Padded density grids and their central-difference gradients
//!
//! A grid with `dims` cells per axis stores `dims + 1` corner samples per axis
//! plus one halo sample on every side, so sample coordinates run from `-1` to
//! `dims + 1` inclusive. The halo lets gradients at the chunk border be taken
//! by central differences without touching the neighbouring chunk.

use glam::{IVec3, UVec3, Vec3};
use rayon::prelude::*;

use crate::terrain::density::{sanitize, DensityField, DensitySample};

/// Summary of density samples; non-finite values are counted, never averaged
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityStats {
    pub count: u32,
    pub solid: u32,
    pub empty: u32,
    pub non_finite: u32,
    pub min: f32,
    pub max: f32,
    sum: f64,
}

impl Default for DensityStats {
    fn default() -> Self {
        Self {
            count: 0,
            solid: 0,
            empty: 0,
            non_finite: 0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            sum: 0.0,
        }
    }
}

impl DensityStats {
    pub fn add(&mut self, value: f32) {
        if !value.is_finite() {
            self.non_finite += 1;
            return;
        }
        self.count += 1;
        if value < 0.0 {
            self.solid += 1;
        } else {
            self.empty += 1;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value as f64;
    }

    pub fn merge(mut self, other: DensityStats) -> DensityStats {
        self.count += other.count;
        self.solid += other.solid;
        self.empty += other.empty;
        self.non_finite += other.non_finite;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self
    }

    pub fn mean(&self) -> f32 {
        if self.count == 0 { 0.0 } else { (self.sum / self.count as f64) as f32 }
    }
}

/// Density samples for one chunk, with a one-sample halo
#[derive(Clone, Debug)]
pub struct DensityGrid {
    dims: UVec3,
    values: Vec<f32>,
    materials: Vec<u8>,
    anomalies: u32,
}

impl DensityGrid {
    /// Grid for `dims` cells per axis, initialized to empty space
    pub fn new(dims: UVec3) -> Self {
        let mut grid = Self {
            dims: UVec3::ZERO,
            values: Vec::new(),
            materials: Vec::new(),
            anomalies: 0,
        };
        grid.reset(dims);
        grid
    }

    /// Grid without storage, standing in while the real one is on a worker
    ///
    /// Keeps `dims` so bounds stay correct. Reading samples panics.
    pub fn detached(dims: UVec3) -> Self {
        Self {
            dims: dims.max(UVec3::ONE),
            values: Vec::new(),
            materials: Vec::new(),
            anomalies: 0,
        }
    }

    /// Stored samples per axis including the halo
    pub fn padded_dims_for(dims: UVec3) -> UVec3 {
        dims + UVec3::splat(3)
    }

    pub fn sample_count_for(dims: UVec3) -> usize {
        let p = Self::padded_dims_for(dims);
        p.x as usize * p.y as usize * p.z as usize
    }

    /// Resize for new dimensions, reusing the allocation when it is big enough
    pub fn reset(&mut self, dims: UVec3) {
        let dims = dims.max(UVec3::ONE);
        let count = Self::sample_count_for(dims);
        self.dims = dims;
        self.values.clear();
        self.values.resize(count, 1.0);
        self.materials.clear();
        self.materials.resize(count, 0);
        self.anomalies = 0;
    }

    /// Cells per axis
    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn padded_dims(&self) -> UVec3 {
        Self::padded_dims_for(self.dims)
    }

    /// Allocated sample capacity
    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether a sample coordinate is inside the padded range
    pub fn contains(&self, p: IVec3) -> bool {
        let hi = self.dims.as_ivec3() + IVec3::ONE;
        p.cmpge(IVec3::splat(-1)).all() && p.cmple(hi).all()
    }

    /// Flat index of a sample coordinate in `-1..=dims+1`
    #[inline]
    pub fn index(&self, x: i32, y: i32, z: i32) -> usize {
        let p = self.padded_dims();
        let (px, py) = (p.x as usize, p.y as usize);
        (x + 1) as usize + (y + 1) as usize * px + (z + 1) as usize * px * py
    }

    /// Sample coordinate of a flat index
    pub fn coord_of(&self, index: usize) -> IVec3 {
        let p = self.padded_dims();
        let (px, py) = (p.x as usize, p.y as usize);
        IVec3::new(
            (index % px) as i32 - 1,
            ((index / px) % py) as i32 - 1,
            (index / (px * py)) as i32 - 1,
        )
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32, z: i32) -> f32 {
        self.values[self.index(x, y, z)]
    }

    /// Write a density, clamped to [-1, 1]
    ///
    /// Returns whether the stored value changed.
    pub fn set(&mut self, x: i32, y: i32, z: i32, value: f32) -> bool {
        let i = self.index(x, y, z);
        self.write(i, value)
    }

    pub fn set_sample(&mut self, x: i32, y: i32, z: i32, sample: DensitySample) -> bool {
        let i = self.index(x, y, z);
        self.materials[i] = sample.material;
        self.write(i, sample.density)
    }

    fn write(&mut self, index: usize, value: f32) -> bool {
        let (value, anomalous) = sanitize(value);
        if anomalous {
            self.anomalies += 1;
        }
        let changed = self.values[index] != value;
        self.values[index] = value;
        changed
    }

    /// Raw samples in storage order
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Replace every sample from a flat buffer in storage order
    ///
    /// The buffer must be exactly [`len`](Self::len) long. Values are
    /// sanitized and clamped like any other write.
    pub fn copy_from(&mut self, values: &[f32], materials: Option<&[u8]>) -> bool {
        if values.len() != self.values.len() {
            return false;
        }
        for (i, &value) in values.iter().enumerate() {
            self.write(i, value);
        }
        if let Some(materials) = materials {
            if materials.len() == self.materials.len() {
                self.materials.copy_from_slice(materials);
            }
        }
        true
    }

    /// Non-finite writes since the last reset
    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    /// Statistics over the stored samples
    pub fn stats(&self) -> DensityStats {
        let mut stats = DensityStats::default();
        for &v in &self.values {
            stats.add(v);
        }
        stats
    }

    /// Evaluate the field at every sample, halo included
    pub fn fill(&mut self, field: &DensityField, origin: Vec3, voxel_size: f32) -> DensityStats {
        let mut stats = DensityStats::default();
        for i in 0..self.values.len() {
            let pos = origin + self.coord_of(i).as_vec3() * voxel_size;
            let sample = field.sample(pos);
            stats.add(sample.density);
            self.materials[i] = sample.material;
            self.write(i, sample.density);
        }
        stats
    }

    /// Parallel [`fill`](Self::fill) over Z slabs
    pub fn fill_parallel(&mut self, field: &DensityField, origin: Vec3, voxel_size: f32) -> DensityStats {
        let stats = sample_parallel(field, origin, voxel_size, self.dims, &mut self.values, &mut self.materials);
        self.anomalies += stats.non_finite;
        stats
    }
}

/// Evaluate `field` into flat sample buffers laid out like a grid of `dims`
///
/// Used for grids and for raw compute buffers alike. Both slices must hold
/// [`DensityGrid::sample_count_for`] entries.
pub fn sample_parallel(
    field: &DensityField,
    origin: Vec3,
    voxel_size: f32,
    dims: UVec3,
    values: &mut [f32],
    materials: &mut [u8],
) -> DensityStats {
    let p = DensityGrid::padded_dims_for(dims);
    let (px, py) = (p.x as usize, p.y as usize);
    let slab = px * py;

    values
        .par_chunks_mut(slab)
        .zip(materials.par_chunks_mut(slab))
        .enumerate()
        .map(|(z, (values, materials))| {
            let mut stats = DensityStats::default();
            for (i, (value, material)) in values.iter_mut().zip(materials.iter_mut()).enumerate() {
                let coord = IVec3::new((i % px) as i32 - 1, (i / px % py) as i32 - 1, z as i32 - 1);
                let sample = field.sample(origin + coord.as_vec3() * voxel_size);
                stats.add(sample.density);
                *material = sample.material;
                *value = sanitize(sample.density).0;
            }
            stats
        })
        .reduce(DensityStats::default, DensityStats::merge)
}

/// Central-difference gradients at every corner sample (`0..=dims`)
#[derive(Clone, Debug)]
pub struct GradientGrid {
    dims: UVec3,
    gradients: Vec<Vec3>,
}

impl GradientGrid {
    pub fn from_density(grid: &DensityGrid, voxel_size: f32) -> Self {
        let dims = grid.dims();
        let n = dims + UVec3::ONE;
        let inv = 1.0 / (2.0 * voxel_size);
        let mut gradients = Vec::with_capacity(n.x as usize * n.y as usize * n.z as usize);

        for z in 0..n.z as i32 {
            for y in 0..n.y as i32 {
                for x in 0..n.x as i32 {
                    gradients.push(Vec3::new(
                        grid.get(x + 1, y, z) - grid.get(x - 1, y, z),
                        grid.get(x, y + 1, z) - grid.get(x, y - 1, z),
                        grid.get(x, y, z + 1) - grid.get(x, y, z - 1),
                    ) * inv);
                }
            }
        }

        Self { dims, gradients }
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    /// Gradient at a corner sample in `0..=dims`
    #[inline]
    pub fn get(&self, x: i32, y: i32, z: i32) -> Vec3 {
        let n = self.dims + UVec3::ONE;
        let i = x as usize + y as usize * n.x as usize + z as usize * n.x as usize * n.y as usize;
        self.gradients[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerrainConfig;

    #[test]
    fn test_padded_layout() {
        let grid = DensityGrid::new(UVec3::new(4, 2, 3));
        assert_eq!(grid.padded_dims(), UVec3::new(7, 5, 6));
        assert_eq!(grid.len(), 7 * 5 * 6);
        assert_eq!(grid.index(-1, -1, -1), 0);
        assert_eq!(grid.index(5, 3, 4), grid.len() - 1);
        assert_eq!(grid.coord_of(grid.index(2, 1, 3)), IVec3::new(2, 1, 3));
        assert!(grid.contains(IVec3::new(-1, 3, 4)));
        assert!(!grid.contains(IVec3::new(6, 0, 0)));
    }

    #[test]
    fn test_writes_clamp() {
        let mut grid = DensityGrid::new(UVec3::splat(2));
        grid.set(0, 0, 0, 5.0);
        grid.set(1, 1, 1, -3.5);
        grid.set(2, 2, 2, 0.25);
        assert_eq!(grid.get(0, 0, 0), 1.0);
        assert_eq!(grid.get(1, 1, 1), -1.0);
        assert_eq!(grid.get(2, 2, 2), 0.25);
        assert_eq!(grid.anomalies(), 0);
    }

    #[test]
    fn test_non_finite_sanitized_and_counted() {
        let mut grid = DensityGrid::new(UVec3::splat(2));
        grid.set(0, 0, 0, f32::NAN);
        grid.set(1, 0, 0, f32::INFINITY);
        grid.set(2, 0, 0, f32::NEG_INFINITY);
        assert_eq!(grid.get(0, 0, 0), 1.0);
        assert_eq!(grid.get(1, 0, 0), 1.0);
        assert_eq!(grid.get(2, 0, 0), -1.0);
        assert_eq!(grid.anomalies(), 3);
        assert!(grid.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_stats_exclude_non_finite() {
        let mut stats = DensityStats::default();
        for v in [-0.5, 0.5, f32::NAN, 1.0, f32::NEG_INFINITY] {
            stats.add(v);
        }
        assert_eq!(stats.count, 3);
        assert_eq!(stats.non_finite, 2);
        assert_eq!(stats.solid, 1);
        assert!((stats.mean() - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_reuses_allocation() {
        let mut grid = DensityGrid::new(UVec3::splat(8));
        let capacity = grid.capacity();
        grid.set(1, 1, 1, -1.0);

        grid.reset(UVec3::splat(4));
        assert_eq!(grid.capacity(), capacity);
        assert_eq!(grid.get(1, 1, 1), 1.0);

        grid.reset(UVec3::splat(8));
        assert_eq!(grid.capacity(), capacity);
    }

    #[test]
    fn test_fill_matches_field() {
        let field = DensityField::from_config(&TerrainConfig::flat(20.0));
        let origin = Vec3::new(0.0, 16.0, 0.0);
        let mut serial = DensityGrid::new(UVec3::splat(8));
        let mut parallel = DensityGrid::new(UVec3::splat(8));

        serial.fill(&field, origin, 1.0);
        parallel.fill_parallel(&field, origin, 1.0);

        assert_eq!(serial.values(), parallel.values());
        assert_eq!(serial.get(0, 4, 0), 0.0);
        assert_eq!(serial.get(3, -1, 3), -1.0);
        assert_eq!(serial.get(3, 9, 3), 1.0);
    }

    #[test]
    fn test_gradient_points_to_empty_side() {
        let field = DensityField::from_config(&TerrainConfig::flat(20.0));
        let mut grid = DensityGrid::new(UVec3::splat(4));
        grid.fill(&field, Vec3::new(0.0, 18.0, 0.0), 0.5);

        let gradients = GradientGrid::from_density(&grid, 0.5);
        let g = gradients.get(2, 4, 2);
        assert!((g - Vec3::Y).length() < 1e-5, "gradient {g}");
    }
}
