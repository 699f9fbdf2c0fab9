//! Spherical density brush
//!
//! The brush subtracts from density, so positive strength adds material and
//! negative strength carves it away. The change falls off linearly from the
//! full strength at the centre to zero at the radius.

use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::math::Aabb;
use crate::voxel::grid::DensityGrid;

/// One localized density edit
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditOp {
    pub center: Vec3,
    pub radius: f32,
    pub strength: f32,
}

impl EditOp {
    pub fn new(center: Vec3, radius: f32, strength: f32) -> Self {
        Self { center, radius, strength }
    }

    /// Finite centre and strength with a positive radius
    pub fn is_valid(&self) -> bool {
        self.center.is_finite() && self.strength.is_finite() && self.radius.is_finite() && self.radius > 0.0
    }

    /// Box around the brush sphere
    pub fn bounds(&self) -> Aabb {
        Aabb::around_sphere(self.center, self.radius)
    }

    /// Density subtracted at `distance` from the centre, zero outside the radius
    pub fn falloff(&self, distance: f32) -> f32 {
        if distance > self.radius {
            return 0.0;
        }
        self.strength * (1.0 - distance / self.radius)
    }

    /// Apply to every sample of `grid` inside the brush, halo included
    ///
    /// `origin` is the world position of sample (0, 0, 0). Returns the number
    /// of samples whose stored value changed.
    pub fn apply(&self, grid: &mut DensityGrid, origin: Vec3, voxel_size: f32) -> usize {
        if !self.is_valid() {
            return 0;
        }

        let last = grid.dims().as_ivec3() + IVec3::ONE;
        let lo = ((self.center - self.radius - origin) / voxel_size).floor().as_ivec3().max(IVec3::NEG_ONE);
        let hi = ((self.center + self.radius - origin) / voxel_size).ceil().as_ivec3().min(last);
        let r2 = self.radius * self.radius;
        let mut changed = 0;

        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    let pos = origin + IVec3::new(x, y, z).as_vec3() * voxel_size;
                    let d2 = pos.distance_squared(self.center);
                    if d2 > r2 {
                        continue;
                    }
                    let delta = self.falloff(d2.sqrt());
                    if grid.set(x, y, z, grid.get(x, y, z) - delta) {
                        changed += 1;
                    }
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;

    /// Flat ground at y = 4 in an 8-cell grid with unit voxels
    fn ground() -> DensityGrid {
        let mut grid = DensityGrid::new(UVec3::splat(8));
        for i in 0..grid.len() {
            let p = grid.coord_of(i);
            grid.set(p.x, p.y, p.z, (p.y as f32 - 4.0).clamp(-1.0, 1.0));
        }
        grid
    }

    #[test]
    fn test_falloff() {
        let op = EditOp::new(Vec3::ZERO, 2.0, 1.0);
        assert_eq!(op.falloff(0.0), 1.0);
        assert_eq!(op.falloff(1.0), 0.5);
        assert_eq!(op.falloff(2.0), 0.0);
        assert_eq!(op.falloff(2.5), 0.0);
    }

    #[test]
    fn test_edit_is_local() {
        let mut grid = ground();
        let before = grid.clone();
        let op = EditOp::new(Vec3::new(4.0, 4.0, 4.0), 2.0, 0.8);
        let changed = op.apply(&mut grid, Vec3::ZERO, 1.0);
        assert!(changed > 0);

        for i in 0..grid.len() {
            let p = grid.coord_of(i);
            let d = p.as_vec3().distance(op.center);
            if d >= 2.0 {
                assert_eq!(grid.values()[i], before.values()[i], "sample {p} at distance {d}");
            }
        }
        // Centre sample lost the full strength
        assert!((grid.get(4, 4, 4) - (before.get(4, 4, 4) - 0.8)).abs() < 1e-6);
    }

    #[test]
    fn test_results_stay_clamped() {
        let mut grid = ground();
        EditOp::new(Vec3::new(4.0, 2.0, 4.0), 3.0, -10.0).apply(&mut grid, Vec3::ZERO, 1.0);
        EditOp::new(Vec3::new(4.0, 6.0, 4.0), 3.0, 10.0).apply(&mut grid, Vec3::ZERO, 1.0);
        assert!(grid.values().iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(grid.get(4, 2, 4), 1.0);
        assert_eq!(grid.get(4, 6, 4), -1.0);
    }

    #[test]
    fn test_reaches_halo_and_ignores_outside() {
        let mut grid = ground();
        // Centred on the halo sample beyond the +x face
        let op = EditOp::new(Vec3::new(9.0, 4.0, 4.0), 0.5, 0.5);
        assert_eq!(op.apply(&mut grid, Vec3::ZERO, 1.0), 1);

        let outside = EditOp::new(Vec3::new(40.0, 3.0, 4.0), 2.0, 0.5);
        assert_eq!(outside.apply(&mut grid, Vec3::ZERO, 1.0), 0);
        assert_eq!(EditOp::new(Vec3::ZERO, 0.0, 1.0).apply(&mut grid, Vec3::ZERO, 1.0), 0);
    }
}
