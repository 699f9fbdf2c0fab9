//! Seam meshes between neighbouring chunks at different LODs
//!
//! The finer chunk owns the seam. It is a skirt: every triangle edge of the
//! fine surface lying on the shared face is extruded against the surface
//! normal, hiding the cracks left where the coarser neighbour samples the
//! same boundary at a lower rate.

use std::sync::Arc;

use glam::Vec3;

use super::surface::SurfaceMesh;
use crate::voxel::chunk::{ChunkCoord, Face};

/// Identifies one seam: the ordered (fine, coarse) pair of face neighbours
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionKey {
    pub fine: ChunkCoord,
    pub coarse: ChunkCoord,
}

impl TransitionKey {
    /// Face of the fine chunk shared with the coarse one
    pub fn face(&self) -> Option<Face> {
        self.fine.face_towards(self.coarse)
    }
}

/// Skirt geometry plus what it was built from
#[derive(Clone, Debug)]
pub struct TransitionMesh {
    pub key: TransitionKey,
    /// Positions are local to the fine chunk
    pub mesh: Arc<SurfaceMesh>,
    pub fine_lod: u32,
    pub coarse_lod: u32,
    pub fine_mesh_version: u64,
    pub coarse_mesh_version: u64,
}

impl TransitionMesh {
    #[cfg(test)]
    pub(crate) fn empty(key: TransitionKey) -> Self {
        Self {
            key,
            mesh: Arc::new(SurfaceMesh::new()),
            fine_lod: 0,
            coarse_lod: 0,
            fine_mesh_version: 0,
            coarse_mesh_version: 0,
        }
    }

    /// Built from exactly these LODs and mesh versions
    pub fn is_current(&self, fine_lod: u32, coarse_lod: u32, fine_version: u64, coarse_version: u64) -> bool {
        self.fine_lod == fine_lod
            && self.coarse_lod == coarse_lod
            && self.fine_mesh_version == fine_version
            && self.coarse_mesh_version == coarse_version
    }
}

fn plane_offset(face: Face, extent: Vec3) -> f32 {
    if face.is_positive() { extent[face.axis()] } else { 0.0 }
}

/// Directed triangle edges of `surface` lying on `face` of a chunk of size `extent`
pub fn boundary_segments(surface: &SurfaceMesh, face: Face, extent: Vec3) -> Vec<[u32; 2]> {
    let axis = face.axis();
    let plane = plane_offset(face, extent);
    let tolerance = extent[axis] * 1e-5;
    let on_plane = |i: u32| (surface.vertices[i as usize][axis] - plane).abs() <= tolerance;

    let mut segments = Vec::new();
    for tri in surface.indices.chunks_exact(3) {
        for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            if on_plane(a) && on_plane(b) {
                segments.push([a, b]);
            }
        }
    }
    segments
}

/// Extrude the boundary contour on `face` by `depth` against the surface normals
///
/// Quads are wound to face out of the chunk through `face`.
pub fn build_skirt(surface: &SurfaceMesh, face: Face, extent: Vec3, depth: f32) -> SurfaceMesh {
    let segments = boundary_segments(surface, face, extent);
    let outward = face.offset().as_vec3();
    let mut skirt = SurfaceMesh::with_capacity(segments.len() * 4);

    for [a, b] in segments {
        let (pa, pb) = (surface.vertices[a as usize], surface.vertices[b as usize]);
        let (na, nb) = (surface.normals[a as usize], surface.normals[b as usize]);

        let top_a = skirt.push_vertex(pa, na);
        let top_b = skirt.push_vertex(pb, nb);
        let low_a = skirt.push_vertex(pa - na * depth, na);
        let low_b = skirt.push_vertex(pb - nb * depth, nb);

        let facing = (pa - na * depth - pa).cross(pb - pa);
        if facing.dot(outward) >= 0.0 {
            skirt.push_triangle(top_a, low_a, top_b);
            skirt.push_triangle(top_b, low_a, low_b);
        } else {
            skirt.push_triangle(top_a, top_b, low_a);
            skirt.push_triangle(top_b, low_b, low_a);
        }
    }

    skirt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::marching_cubes::{mesh_grid, ExtractLimits};
    use crate::voxel::grid::DensityGrid;
    use glam::UVec3;

    /// Horizontal plane at y = 4.5 across an 8-cell chunk
    fn flat_surface() -> SurfaceMesh {
        let mut grid = DensityGrid::new(UVec3::splat(8));
        for i in 0..grid.len() {
            let p = grid.coord_of(i);
            grid.set(p.x, p.y, p.z, p.y as f32 - 4.5);
        }
        mesh_grid(&grid, 0.0, 1.0, ExtractLimits::default())
    }

    #[test]
    fn test_boundary_segments_on_each_side_face() {
        let surface = flat_surface();
        let extent = Vec3::splat(8.0);
        for face in [Face::PosX, Face::NegX, Face::PosZ, Face::NegZ] {
            assert_eq!(boundary_segments(&surface, face, extent).len(), 8, "{face:?}");
        }
        assert!(boundary_segments(&surface, Face::PosY, extent).is_empty());
    }

    #[test]
    fn test_skirt_extrudes_against_normal() {
        let surface = flat_surface();
        let skirt = build_skirt(&surface, Face::PosX, Vec3::splat(8.0), 2.0);

        assert_eq!(skirt.triangle_count(), 16);
        for v in &skirt.vertices {
            assert!((v.x - 8.0).abs() < 1e-5);
            assert!((v.y - 4.5).abs() < 1e-5 || (v.y - 2.5).abs() < 1e-5, "vertex {v}");
        }
        for t in 0..skirt.triangle_count() {
            let [a, b, c] = skirt.triangle(t);
            assert!((b - a).cross(c - a).dot(Vec3::X) > 0.0);
        }
    }

    #[test]
    fn test_key_face() {
        let key = TransitionKey { fine: ChunkCoord::new(0, 0, 0), coarse: ChunkCoord::new(0, 0, -1) };
        assert_eq!(key.face(), Some(Face::NegZ));

        let mesh = TransitionMesh::empty(key);
        assert!(mesh.mesh.is_empty());
        assert!(mesh.is_current(0, 0, 0, 0));
        assert!(!mesh.is_current(0, 1, 0, 0));
    }
}
