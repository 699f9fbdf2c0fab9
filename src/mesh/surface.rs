//! Triangle surfaces produced by extraction

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::math::Aabb;

/// Interleaved vertex layout used for buffer uploads and readbacks
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

/// Indexed triangle mesh in chunk-local coordinates
///
/// Triangles are wound counter-clockwise seen from the empty side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SurfaceMesh {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub indices: Vec<u32>,
    /// Geometry was dropped to stay under the vertex cap
    pub truncated: bool,
}

impl SurfaceMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(vertices: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertices),
            normals: Vec::with_capacity(vertices),
            indices: Vec::with_capacity(vertices),
            truncated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Add a vertex and return its index
    pub fn push_vertex(&mut self, position: Vec3, normal: Vec3) -> u32 {
        let index = self.vertices.len() as u32;
        self.vertices.push(position);
        self.normals.push(normal);
        index
    }

    pub fn push_triangle(&mut self, a: u32, b: u32, c: u32) {
        self.indices.extend_from_slice(&[a, b, c]);
    }

    /// Append another mesh, rebasing its indices
    pub fn append(&mut self, other: &SurfaceMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.normals.extend_from_slice(&other.normals);
        self.indices.extend(other.indices.iter().map(|i| i + base));
        self.truncated |= other.truncated;
    }

    pub fn triangle(&self, index: usize) -> [Vec3; 3] {
        let t = &self.indices[index * 3..index * 3 + 3];
        [
            self.vertices[t[0] as usize],
            self.vertices[t[1] as usize],
            self.vertices[t[2] as usize],
        ]
    }

    pub fn bounds(&self) -> Option<Aabb> {
        let first = *self.vertices.first()?;
        let mut bounds = Aabb::new(first, first);
        for v in &self.vertices[1..] {
            bounds.min = bounds.min.min(*v);
            bounds.max = bounds.max.max(*v);
        }
        Some(bounds)
    }

    /// Interleave positions and normals for upload
    pub fn interleaved(&self) -> Vec<MeshVertex> {
        self.vertices
            .iter()
            .zip(&self.normals)
            .map(|(p, n)| MeshVertex { position: p.to_array(), normal: n.to_array() })
            .collect()
    }

    /// Rebuild from an interleaved vertex buffer and an index buffer
    pub fn from_interleaved(vertices: &[MeshVertex], indices: &[u32]) -> Self {
        Self {
            vertices: vertices.iter().map(|v| Vec3::from_array(v.position)).collect(),
            normals: vertices.iter().map(|v| Vec3::from_array(v.normal)).collect(),
            indices: indices.to_vec(),
            truncated: false,
        }
    }
}
