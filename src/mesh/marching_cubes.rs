//! Marching cubes surface extraction
//!
//! Each cell is triangulated on its own. Crossing vertices are shared between
//! the triangles of one cell but never across cells, so neighbouring cells
//! emit duplicate vertices along shared edges. Those duplicates are
//! bit-identical: edge endpoints are always interpolated from the lower grid
//! corner to the higher one.

use std::sync::Mutex;

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use super::surface::SurfaceMesh;
use super::tables::{CORNER_OFFSETS, EDGE_CORNERS, EDGE_MASK, TRIANGLES};
use crate::core::logging::WarnOnce;
use crate::voxel::grid::{DensityGrid, GradientGrid};

/// Densities closer than this are treated as equal when interpolating
const FLAT_EDGE_EPSILON: f32 = 1e-6;

static VERTEX_CAP_REACHED: WarnOnce = WarnOnce::new();

/// Output bounds for one extraction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtractLimits {
    pub max_vertices: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self { max_vertices: 1_048_576 }
    }
}

/// Geometry of a single cell before it is appended to a mesh
struct CellGeometry {
    positions: [Vec3; 12],
    normals: [Vec3; 12],
    /// Local vertex slot per cube edge, `u8::MAX` when unused
    edge_slot: [u8; 12],
    vertex_count: usize,
    triangles: [[u8; 3]; 5],
    triangle_count: usize,
}

fn corner_rank(corner: usize) -> i32 {
    let o = CORNER_OFFSETS[corner];
    o[0] + o[1] * 2 + o[2] * 4
}

fn polygonize(
    grid: &DensityGrid,
    gradients: &GradientGrid,
    iso_level: f32,
    voxel_size: f32,
    cell: IVec3,
) -> Option<CellGeometry> {
    let mut density = [0.0f32; 8];
    let mut mask = 0usize;
    for (i, o) in CORNER_OFFSETS.iter().enumerate() {
        density[i] = grid.get(cell.x + o[0], cell.y + o[1], cell.z + o[2]);
        if density[i] < iso_level {
            mask |= 1 << i;
        }
    }

    let edges = EDGE_MASK[mask];
    if edges == 0 {
        return None;
    }

    let mut geometry = CellGeometry {
        positions: [Vec3::ZERO; 12],
        normals: [Vec3::ZERO; 12],
        edge_slot: [u8::MAX; 12],
        vertex_count: 0,
        triangles: [[0; 3]; 5],
        triangle_count: 0,
    };

    for (edge, corners) in EDGE_CORNERS.iter().enumerate() {
        if edges & (1 << edge) == 0 {
            continue;
        }

        let (a, b) = if corner_rank(corners[0]) <= corner_rank(corners[1]) {
            (corners[0], corners[1])
        } else {
            (corners[1], corners[0])
        };
        let pa = cell + IVec3::from_array(CORNER_OFFSETS[a]);
        let pb = cell + IVec3::from_array(CORNER_OFFSETS[b]);
        let (da, db) = (density[a], density[b]);

        let t = if (db - da).abs() < FLAT_EDGE_EPSILON {
            0.5
        } else {
            ((iso_level - da) / (db - da)).clamp(0.0, 1.0)
        };

        let position_a = pa.as_vec3() * voxel_size;
        let position_b = pb.as_vec3() * voxel_size;
        let position = position_a + (position_b - position_a) * t;

        let ga = gradients.get(pa.x, pa.y, pa.z);
        let gb = gradients.get(pb.x, pb.y, pb.z);
        let normal = (ga + (gb - ga) * t).try_normalize().unwrap_or(Vec3::Y);

        let slot = geometry.vertex_count;
        geometry.positions[slot] = position;
        geometry.normals[slot] = normal;
        geometry.edge_slot[edge] = slot as u8;
        geometry.vertex_count += 1;
    }

    let row = &TRIANGLES[mask];
    let mut i = 0;
    while i + 2 < row.len() && row[i] != -1 {
        let v0 = geometry.edge_slot[row[i] as usize];
        let v1 = geometry.edge_slot[row[i + 1] as usize];
        let v2 = geometry.edge_slot[row[i + 2] as usize];
        // The table winds towards the solid side; flip to face the empty side
        geometry.triangles[geometry.triangle_count] = [v0, v2, v1];
        geometry.triangle_count += 1;
        i += 3;
    }

    Some(geometry)
}

/// Append one cell; returns false when the vertex cap would be exceeded
fn append_cell(mesh: &mut SurfaceMesh, cell: &CellGeometry, max_vertices: usize) -> bool {
    if mesh.vertices.len() + cell.vertex_count > max_vertices {
        mesh.truncated = true;
        return false;
    }
    let base = mesh.vertices.len() as u32;
    for slot in 0..cell.vertex_count {
        mesh.push_vertex(cell.positions[slot], cell.normals[slot]);
    }
    for tri in &cell.triangles[..cell.triangle_count] {
        mesh.push_triangle(base + tri[0] as u32, base + tri[1] as u32, base + tri[2] as u32);
    }
    true
}

fn warn_truncated(mesh: &SurfaceMesh, limits: ExtractLimits) {
    if mesh.truncated {
        crate::warn_once!(
            VERTEX_CAP_REACHED,
            "Surface exceeded {} vertices, dropping the remaining triangles",
            limits.max_vertices
        );
    }
}

/// Extract the iso-surface of a grid in chunk-local coordinates
pub fn extract(
    grid: &DensityGrid,
    gradients: &GradientGrid,
    iso_level: f32,
    voxel_size: f32,
    limits: ExtractLimits,
) -> SurfaceMesh {
    let dims = grid.dims().as_ivec3();
    let mut mesh = SurfaceMesh::new();

    for z in 0..dims.z {
        for y in 0..dims.y {
            for x in 0..dims.x {
                if let Some(cell) = polygonize(grid, gradients, iso_level, voxel_size, IVec3::new(x, y, z)) {
                    append_cell(&mut mesh, &cell, limits.max_vertices);
                }
            }
        }
    }

    warn_truncated(&mesh, limits);
    mesh
}

/// Extract Z slabs concurrently into one shared output
///
/// Slabs are appended in completion order, so vertex and triangle order vary
/// from run to run. The set of triangles does not.
pub fn extract_parallel(
    grid: &DensityGrid,
    gradients: &GradientGrid,
    iso_level: f32,
    voxel_size: f32,
    limits: ExtractLimits,
) -> SurfaceMesh {
    let dims = grid.dims().as_ivec3();
    let output = Mutex::new(SurfaceMesh::new());

    (0..dims.z).into_par_iter().for_each(|z| {
        let mut cells = Vec::new();
        for y in 0..dims.y {
            for x in 0..dims.x {
                if let Some(cell) = polygonize(grid, gradients, iso_level, voxel_size, IVec3::new(x, y, z)) {
                    cells.push(cell);
                }
            }
        }
        if cells.is_empty() {
            return;
        }

        let mut mesh = match output.lock() {
            Ok(mesh) => mesh,
            Err(poisoned) => poisoned.into_inner(),
        };
        for cell in &cells {
            append_cell(&mut mesh, cell, limits.max_vertices);
        }
    });

    let mesh = match output.into_inner() {
        Ok(mesh) => mesh,
        Err(poisoned) => poisoned.into_inner(),
    };
    warn_truncated(&mesh, limits);
    mesh
}

/// Compute gradients and extract in one step
pub fn mesh_grid(grid: &DensityGrid, iso_level: f32, voxel_size: f32, limits: ExtractLimits) -> SurfaceMesh {
    let gradients = GradientGrid::from_density(grid, voxel_size);
    extract(grid, &gradients, iso_level, voxel_size, limits)
}
