//! In-memory record of every accepted edit
//!
//! Regenerated chunks (LOD change, config reload, reload after unloading)
//! start from the procedural field again, so the ops touching them are
//! replayed in their original order once generation lands. Nothing is
//! written to disk.
//!
//! Ops are bucketed into a sparse grid of cubic cells, so a replay only looks
//! at ops recorded near the chunk instead of the whole history.

use std::collections::{BTreeSet, HashMap};

use glam::{IVec3, Vec3};

use crate::math::Aabb;
use crate::voxel::chunk::Chunk;
use super::brush::EditOp;

/// Edge length of the index cells in world units
pub const DEFAULT_INDEX_CELL: f32 = 32.0;

/// Footprints covering more cells than this skip the index
const MAX_INDEXED_CELLS: f64 = 4096.0;

#[derive(Clone, Debug)]
pub struct EditJournal {
    ops: Vec<EditOp>,
    cell_size: f32,
    /// Op indices per cell, ascending
    cells: HashMap<IVec3, Vec<usize>>,
    /// Ops too large to bucket; checked by every query
    wide: Vec<usize>,
}

impl Default for EditJournal {
    fn default() -> Self {
        Self::with_cell_size(DEFAULT_INDEX_CELL)
    }
}

impl EditJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cell_size(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 { cell_size } else { DEFAULT_INDEX_CELL };
        Self {
            ops: Vec::new(),
            cell_size,
            cells: HashMap::new(),
            wide: Vec::new(),
        }
    }

    /// Append an op; invalid ops change nothing and are not kept
    pub fn record(&mut self, op: EditOp) {
        if !op.is_valid() {
            return;
        }
        let index = self.ops.len();
        self.ops.push(op);

        match self.cell_range(&op.bounds()) {
            Some((lo, hi)) => {
                for z in lo.z..=hi.z {
                    for y in lo.y..=hi.y {
                        for x in lo.x..=hi.x {
                            self.cells.entry(IVec3::new(x, y, z)).or_default().push(index);
                        }
                    }
                }
            }
            None => self.wide.push(index),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Inclusive cell range covering `region`, `None` when it is too large
    fn cell_range(&self, region: &Aabb) -> Option<(IVec3, IVec3)> {
        let lo = (region.min / self.cell_size).floor();
        let hi = (region.max / self.cell_size).floor();
        let limit = Vec3::splat(i32::MAX as f32 * 0.5);
        if !lo.is_finite() || !hi.is_finite() || lo.abs().cmpgt(limit).any() || hi.abs().cmpgt(limit).any() {
            return None;
        }
        let span = (hi - lo + Vec3::ONE).max(Vec3::ZERO);
        let cells = span.x as f64 * span.y as f64 * span.z as f64;
        (cells <= MAX_INDEXED_CELLS).then(|| (lo.as_ivec3(), hi.as_ivec3()))
    }

    /// Ops whose footprint reaches `region`, oldest first
    pub fn touching<'a>(&'a self, region: &'a Aabb) -> impl Iterator<Item = &'a EditOp> + 'a {
        let candidates: BTreeSet<usize> = match self.cell_range(region) {
            Some((lo, hi)) => {
                let mut found: BTreeSet<usize> = self.wide.iter().copied().collect();
                for z in lo.z..=hi.z {
                    for y in lo.y..=hi.y {
                        for x in lo.x..=hi.x {
                            if let Some(indices) = self.cells.get(&IVec3::new(x, y, z)) {
                                found.extend(indices.iter().copied());
                            }
                        }
                    }
                }
                found
            }
            None => (0..self.ops.len()).collect(),
        };
        candidates
            .into_iter()
            .filter_map(move |i| self.ops.get(i))
            .filter(move |op| op.bounds().intersects(region))
    }

    /// Re-apply every op touching a freshly generated chunk
    ///
    /// Returns the number of ops that changed at least one sample.
    pub fn replay(&self, chunk: &mut Chunk) -> usize {
        let region = chunk.padded_bounds();
        let (origin, voxel_size) = (chunk.origin, chunk.voxel_size);
        let mut applied = 0;
        for op in self.touching(&region) {
            if op.apply(&mut chunk.grid, origin, voxel_size) > 0 {
                applied += 1;
            }
        }
        applied
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.cells.clear();
        self.wide.clear();
    }
}
