//! Uniform hash grid for observable position lookups.
//!
//! Maintains a persistent cell map that is updated incrementally as
//! observables register, move, and unregister, rather than being rebuilt
//! per query.

use std::collections::HashMap;

use glam::Vec3;

use crate::params::ObservableId;

/// Uniform 3D hash grid mapping world positions to observable handles.
///
/// Sphere queries return every handle stored in a cell touching the
/// query sphere's bounding box; callers do their own exact distance
/// filtering (the PVS filter re-checks range anyway).
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell_size: f32,
    cells: HashMap<(i32, i32, i32), Vec<ObservableId>>,
}

impl SpatialGrid {
    /// Create an empty grid. `cell_size` should roughly match typical
    /// query radii; it must be positive.
    pub fn new(cell_size: f32) -> Self {
        debug_assert!(cell_size > 0.0, "cell size must be positive: {}", cell_size);
        Self {
            cell_size,
            cells: HashMap::new(),
        }
    }

    #[inline]
    fn cell_key(&self, pos: Vec3) -> (i32, i32, i32) {
        (
            (pos.x / self.cell_size).floor() as i32,
            (pos.y / self.cell_size).floor() as i32,
            (pos.z / self.cell_size).floor() as i32,
        )
    }

    /// Insert a handle at a position.
    pub fn insert(&mut self, pos: Vec3, id: ObservableId) {
        self.cells.entry(self.cell_key(pos)).or_default().push(id);
    }

    /// Remove a handle previously inserted at `pos`. No-op if absent.
    pub fn erase(&mut self, pos: Vec3, id: ObservableId) {
        let key = self.cell_key(pos);
        if let Some(ids) = self.cells.get_mut(&key) {
            ids.retain(|&stored| stored != id);
            if ids.is_empty() {
                self.cells.remove(&key);
            }
        }
    }

    /// Relocate a handle. Cheap no-op when both positions hash to the
    /// same cell.
    pub fn move_entry(&mut self, old_pos: Vec3, new_pos: Vec3, id: ObservableId) {
        if self.cell_key(old_pos) == self.cell_key(new_pos) {
            return;
        }
        self.erase(old_pos, id);
        self.insert(new_pos, id);
    }

    /// Collect all handles in cells touching the sphere into `buf`.
    /// Clears `buf` first - no allocation when capacity suffices.
    pub fn query_sphere_into(&self, center: Vec3, radius: f32, buf: &mut Vec<ObservableId>) {
        buf.clear();
        let r = (radius / self.cell_size).ceil() as i32;
        let (cx, cy, cz) = self.cell_key(center);
        for ix in (cx - r)..=(cx + r) {
            for iy in (cy - r)..=(cy + r) {
                for iz in (cz - r)..=(cz + r) {
                    if let Some(ids) = self.cells.get(&(ix, iy, iz)) {
                        buf.extend_from_slice(ids);
                    }
                }
            }
        }
    }

    /// Total number of stored handles.
    pub fn len(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    /// Whether the grid holds no handles.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
