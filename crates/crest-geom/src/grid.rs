//! Density grids exchanged between cluster heads.
//!
//! A grid is a square, row-major raster of KDE values in the cluster
//! head's local frame: cell (i, j) samples the density at
//! `(scale * j - offset, scale * i - offset)` with `offset = scale * size / 2`,
//! so columns map to x and rows to y.

use serde::{Deserialize, Serialize};

use crate::{Bandwidth, Kde2d, KdeError, Vec3};

/// Fixed bandwidth used for member density surfaces.
///
/// Members cluster within radio range; a tight isotropic kernel keeps
/// individual vehicles visible as distinct mass above the cell threshold.
const MEMBER_BANDWIDTH: [f32; 4] = [0.1, 0.0, 0.0, 0.1];

/// A square raster of density values around a cluster head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityGrid {
    size: usize,
    scale: f32,
    cells: Vec<f32>,
}

impl DensityGrid {
    /// Build the density surface for a cluster from CH-relative member
    /// offsets. The CH itself is expected to be included as `(0, 0)`.
    ///
    /// A lone CH has no estimable spread; its grid is a single unit spike
    /// at the center cell.
    pub fn from_members(offsets: &[[f32; 2]], size: usize, scale: f32) -> Result<Self, KdeError> {
        let mut cells = vec![0.0f32; size * size];
        let offset = scale * (size / 2) as f32;

        if offsets.len() > 1 {
            let kde = Kde2d::new(offsets.to_vec(), Bandwidth::Explicit(MEMBER_BANDWIDTH))?;
            for i in 0..size {
                for j in 0..size {
                    let point = [scale * j as f32 - offset, scale * i as f32 - offset];
                    cells[size * i + j] = kde.eval(point);
                }
            }
        } else {
            for i in 0..size {
                for j in 0..size {
                    let center =
                        scale * i as f32 - offset == 0.0 && scale * j as f32 - offset == 0.0;
                    cells[size * i + j] = if center { 1.0 } else { 0.0 };
                }
            }
        }

        Ok(Self { size, scale, cells })
    }

    /// Reassemble a grid received off the wire.
    pub fn from_cells(cells: Vec<f32>, size: usize, scale: f32) -> Self {
        debug_assert_eq!(cells.len(), size * size);
        Self { size, scale, cells }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// World position of cell (i, j) for a grid centered at `base`.
    pub fn world_cell(&self, base: Vec3, i: usize, j: usize) -> Vec3 {
        let half = (self.size / 2) as f64;
        let scale = self.scale as f64;
        Vec3::new(
            (j as f64 - half) * scale + base.x,
            (i as f64 - half) * scale + base.y,
            0.0,
        )
    }

    /// Cells whose value exceeds `threshold`, as `(i, j, value)`.
    pub fn dense_cells(&self, threshold: f32) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        let size = self.size;
        self.cells
            .iter()
            .enumerate()
            .filter(move |(_, &v)| v > threshold)
            .map(move |(idx, &v)| (idx / size, idx % size, v))
    }
}
