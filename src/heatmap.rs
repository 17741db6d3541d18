//! Decaying occupancy heatmap at frame resolution.

use serde::Serialize;

use crate::geometry::Point;

pub const DEFAULT_DECAY: f32 = 0.995;
pub const DEFAULT_RADIUS: u32 = 20;

#[derive(Clone, Debug)]
pub struct Heatmap {
    width: u32,
    height: u32,
    cells: Vec<f32>,
    decay: f32,
    /// Precomputed gaussian splat: (dx, dy, weight) for every offset within the radius.
    kernel: Vec<(i32, i32, f32)>,
}

/// Coarse max-pooled view of the heatmap.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeatmapGrid {
    pub cols: u32,
    pub rows: u32,
    pub max: f32,
    pub cells: Vec<Vec<f32>>,
}

impl Heatmap {
    pub fn new(width: u32, height: u32, decay: f32, radius: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![0.0; width as usize * height as usize],
            decay,
            kernel: gaussian_kernel(radius),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Match a new frame size. Accumulated heat is discarded when the size changes.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if width == self.width && height == self.height {
            return false;
        }
        self.width = width;
        self.height = height;
        self.cells = vec![0.0; width as usize * height as usize];
        true
    }

    /// Multiply every cell by the decay factor.
    pub fn decay(&mut self) {
        let d = self.decay;
        self.cells.iter_mut().for_each(|c| *c *= d);
    }

    /// Add a gaussian blob at `center`. Centers outside the frame are ignored.
    pub fn splat(&mut self, center: Point, intensity: f32) {
        let cx = center.x.round();
        let cy = center.y.round();
        if cx < 0.0 || cy < 0.0 || cx >= f64::from(self.width) || cy >= f64::from(self.height) {
            return;
        }
        let (cx, cy) = (cx as i64, cy as i64);
        let (w, h) = (i64::from(self.width), i64::from(self.height));
        for &(dx, dy, weight) in &self.kernel {
            let x = cx + i64::from(dx);
            let y = cy + i64::from(dy);
            if x < 0 || y < 0 || x >= w || y >= h {
                continue;
            }
            self.cells[(y * w + x) as usize] += intensity * weight;
        }
    }

    /// One update cycle: decay once, then splat every position.
    pub fn update<'a>(&mut self, centers: impl IntoIterator<Item = &'a Point>) {
        self.decay();
        for c in centers {
            self.splat(*c, 1.0);
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.cells
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn max(&self) -> f32 {
        self.cells.iter().copied().fold(0.0, f32::max)
    }

    pub fn total(&self) -> f64 {
        self.cells.iter().map(|c| f64::from(*c)).sum()
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub fn downsample(&self, cols: u32, rows: u32) -> HeatmapGrid {
        let cols = cols.clamp(1, self.width.max(1));
        let rows = rows.clamp(1, self.height.max(1));
        let mut cells = vec![vec![0.0f32; cols as usize]; rows as usize];
        if self.width > 0 && self.height > 0 {
            for y in 0..self.height {
                let r = (u64::from(y) * u64::from(rows) / u64::from(self.height)) as usize;
                for x in 0..self.width {
                    let c = (u64::from(x) * u64::from(cols) / u64::from(self.width)) as usize;
                    let v = self.cells[y as usize * self.width as usize + x as usize];
                    if v > cells[r][c] {
                        cells[r][c] = v;
                    }
                }
            }
        }
        HeatmapGrid {
            cols,
            rows,
            max: self.max(),
            cells,
        }
    }
}

fn gaussian_kernel(radius: u32) -> Vec<(i32, i32, f32)> {
    let r = radius as i32;
    let sigma = (radius.max(1) as f64) / 3.0;
    let mut kernel = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            let d2 = f64::from(dx * dx + dy * dy);
            if d2.sqrt() <= f64::from(radius) {
                kernel.push((dx, dy, (-d2 / (2.0 * sigma * sigma)).exp() as f32));
            }
        }
    }
    kernel
}
