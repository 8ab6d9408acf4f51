use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use sonar_capture::ScreenRegion;
use sonar_state::ScreenPoint;
use std::path::Path;
use tracing::info;

/// Traversal class of one overlay cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Terrain {
    Road = 1,
    Open = 2,
    Water = 3,
    Blocked = 255,
}

impl Terrain {
    /// Step cost of entering a cell of this class
    pub const fn cost(self) -> u8 {
        self as u8
    }

    pub const fn is_passable(self) -> bool {
        !matches!(self, Terrain::Blocked)
    }
}

/// Row/column address into a cost grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridCell {
    pub row: usize,
    pub col: usize,
}

impl GridCell {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn manhattan(&self, other: &GridCell) -> usize {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col)
    }

    pub fn chebyshev(&self, other: &GridCell) -> usize {
        self.row.abs_diff(other.row).max(self.col.abs_diff(other.col))
    }
}

/// Immutable raster of terrain classes, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CostGrid {
    width: usize,
    height: usize,
    cells: Vec<Terrain>,
}

impl CostGrid {
    /// Grid where every cell has the same class
    pub fn filled(width: usize, height: usize, terrain: Terrain) -> Self {
        Self {
            width,
            height,
            cells: vec![terrain; width * height],
        }
    }

    /// Build a grid by classifying each cell with `f(row, col)`
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> Terrain) -> Self {
        let mut cells = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                cells.push(f(row, col));
            }
        }
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn contains(&self, cell: GridCell) -> bool {
        cell.row < self.height && cell.col < self.width
    }

    pub fn get(&self, cell: GridCell) -> Option<Terrain> {
        if self.contains(cell) {
            Some(self.cells[self.index(cell)])
        } else {
            None
        }
    }

    pub(crate) fn index(&self, cell: GridCell) -> usize {
        cell.row * self.width + cell.col
    }

    pub(crate) fn cell_at(&self, index: usize) -> GridCell {
        GridCell::new(index / self.width, index % self.width)
    }

    /// Cells per class, in Road, Open, Water, Blocked order
    pub fn histogram(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for t in &self.cells {
            let slot = match t {
                Terrain::Road => 0,
                Terrain::Open => 1,
                Terrain::Water => 2,
                Terrain::Blocked => 3,
            };
            counts[slot] += 1;
        }
        counts
    }
}

/// Reference colors painted into the terrain overlay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainPalette {
    pub road: Rgb<u8>,
    pub water: Rgb<u8>,
    pub blocked: Rgb<u8>,
    /// Per-channel tolerance; 0 means exact match
    pub tolerance: u8,
}

impl Default for TerrainPalette {
    fn default() -> Self {
        Self {
            road: Rgb([150, 75, 0]),
            water: Rgb([0, 0, 255]),
            blocked: Rgb([255, 0, 0]),
            tolerance: 0,
        }
    }
}

impl TerrainPalette {
    fn matches(&self, px: &Rgb<u8>, reference: &Rgb<u8>) -> bool {
        px.0.iter()
            .zip(reference.0.iter())
            .all(|(a, b)| a.abs_diff(*b) <= self.tolerance)
    }

    /// Anything that is not road, water or blocked is open ground
    pub fn classify(&self, px: &Rgb<u8>) -> Terrain {
        if self.matches(px, &self.blocked) {
            Terrain::Blocked
        } else if self.matches(px, &self.water) {
            Terrain::Water
        } else if self.matches(px, &self.road) {
            Terrain::Road
        } else {
            Terrain::Open
        }
    }
}

/// Rasterizes a color-coded overlay into a [`CostGrid`].
#[derive(Debug, Clone, Default)]
pub struct CostGridBuilder {
    palette: TerrainPalette,
}

impl CostGridBuilder {
    pub fn new(palette: TerrainPalette) -> Self {
        Self { palette }
    }

    pub fn build(&self, overlay: &RgbImage) -> CostGrid {
        let (w, h) = overlay.dimensions();
        CostGrid::from_fn(w as usize, h as usize, |row, col| {
            self.palette
                .classify(overlay.get_pixel(col as u32, row as u32))
        })
    }

    /// Load and classify the overlay image. A missing file is an error.
    pub fn load(&self, path: &Path) -> Result<CostGrid> {
        let overlay = image::open(path)
            .with_context(|| format!("Failed to load terrain overlay {}", path.display()))?
            .to_rgb8();
        let grid = self.build(&overlay);
        let [road, open, water, blocked] = grid.histogram();
        info!(
            "Cost grid {}x{} from {}: road={} open={} water={} blocked={}",
            grid.width(),
            grid.height(),
            path.display(),
            road,
            open,
            water,
            blocked
        );
        Ok(grid)
    }
}

/// Linear mapping between screen pixels inside the map ROI and grid cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridTransform {
    pub roi: ScreenRegion,
    pub grid_width: usize,
    pub grid_height: usize,
}

impl GridTransform {
    pub fn new(roi: ScreenRegion, grid_width: usize, grid_height: usize) -> Self {
        Self {
            roi,
            grid_width,
            grid_height,
        }
    }

    pub fn for_grid(roi: ScreenRegion, grid: &CostGrid) -> Self {
        Self::new(roi, grid.width(), grid.height())
    }

    fn scale_x(&self) -> f64 {
        self.grid_width as f64 / self.roi.width.max(1) as f64
    }

    fn scale_y(&self) -> f64 {
        self.grid_height as f64 / self.roi.height.max(1) as f64
    }

    /// Cell under a screen point, or `None` outside the grid
    pub fn to_grid(&self, p: ScreenPoint) -> Option<GridCell> {
        if !p.x.is_finite() || !p.y.is_finite() {
            return None;
        }
        let col = ((p.x - self.roi.x as f64) * self.scale_x()).floor();
        let row = ((p.y - self.roi.y as f64) * self.scale_y()).floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let cell = GridCell::new(row as usize, col as usize);
        if cell.row < self.grid_height && cell.col < self.grid_width {
            Some(cell)
        } else {
            None
        }
    }

    /// Screen position of a cell's top-left corner
    pub fn to_screen(&self, cell: GridCell) -> ScreenPoint {
        ScreenPoint::new(
            cell.col as f64 / self.scale_x() + self.roi.x as f64,
            cell.row as f64 / self.scale_y() + self.roi.y as f64,
        )
    }
}
