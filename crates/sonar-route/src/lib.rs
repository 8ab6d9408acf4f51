//! Terrain cost grids and route planning over the full-map overlay.

pub mod cost_grid;
pub mod planner;

pub use cost_grid::{CostGrid, CostGridBuilder, GridCell, GridTransform, Terrain, TerrainPalette};
pub use planner::{astar, PathPlanner, PlannerConfig};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("{which} point ({x:.1}, {y:.1}) is outside the map or on blocked terrain")]
    InvalidEndpoint { which: &'static str, x: f64, y: f64 },

    #[error("no path from cell {start:?} to cell {goal:?}")]
    Unreachable {
        start: (usize, usize),
        goal: (usize, usize),
    },
}
