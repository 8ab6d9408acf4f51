use crate::cost_grid::{CostGrid, GridCell, GridTransform, Terrain};
use crate::PlanError;
use sonar_state::{Route, ScreenPoint};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, info};

/// 8-connected neighbourhood as (row, col) offsets
const NEIGHBOURS: [(isize, isize); 8] = [
    (0, 1),
    (1, 0),
    (0, -1),
    (-1, 0),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// Knobs for path post-processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Consecutive cells further apart than this (Manhattan) get re-planned
    pub max_segment_distance: usize,
    /// Minimum Chebyshev spacing between kept waypoints
    pub thin_stride: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_segment_distance: 50,
            thin_stride: 3,
        }
    }
}

/// A* over a cost grid.
///
/// Moves go to any of the 8 neighbours. The step cost is the cost of the
/// cell being entered, the heuristic is Manhattan distance and blocked
/// cells are never expanded. Ties on f are broken by insertion order.
pub fn astar(grid: &CostGrid, start: GridCell, goal: GridCell) -> Option<Vec<GridCell>> {
    if !grid.contains(start) || !grid.contains(goal) {
        return None;
    }
    if start == goal {
        return Some(vec![start]);
    }

    let n = grid.width() * grid.height();
    let mut g_score = vec![u64::MAX; n];
    let mut came_from = vec![usize::MAX; n];
    let mut heap = BinaryHeap::new();
    let mut seq: u64 = 0;

    let start_idx = grid.index(start);
    let goal_idx = grid.index(goal);
    g_score[start_idx] = 0;
    heap.push(Reverse((start.manhattan(&goal) as u64, seq, 0u64, start_idx)));

    while let Some(Reverse((_, _, g, idx))) = heap.pop() {
        if idx == goal_idx {
            return Some(reconstruct(grid, &came_from, start_idx, goal_idx));
        }
        // Superseded by a cheaper push
        if g > g_score[idx] {
            continue;
        }

        let cell = grid.cell_at(idx);
        for (dr, dc) in NEIGHBOURS {
            let (Some(row), Some(col)) = (
                cell.row.checked_add_signed(dr),
                cell.col.checked_add_signed(dc),
            ) else {
                continue;
            };
            let next = GridCell::new(row, col);
            let terrain = match grid.get(next) {
                Some(t) if t.is_passable() => t,
                _ => continue,
            };

            let tentative = g + terrain.cost() as u64;
            let next_idx = grid.index(next);
            if tentative < g_score[next_idx] {
                g_score[next_idx] = tentative;
                came_from[next_idx] = idx;
                seq += 1;
                let f = tentative + next.manhattan(&goal) as u64;
                heap.push(Reverse((f, seq, tentative, next_idx)));
            }
        }
    }

    None
}

fn reconstruct(grid: &CostGrid, came_from: &[usize], start: usize, goal: usize) -> Vec<GridCell> {
    let mut path = vec![grid.cell_at(goal)];
    let mut current = goal;
    while current != start {
        current = came_from[current];
        path.push(grid.cell_at(current));
    }
    path.reverse();
    path
}

/// Plans screen-space routes over a terrain grid.
#[derive(Debug, Clone)]
pub struct PathPlanner {
    grid: Arc<CostGrid>,
    transform: GridTransform,
    config: PlannerConfig,
}

impl PathPlanner {
    pub fn new(grid: Arc<CostGrid>, transform: GridTransform, config: PlannerConfig) -> Self {
        Self {
            grid,
            transform,
            config,
        }
    }

    pub fn grid(&self) -> &CostGrid {
        &self.grid
    }

    pub fn transform(&self) -> &GridTransform {
        &self.transform
    }

    fn endpoint(&self, p: ScreenPoint, which: &'static str) -> Result<GridCell, PlanError> {
        let cell = self
            .transform
            .to_grid(p)
            .ok_or(PlanError::InvalidEndpoint {
                which,
                x: p.x,
                y: p.y,
            })?;
        match self.grid.get(cell) {
            Some(Terrain::Blocked) | None => Err(PlanError::InvalidEndpoint {
                which,
                x: p.x,
                y: p.y,
            }),
            Some(_) => Ok(cell),
        }
    }

    /// Raw A* path between two cells
    pub fn find_cells(&self, start: GridCell, goal: GridCell) -> Result<Vec<GridCell>, PlanError> {
        astar(&self.grid, start, goal).ok_or(PlanError::Unreachable {
            start: (start.row, start.col),
            goal: (goal.row, goal.col),
        })
    }

    /// Plan from `start` to `goal` and return the simplified route in
    /// screen coordinates. The first waypoint is the start cell and the last
    /// is the goal cell.
    pub fn plan(&self, start: ScreenPoint, goal: ScreenPoint) -> Result<Route, PlanError> {
        let start_cell = self.endpoint(start, "start")?;
        let goal_cell = self.endpoint(goal, "goal")?;

        let raw = self.find_cells(start_cell, goal_cell)?;
        let simplified = self.simplify(&raw);
        debug!(
            "A* path {} cells, simplified to {} waypoints",
            raw.len(),
            simplified.len()
        );

        let route = Route::new(
            simplified
                .into_iter()
                .map(|c| self.transform.to_screen(c))
                .collect(),
        );
        info!(
            "Planned route ({:.0}, {:.0}) -> ({:.0}, {:.0}) with {} waypoints",
            start.x,
            start.y,
            goal.x,
            goal.y,
            route.len()
        );
        Ok(route)
    }

    /// Densify long jumps with sub-paths, then thin so kept points are at
    /// least `thin_stride` apart. First and last cells are always kept.
    pub fn simplify(&self, path: &[GridCell]) -> Vec<GridCell> {
        if path.len() < 2 {
            return path.to_vec();
        }

        let mut dense = vec![path[0]];
        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.manhattan(&b) > self.config.max_segment_distance {
                if let Some(sub) = astar(&self.grid, a, b) {
                    if sub.len() > 2 {
                        dense.extend_from_slice(&sub[1..sub.len() - 1]);
                    }
                }
            }
            dense.push(b);
        }

        let last = dense[dense.len() - 1];
        let mut thinned = vec![dense[0]];
        for &cell in &dense[1..dense.len() - 1] {
            let prev = thinned[thinned.len() - 1];
            if prev.chebyshev(&cell) >= self.config.thin_stride {
                thinned.push(cell);
            }
        }
        thinned.push(last);
        thinned
    }
}
