//! External contours of binary masks.
//!
//! Each 8-connected foreground component yields one closed polygon through
//! the centres of its outer boundary pixels, in tracing order. Holes are
//! ignored.

use image::GrayImage;
use nalgebra::Point2;
use std::collections::VecDeque;

/// Clockwise neighbour offsets starting East (y grows downwards)
const DIRS: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];
const WEST: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub points: Vec<(i32, i32)>,
}

impl Contour {
    fn signed_area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut acc: i64 = 0;
        for i in 0..n {
            let (x0, y0) = self.points[i];
            let (x1, y1) = self.points[(i + 1) % n];
            acc += x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64;
        }
        acc as f64 / 2.0
    }

    /// Enclosed polygon area. A solid w x h rectangle measures (w-1)(h-1).
    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// Centroid from the polygon's first-order moments. `None` when the
    /// polygon has no area.
    pub fn centroid(&self) -> Option<Point2<f64>> {
        let a = self.signed_area();
        if a.abs() < f64::EPSILON {
            return None;
        }
        let n = self.points.len();
        let (mut cx, mut cy) = (0.0, 0.0);
        for i in 0..n {
            let (x0, y0) = (self.points[i].0 as f64, self.points[i].1 as f64);
            let (x1, y1) = (
                self.points[(i + 1) % n].0 as f64,
                self.points[(i + 1) % n].1 as f64,
            );
            let cross = x0 * y1 - x1 * y0;
            cx += (x0 + x1) * cross;
            cy += (y0 + y1) * cross;
        }
        Some(Point2::new(cx / (6.0 * a), cy / (6.0 * a)))
    }

    pub fn to_points(&self) -> Vec<Point2<f64>> {
        self.points
            .iter()
            .map(|&(x, y)| Point2::new(x as f64, y as f64))
            .collect()
    }
}

fn is_fg(mask: &GrayImage, x: i32, y: i32) -> bool {
    x >= 0
        && y >= 0
        && (x as u32) < mask.width()
        && (y as u32) < mask.height()
        && mask.get_pixel(x as u32, y as u32)[0] > 0
}

/// From pixel `p` with background neighbour in direction `back`, scan
/// clockwise for the next foreground neighbour. Returns it with the new
/// backtrack direction relative to it.
fn next_boundary(mask: &GrayImage, p: (i32, i32), back: usize) -> Option<((i32, i32), usize)> {
    for k in 1..=8 {
        let d = (back + k) % 8;
        let q = (p.0 + DIRS[d].0, p.1 + DIRS[d].1);
        if is_fg(mask, q.0, q.1) {
            let prev = (back + k - 1) % 8;
            let c = (p.0 + DIRS[prev].0, p.1 + DIRS[prev].1);
            let rel = (c.0 - q.0, c.1 - q.1);
            let new_back = DIRS.iter().position(|&o| o == rel)?;
            return Some((q, new_back));
        }
    }
    None
}

/// Moore-neighbour trace starting at the first raster pixel of a component
fn trace(mask: &GrayImage, start: (i32, i32)) -> Contour {
    let mut points = vec![start];
    let Some((first, first_back)) = next_boundary(mask, start, WEST) else {
        return Contour { points };
    };

    let (mut p, mut back) = (first, first_back);
    let limit = 4 * (mask.width() as usize * mask.height() as usize) + 8;
    for _ in 0..limit {
        if p == start {
            let Some((q, b)) = next_boundary(mask, p, back) else {
                break;
            };
            if q == first {
                break;
            }
            points.push(p);
            p = q;
            back = b;
            continue;
        }
        points.push(p);
        let Some((q, b)) = next_boundary(mask, p, back) else {
            break;
        };
        p = q;
        back = b;
    }
    Contour { points }
}

/// Outer contours of every 8-connected foreground component, in raster
/// order of each component's first pixel.
pub fn find_external_contours(mask: &GrayImage) -> Vec<Contour> {
    let (w, h) = (mask.width() as i32, mask.height() as i32);
    let mut visited = vec![false; (w * h) as usize];
    let mut contours = Vec::new();
    let mut queue = VecDeque::new();

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            if visited[idx] || !is_fg(mask, x, y) {
                continue;
            }

            // Label the whole component so later scans skip it
            visited[idx] = true;
            queue.push_back((x, y));
            while let Some((cx, cy)) = queue.pop_front() {
                for (dx, dy) in DIRS {
                    let (nx, ny) = (cx + dx, cy + dy);
                    if is_fg(mask, nx, ny) {
                        let nidx = (ny * w + nx) as usize;
                        if !visited[nidx] {
                            visited[nidx] = true;
                            queue.push_back((nx, ny));
                        }
                    }
                }
            }

            contours.push(trace(mask, (x, y)));
        }
    }
    contours
}

fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Convex hull by monotone chain, without collinear points. Orientation is
/// counter-clockwise in a y-up frame.
pub fn convex_hull(points: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let mut pts: Vec<Point2<f64>> = points.to_vec();
    pts.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut hull: Vec<Point2<f64>> = Vec::with_capacity(pts.len() * 2);
    for p in pts.iter() {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    let lower_len = hull.len() + 1;
    for p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}
