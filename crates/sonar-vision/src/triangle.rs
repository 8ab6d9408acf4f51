use crate::contour::convex_hull;
use nalgebra::{Point2, Vector2};
use std::f64::consts::{PI, TAU};

/// Angular step for sampled support-line directions
const SAMPLE_STEP_DEG: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Point2<f64>; 3],
}

impl Triangle {
    pub fn area(&self) -> f64 {
        let [a, b, c] = self.vertices;
        ((b - a).perp(&(c - a)) / 2.0).abs()
    }

    /// Vertex with the largest summed distance to the other two; the point
    /// of an arrow-shaped glyph.
    pub fn tip(&self) -> Point2<f64> {
        let [a, b, c] = self.vertices;
        let score = |p: Point2<f64>, q: Point2<f64>, r: Point2<f64>| {
            nalgebra::distance(&p, &q) + nalgebra::distance(&p, &r)
        };
        let scores = [score(a, b, c), score(b, a, c), score(c, a, b)];
        let mut best = 0;
        for i in 1..3 {
            if scores[i] > scores[best] {
                best = i;
            }
        }
        self.vertices[best]
    }
}

/// Line `n . x = offset` with unit outward normal `n` supporting the hull.
#[derive(Debug, Clone, Copy)]
struct Support {
    angle: f64,
    normal: Vector2<f64>,
    offset: f64,
}

impl Support {
    fn at(angle: f64, hull: &[Point2<f64>]) -> Self {
        let normal = Vector2::new(angle.cos(), angle.sin());
        let offset = hull
            .iter()
            .map(|p| normal.dot(&p.coords))
            .fold(f64::NEG_INFINITY, f64::max);
        Self {
            angle: angle.rem_euclid(TAU),
            normal,
            offset,
        }
    }

    fn intersect(&self, other: &Support) -> Option<Point2<f64>> {
        let det = self.normal.perp(&other.normal);
        if det.abs() < 1e-12 {
            return None;
        }
        let x = (self.offset * other.normal.y - other.offset * self.normal.y) / det;
        let y = (self.normal.x * other.offset - other.normal.x * self.offset) / det;
        Some(Point2::new(x, y))
    }
}

/// Outward normal angles of every hull edge
fn flush_angles(hull: &[Point2<f64>]) -> Vec<f64> {
    let n = hull.len();
    let mut angles = Vec::with_capacity(n);
    for i in 0..n {
        let (p0, p1) = (hull[i], hull[(i + 1) % n]);
        let e = p1 - p0;
        let mut normal = Vector2::new(e.y, -e.x);
        if hull.iter().any(|p| normal.dot(&(p - p0)) > 1e-9) {
            normal = -normal;
        }
        angles.push(normal.y.atan2(normal.x));
    }
    angles
}

/// Three half-planes bound a finite triangle only when their normals
/// positively span the plane.
fn bounded(a: f64, b: f64, c: f64) -> bool {
    let mut s = [a, b, c];
    s.sort_by(f64::total_cmp);
    let gaps = [s[1] - s[0], s[2] - s[1], TAU - (s[2] - s[0])];
    gaps.iter().all(|&g| g > 1e-9 && g < PI - 1e-9)
}

fn triangle_from(lines: [&Support; 3]) -> Option<Triangle> {
    if !bounded(lines[0].angle, lines[1].angle, lines[2].angle) {
        return None;
    }
    let a = lines[0].intersect(lines[1])?;
    let b = lines[1].intersect(lines[2])?;
    let c = lines[2].intersect(lines[0])?;
    let t = Triangle {
        vertices: [a, b, c],
    };
    t.vertices
        .iter()
        .all(|v| v.x.is_finite() && v.y.is_finite())
        .then_some(t)
}

/// Smallest-area triangle enclosing `points`.
///
/// Every side of the result is a supporting line of the convex hull and at
/// least one side is flush with a hull edge. The other two side directions
/// are drawn from the hull edge directions plus a fixed angular sampling.
/// Returns `None` when the hull has fewer than three vertices.
pub fn min_enclosing_triangle(points: &[Point2<f64>]) -> Option<Triangle> {
    let hull = convex_hull(points);
    if hull.len() < 3 {
        return None;
    }

    let flush: Vec<Support> = flush_angles(&hull)
        .into_iter()
        .map(|a| Support::at(a, &hull))
        .collect();
    let steps = (360.0 / SAMPLE_STEP_DEG) as usize;
    let mut candidates = flush.clone();
    candidates.extend((0..steps).map(|i| Support::at((i as f64 * SAMPLE_STEP_DEG).to_radians(), &hull)));

    let mut best: Option<(Triangle, f64)> = None;
    for base in &flush {
        for j in 0..candidates.len() {
            for k in (j + 1)..candidates.len() {
                let Some(t) = triangle_from([base, &candidates[j], &candidates[k]]) else {
                    continue;
                };
                let area = t.area();
                if area > 0.0 && best.map_or(true, |(_, a)| area < a) {
                    best = Some((t, area));
                }
            }
        }
    }
    best.map(|(t, _)| t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(raw: &[(f64, f64)]) -> Vec<Point2<f64>> {
        raw.iter().map(|&(x, y)| Point2::new(x, y)).collect()
    }

    #[test]
    fn test_triangle_encloses_itself() {
        let input = pts(&[(0.0, 0.0), (10.0, 0.0), (3.0, 8.0), (4.0, 2.0)]);
        let t = min_enclosing_triangle(&input).unwrap();
        assert!((t.area() - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_square_needs_twice_its_area() {
        let input = pts(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        let t = min_enclosing_triangle(&input).unwrap();
        assert!(t.area() >= 200.0 - 1e-6);
        assert!(t.area() < 210.0);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(min_enclosing_triangle(&pts(&[(1.0, 1.0), (2.0, 2.0)])).is_none());
        assert!(min_enclosing_triangle(&pts(&[(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)])).is_none());
        assert!(min_enclosing_triangle(&[]).is_none());
    }

    #[test]
    fn test_tip_of_isosceles() {
        let t = Triangle {
            vertices: [
                Point2::new(-5.0, 10.0),
                Point2::new(0.0, -20.0),
                Point2::new(5.0, 10.0),
            ],
        };
        assert_eq!(t.tip(), Point2::new(0.0, -20.0));
    }
}
