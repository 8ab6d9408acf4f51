use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    /// Project a point; `None` when it maps to infinity
    pub fn apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        if v[2].abs() < 1e-12 {
            return None;
        }
        let out = Point2::new(v[0] / v[2], v[1] / v[2]);
        (out.x.is_finite() && out.y.is_finite()).then_some(out)
    }

    /// Finite and invertible
    pub fn is_usable(&self) -> bool {
        self.h.iter().all(|v| v.is_finite()) && self.h.determinant().abs() > 1e-9
    }
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };
    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Translate to the centroid and scale so the mean distance is sqrt(2)
fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let (cx, cy) = pts
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (cx / n, cy / n);
    let mean_dist = pts
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / n;

    let t = hartley_normalization(cx, cy, mean_dist);
    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

fn finish(hn: Matrix3<f64>, t_src: Matrix3<f64>, t_dst: Matrix3<f64>) -> Option<Homography> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let s = h[(2, 2)];
    if s.abs() < 1e-12 {
        return None;
    }
    let hom = Homography::new(h / s);
    hom.is_usable().then_some(hom)
}

/// Exact homography through 4 correspondences (`dst ~ H * src`)
pub fn homography_from_4pt(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Homography> {
    let (s, t_src) = normalize_points(src);
    let (d, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for k in 0..4 {
        let (x, y, u, v) = (s[k].x, s[k].y, d[k].x, d[k].y);
        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;
    let hn = Matrix3::<f64>::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
    finish(hn, t_src, t_dst)
}

/// Least-squares homography through N >= 4 correspondences via normalized DLT
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }
    if src.len() == 4 {
        let s: &[Point2<f64>; 4] = src.try_into().ok()?;
        let d: &[Point2<f64>; 4] = dst.try_into().ok()?;
        return homography_from_4pt(s, d);
    }

    let (s, t_src) = normalize_points(src);
    let (d, t_dst) = normalize_points(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for k in 0..n {
        let (x, y, u, v) = (s[k].x, s[k].y, d[k].x, d[k].y);
        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    // Null vector of A is the last row of V^T
    let svd = a.svd(false, true);
    let vt = svd.v_t?;
    let last = vt.nrows().checked_sub(1)?;
    let h = vt.row(last);
    let hn = Matrix3::<f64>::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);
    finish(hn, t_src, t_dst)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacConfig {
    pub iterations: usize,
    /// Maximum reprojection error in destination pixels for an inlier
    pub threshold: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            iterations: 500,
            threshold: 5.0,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub homography: Homography,
    pub inliers: Vec<usize>,
}

fn inliers_of(h: &Homography, src: &[Point2<f64>], dst: &[Point2<f64>], threshold: f64) -> Vec<usize> {
    src.iter()
        .zip(dst.iter())
        .enumerate()
        .filter_map(|(i, (s, d))| {
            let p = h.apply(*s)?;
            (nalgebra::distance(&p, d) <= threshold).then_some(i)
        })
        .collect()
}

/// True when some three of the four points are nearly collinear
fn degenerate_sample(pts: &[Point2<f64>; 4]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES.iter().any(|[a, b, c]| {
        let area = (pts[*b] - pts[*a]).perp(&(pts[*c] - pts[*a]));
        area.abs() < 1e-6
    })
}

/// Robust homography: seeded RANSAC over 4-point samples, then a DLT refit
/// on the consensus set.
pub fn find_homography_ransac(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    config: &RansacConfig,
) -> Option<RansacFit> {
    let n = src.len();
    if n != dst.len() || n < 4 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<RansacFit> = None;

    for _ in 0..config.iterations.max(1) {
        let idx = rand::seq::index::sample(&mut rng, n, 4);
        let s = [src[idx.index(0)], src[idx.index(1)], src[idx.index(2)], src[idx.index(3)]];
        let d = [dst[idx.index(0)], dst[idx.index(1)], dst[idx.index(2)], dst[idx.index(3)]];
        if degenerate_sample(&s) || degenerate_sample(&d) {
            continue;
        }
        let Some(h) = homography_from_4pt(&s, &d) else {
            continue;
        };
        let inliers = inliers_of(&h, src, dst, config.threshold);
        if best.as_ref().map_or(true, |b| inliers.len() > b.inliers.len()) {
            let all = inliers.len() == n;
            best = Some(RansacFit {
                homography: h,
                inliers,
            });
            if all {
                break;
            }
        }
    }

    let best = best?;
    if best.inliers.len() < 4 {
        return None;
    }

    let in_src: Vec<Point2<f64>> = best.inliers.iter().map(|&i| src[i]).collect();
    let in_dst: Vec<Point2<f64>> = best.inliers.iter().map(|&i| dst[i]).collect();
    match estimate_homography(&in_src, &in_dst) {
        Some(refit) => {
            let inliers = inliers_of(&refit, src, dst, config.threshold);
            if inliers.len() >= best.inliers.len() {
                Some(RansacFit {
                    homography: refit,
                    inliers,
                })
            } else {
                Some(best)
            }
        }
        None => Some(best),
    }
}
