//! Oriented FAST keypoints with rotated binary descriptors.
//!
//! Corners are detected with a FAST-9 test on every level of a scale
//! pyramid, oriented by their intensity centroid and described by 256
//! comparisons between 5x5 box sums sampled on a fixed random pattern that
//! is rotated with the keypoint.

use image::imageops::FilterType;
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

const PATTERN_SEED: u64 = 0x0b5e_55ed;
const PATTERN_BITS: usize = 256;
const PATTERN_HALF: i32 = 12;
const BOX_HALF: i32 = 2;
const ORIENT_RADIUS: i32 = 15;

/// Pixels this close to an image edge never become keypoints
pub const BORDER: u32 = 24;

/// Bresenham circle of radius 3, clockwise from the top
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Keypoint location in full-resolution pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    /// Orientation in radians
    pub angle: f64,
    pub response: f32,
    pub level: u8,
}

/// 256-bit binary descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbConfig {
    pub fast_threshold: u8,
    pub levels: usize,
    pub scale: f64,
    pub max_features: usize,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            levels: 4,
            scale: 1.2,
            max_features: 1000,
        }
    }
}

/// Summed-area table with one row and column of zero padding
struct Integral {
    width: usize,
    sums: Vec<u64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let width = w + 1;
        let mut sums = vec![0u64; width * (h + 1)];
        for y in 0..h {
            let mut row = 0u64;
            for x in 0..w {
                row += img.get_pixel(x as u32, y as u32)[0] as u64;
                sums[(y + 1) * width + x + 1] = sums[y * width + x + 1] + row;
            }
        }
        Self { width, sums }
    }

    /// Sum of the 5x5 box centred on (x, y); caller keeps it in bounds
    fn box_sum(&self, x: i32, y: i32) -> u64 {
        let x0 = (x - BOX_HALF) as usize;
        let y0 = (y - BOX_HALF) as usize;
        let x1 = (x + BOX_HALF + 1) as usize;
        let y1 = (y + BOX_HALF + 1) as usize;
        let w = self.width;
        self.sums[y1 * w + x1] + self.sums[y0 * w + x0]
            - self.sums[y0 * w + x1]
            - self.sums[y1 * w + x0]
    }
}

pub struct OrbExtractor {
    config: OrbConfig,
    pattern: Vec<[(i32, i32); 2]>,
}

impl OrbExtractor {
    pub fn new(config: OrbConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut pattern = Vec::with_capacity(PATTERN_BITS);
        while pattern.len() < PATTERN_BITS {
            let a = (
                rng.gen_range(-PATTERN_HALF..=PATTERN_HALF),
                rng.gen_range(-PATTERN_HALF..=PATTERN_HALF),
            );
            let b = (
                rng.gen_range(-PATTERN_HALF..=PATTERN_HALF),
                rng.gen_range(-PATTERN_HALF..=PATTERN_HALF),
            );
            if a != b {
                pattern.push([a, b]);
            }
        }
        Self { config, pattern }
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    /// Detect keypoints across the pyramid and describe them. The two
    /// returned vectors are index-aligned.
    pub fn detect_and_compute(&self, gray: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let levels = self.pyramid(gray);
        if levels.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let total_area: f64 = levels
            .iter()
            .map(|(img, _)| img.width() as f64 * img.height() as f64)
            .sum();

        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for (level, (img, factor)) in levels.iter().enumerate() {
            let area = img.width() as f64 * img.height() as f64;
            let quota = ((self.config.max_features as f64 * area / total_area).ceil() as usize).max(1);

            let mut corners = detect_fast(img, self.config.fast_threshold);
            corners.sort_by(|a, b| b.2.total_cmp(&a.2));
            corners.truncate(quota);

            let integral = Integral::new(img);
            for (x, y, response) in corners {
                let angle = orientation(img, x, y);
                descriptors.push(self.describe(&integral, x, y, angle));
                keypoints.push(Keypoint {
                    x: x as f64 * factor,
                    y: y as f64 * factor,
                    angle,
                    response,
                    level: level as u8,
                });
            }
        }

        keypoints.truncate(self.config.max_features);
        descriptors.truncate(self.config.max_features);
        debug!(
            "Extracted {} keypoints from {}x{} over {} levels",
            keypoints.len(),
            gray.width(),
            gray.height(),
            levels.len()
        );
        (keypoints, descriptors)
    }

    /// Level images with their scale factor back to full resolution
    fn pyramid(&self, gray: &GrayImage) -> Vec<(GrayImage, f64)> {
        let min_side = 2 * BORDER + 1;
        let mut out = Vec::new();
        for level in 0..self.config.levels.max(1) {
            let factor = self.config.scale.powi(level as i32);
            let w = (gray.width() as f64 / factor).round() as u32;
            let h = (gray.height() as f64 / factor).round() as u32;
            if w < min_side || h < min_side {
                break;
            }
            let img = if level == 0 {
                gray.clone()
            } else {
                image::imageops::resize(gray, w, h, FilterType::Triangle)
            };
            out.push((img, factor));
        }
        out
    }

    fn describe(&self, integral: &Integral, x: u32, y: u32, angle: f64) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let rotate = |(px, py): (i32, i32)| {
            let (px, py) = (px as f64, py as f64);
            (
                x as i32 + (px * cos - py * sin).round() as i32,
                y as i32 + (px * sin + py * cos).round() as i32,
            )
        };

        let mut bits = [0u64; 4];
        for (i, [a, b]) in self.pattern.iter().enumerate() {
            let (ax, ay) = rotate(*a);
            let (bx, by) = rotate(*b);
            if integral.box_sum(ax, ay) < integral.box_sum(bx, by) {
                bits[i / 64] |= 1 << (i % 64);
            }
        }
        Descriptor(bits)
    }
}

/// Score of a FAST-9 corner at (x, y), if it is one
fn fast_score(img: &GrayImage, x: u32, y: u32, threshold: i32) -> Option<f32> {
    let p = img.get_pixel(x, y)[0] as i32;
    let mut class = [0i8; 16];
    let mut score = 0i32;
    for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
        let v = img.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as i32;
        let diff = v - p;
        if diff > threshold {
            class[i] = 1;
            score += diff - threshold;
        } else if diff < -threshold {
            class[i] = -1;
            score += -diff - threshold;
        }
    }

    let mut run = 0;
    let mut current = 0i8;
    for i in 0..32 {
        let c = class[i % 16];
        if c != 0 && c == current {
            run += 1;
        } else {
            current = c;
            run = if c != 0 { 1 } else { 0 };
        }
        if run >= 9 {
            return Some(score as f32);
        }
    }
    None
}

/// FAST corners after 3x3 non-maximum suppression as (x, y, response)
fn detect_fast(img: &GrayImage, threshold: u8) -> Vec<(u32, u32, f32)> {
    let (w, h) = (img.width(), img.height());
    if w <= 2 * BORDER || h <= 2 * BORDER {
        return Vec::new();
    }
    let mut scores = vec![0f32; (w * h) as usize];
    for y in BORDER..h - BORDER {
        for x in BORDER..w - BORDER {
            if let Some(s) = fast_score(img, x, y, threshold as i32) {
                scores[(y * w + x) as usize] = s;
            }
        }
    }

    let mut corners = Vec::new();
    for y in BORDER..h - BORDER {
        for x in BORDER..w - BORDER {
            let idx = (y * w + x) as usize;
            let s = scores[idx];
            if s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = ((y as i32 + dy) as u32 * w + (x as i32 + dx) as u32) as usize;
                    // Equal scores: the first in raster order wins
                    if scores[n] > s || (scores[n] == s && n < idx) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                corners.push((x, y, s));
            }
        }
    }
    corners
}

/// Angle of the intensity centroid inside a disc around (x, y)
fn orientation(img: &GrayImage, x: u32, y: u32) -> f64 {
    let (mut m10, mut m01) = (0i64, 0i64);
    let r2 = ORIENT_RADIUS * ORIENT_RADIUS;
    for dy in -ORIENT_RADIUS..=ORIENT_RADIUS {
        for dx in -ORIENT_RADIUS..=ORIENT_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = img.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f64).atan2(m10 as f64)
}

/// Query/train descriptor pair that passed the ratio test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Two-nearest-neighbour matching with Lowe's ratio test.
pub fn ratio_matches(query: &[Descriptor], train: &[Descriptor], ratio: f32) -> Vec<FeatureMatch> {
    if train.len() < 2 {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let (mut best, mut second) = (u32::MAX, u32::MAX);
        let mut best_idx = 0;
        for (ti, t) in train.iter().enumerate() {
            let d = q.hamming(t);
            if d < best {
                second = best;
                best = d;
                best_idx = ti;
            } else if d < second {
                second = d;
            }
        }
        if (best as f32) < ratio * second as f32 {
            matches.push(FeatureMatch {
                query: qi,
                train: best_idx,
                distance: best,
            });
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn block_texture(w: u32, h: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let bw = w.div_ceil(8);
        let bh = h.div_ceil(8);
        let blocks: Vec<u8> = (0..bw * bh).map(|_| rng.gen()).collect();
        GrayImage::from_fn(w, h, |x, y| Luma([blocks[((y / 8) * bw + x / 8) as usize]]))
    }

    #[test]
    fn test_hamming() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 0]);
        assert_eq!(a.hamming(&b), 67);
        assert_eq!(b.hamming(&b), 0);
    }

    #[test]
    fn test_flat_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(120, 120, Luma([90]));
        let (kps, descs) = OrbExtractor::new(OrbConfig::default()).detect_and_compute(&img);
        assert!(kps.is_empty());
        assert!(descs.is_empty());
    }

    #[test]
    fn test_bright_square_corners_detected() {
        let img = GrayImage::from_fn(100, 100, |x, y| {
            if (40..60).contains(&x) && (40..60).contains(&y) {
                Luma([220])
            } else {
                Luma([30])
            }
        });
        let config = OrbConfig {
            levels: 1,
            ..OrbConfig::default()
        };
        let (kps, descs) = OrbExtractor::new(config).detect_and_compute(&img);
        assert_eq!(kps.len(), descs.len());
        assert!(!kps.is_empty());
        // Every response sits near one of the four corners
        for kp in &kps {
            let near = [(40.0, 40.0), (59.0, 40.0), (40.0, 59.0), (59.0, 59.0)]
                .iter()
                .any(|(cx, cy)| (kp.x - cx).abs() <= 3.0 && (kp.y - cy).abs() <= 3.0);
            assert!(near, "unexpected keypoint at ({}, {})", kp.x, kp.y);
        }
    }

    #[test]
    fn test_translated_crop_matches_reference() {
        let reference = block_texture(160, 160, 7);
        let crop = image::imageops::crop_imm(&reference, 30, 20, 100, 100).to_image();
        let extractor = OrbExtractor::new(OrbConfig {
            levels: 1,
            ..OrbConfig::default()
        });
        let (ref_kps, ref_desc) = extractor.detect_and_compute(&reference);
        let (crop_kps, crop_desc) = extractor.detect_and_compute(&crop);

        let matches = ratio_matches(&crop_desc, &ref_desc, 0.75);
        let consistent = matches
            .iter()
            .filter(|m| {
                let (q, t) = (crop_kps[m.query], ref_kps[m.train]);
                (q.x + 30.0 - t.x).abs() < 0.5 && (q.y + 20.0 - t.y).abs() < 0.5
            })
            .count();
        assert!(consistent >= 10, "only {} consistent matches", consistent);
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous() {
        let q = [Descriptor([1, 0, 0, 0])];
        let train = [Descriptor([1, 0, 0, 0]), Descriptor([1, 0, 0, 0])];
        assert!(ratio_matches(&q, &train, 0.75).is_empty());

        let train = [Descriptor([1, 0, 0, 0]), Descriptor([!0, !0, 0, 0])];
        let m = ratio_matches(&q, &train, 0.75);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].train, 0);
        assert!(ratio_matches(&q, &train[..1], 0.75).is_empty());
    }
}
