use crate::features::{ratio_matches, Descriptor, Keypoint, OrbConfig, OrbExtractor};
use crate::homography::{find_homography_ransac, RansacConfig};
use anyhow::{Context, Result};
use image::{GrayImage, RgbaImage};
use nalgebra::Point2;
use serde::Serialize;
use sonar_capture::{ScreenRegion, ScreenSampler};
use sonar_data::PpiConfig;
use sonar_state::ScreenPoint;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    pub ratio: f32,
    pub min_matches: usize,
    pub ransac: RansacConfig,
    pub patch: OrbConfig,
    pub reference: OrbConfig,
}

impl MatcherConfig {
    pub fn from_ppi(ppi: &PpiConfig) -> Self {
        let orb = |max_features| OrbConfig {
            fast_threshold: ppi.fast_threshold,
            levels: ppi.pyramid_levels,
            max_features,
            ..OrbConfig::default()
        };
        Self {
            ratio: ppi.ratio,
            min_matches: ppi.min_matches,
            ransac: RansacConfig {
                iterations: ppi.ransac_iterations,
                threshold: ppi.ransac_threshold,
                seed: ppi.ransac_seed,
            },
            patch: orb(ppi.patch_features),
            reference: orb(ppi.reference_features),
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self::from_ppi(&PpiConfig::default())
    }
}

/// Keypoints and descriptors of one reference map image. Immutable once
/// built.
pub struct MapReference {
    pub name: String,
    pub width: u32,
    pub height: u32,
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl MapReference {
    pub fn from_image(name: impl Into<String>, gray: &GrayImage, extractor: &OrbExtractor) -> Self {
        let (keypoints, descriptors) = extractor.detect_and_compute(gray);
        Self {
            name: name.into(),
            width: gray.width(),
            height: gray.height(),
            keypoints,
            descriptors,
        }
    }

    pub fn load(name: &str, path: &Path, extractor: &OrbExtractor) -> Result<Self> {
        let start = Instant::now();
        let gray = image::open(path)
            .with_context(|| format!("Failed to open reference map {}", path.display()))?
            .to_luma8();
        let reference = Self::from_image(name, &gray, extractor);
        info!(
            "Reference map '{}' ({}x{}): {} keypoints in {:.0?}",
            name,
            reference.width,
            reference.height,
            reference.keypoint_count(),
            start.elapsed()
        );
        Ok(reference)
    }

    pub fn keypoint_count(&self) -> usize {
        self.keypoints.len()
    }
}

/// Snapshot of the matcher's loaded map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatcherStatus {
    pub current_map: Option<String>,
    pub keypoints: usize,
    pub width: u32,
    pub height: u32,
}

/// Locates captured minimap patches on the active reference map.
pub struct MapMatcher {
    config: MatcherConfig,
    patch_extractor: OrbExtractor,
    reference_extractor: OrbExtractor,
    current: RwLock<Option<Arc<MapReference>>>,
    /// Held across a reference load so concurrent switches extract once
    loading: Mutex<()>,
}

impl MapMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            patch_extractor: OrbExtractor::new(config.patch),
            reference_extractor: OrbExtractor::new(config.reference),
            config,
            current: RwLock::new(None),
            loading: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn current(&self) -> Option<Arc<MapReference>> {
        self.current.read().ok().and_then(|g| g.clone())
    }

    /// Make `name` the active map, loading and extracting it unless it is
    /// already active. This is the only way the reference changes.
    pub fn switch_map(&self, name: &str, path: &Path) -> Result<Arc<MapReference>> {
        if let Some(current) = self.current_named(name) {
            return Ok(current);
        }
        let _loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have installed it while we waited
        if let Some(current) = self.current_named(name) {
            return Ok(current);
        }
        let reference = Arc::new(MapReference::load(name, path, &self.reference_extractor)?);
        self.install(reference.clone());
        Ok(reference)
    }

    fn current_named(&self, name: &str) -> Option<Arc<MapReference>> {
        self.current().filter(|current| current.name == name)
    }

    /// Replace the active map with an already-built reference
    pub fn set_reference_image(&self, name: &str, gray: &GrayImage) -> Arc<MapReference> {
        let reference = Arc::new(MapReference::from_image(name, gray, &self.reference_extractor));
        self.install(reference.clone());
        reference
    }

    fn install(&self, reference: Arc<MapReference>) {
        match self.current.write() {
            Ok(mut guard) => *guard = Some(reference),
            Err(_) => warn!("Map reference lock poisoned; keeping previous map"),
        }
    }

    pub fn status(&self) -> MatcherStatus {
        match self.current() {
            Some(r) => MatcherStatus {
                current_map: Some(r.name.clone()),
                keypoints: r.keypoint_count(),
                width: r.width,
                height: r.height,
            },
            None => MatcherStatus {
                current_map: None,
                keypoints: 0,
                width: 0,
                height: 0,
            },
        }
    }

    /// Full-screen position of the patch centre, with `roi` being the screen
    /// area the reference map image spans.
    pub fn locate(&self, patch: &RgbaImage, roi: &ScreenRegion) -> Option<ScreenPoint> {
        let gray = image::imageops::grayscale(patch);
        self.locate_gray(&gray, roi)
    }

    pub fn locate_gray(&self, patch: &GrayImage, roi: &ScreenRegion) -> Option<ScreenPoint> {
        let Some(reference) = self.current() else {
            warn!("Map matching requested with no reference map loaded");
            return None;
        };

        let (kps, descs) = self.patch_extractor.detect_and_compute(patch);
        if descs.is_empty() {
            debug!("No features in captured patch");
            return None;
        }

        let matches = ratio_matches(&descs, &reference.descriptors, self.config.ratio);
        let src: Vec<Point2<f64>> = matches
            .iter()
            .map(|m| Point2::new(kps[m.query].x, kps[m.query].y))
            .collect();
        let dst: Vec<Point2<f64>> = matches
            .iter()
            .map(|m| {
                let kp = &reference.keypoints[m.train];
                Point2::new(kp.x, kp.y)
            })
            .collect();

        let center = patch_center(
            &src,
            &dst,
            patch.width(),
            patch.height(),
            &self.config,
        )?;
        let position = reference_to_screen(center, reference.width, reference.height, roi);
        debug!(
            "Patch matched on '{}' at ({:.1}, {:.1})",
            reference.name, position.x, position.y
        );
        Some(position)
    }
}

/// Mean of the patch's four corners projected into reference space.
///
/// Needs at least `min_matches` correspondences and a usable homography.
pub fn patch_center(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    patch_width: u32,
    patch_height: u32,
    config: &MatcherConfig,
) -> Option<Point2<f64>> {
    if src.len() < config.min_matches {
        debug!(
            "Not enough good matches: {} < {}",
            src.len(),
            config.min_matches
        );
        return None;
    }

    let fit = find_homography_ransac(src, dst, &config.ransac)?;
    if !fit.homography.is_usable() {
        debug!("Rejected singular homography");
        return None;
    }

    let (w, h) = (
        patch_width.saturating_sub(1) as f64,
        patch_height.saturating_sub(1) as f64,
    );
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(0.0, h),
        Point2::new(w, h),
        Point2::new(w, 0.0),
    ];
    let mut sum = Point2::new(0.0, 0.0);
    for c in corners {
        let p = fit.homography.apply(c)?;
        sum.x += p.x;
        sum.y += p.y;
    }
    let center = Point2::new(sum.x / 4.0, sum.y / 4.0);
    (center.x.is_finite() && center.y.is_finite()).then_some(center)
}

/// Scale a reference-image point into the screen ROI the map occupies
pub fn reference_to_screen(p: Point2<f64>, ref_width: u32, ref_height: u32, roi: &ScreenRegion) -> ScreenPoint {
    ScreenPoint::new(
        p.x * roi.width as f64 / ref_width.max(1) as f64 + roi.x as f64,
        p.y * roi.height as f64 / ref_height.max(1) as f64 + roi.y as f64,
    )
}

/// Captures the map-matching patch and resolves it on the configured map.
pub struct PpiLocalizer {
    sampler: Arc<dyn ScreenSampler>,
    matcher: Arc<MapMatcher>,
    capture: ScreenRegion,
    roi: ScreenRegion,
    map_name: String,
    map_path: PathBuf,
}

impl PpiLocalizer {
    pub fn new(
        sampler: Arc<dyn ScreenSampler>,
        matcher: Arc<MapMatcher>,
        capture: ScreenRegion,
        roi: ScreenRegion,
        map_name: impl Into<String>,
        map_path: PathBuf,
    ) -> Self {
        Self {
            sampler,
            matcher,
            capture,
            roi,
            map_name: map_name.into(),
            map_path,
        }
    }

    pub fn locate(&self) -> Option<ScreenPoint> {
        if let Err(e) = self.matcher.switch_map(&self.map_name, &self.map_path) {
            warn!("Map '{}' unavailable: {:#}", self.map_name, e);
            return None;
        }
        match self.sampler.capture(&self.capture) {
            Ok(patch) => self.matcher.locate(&patch, &self.roi),
            Err(e) => {
                warn!("Map patch capture failed: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sonar_capture::FrameSampler;

    fn single_level() -> MatcherConfig {
        let mut config = MatcherConfig::default();
        config.patch.levels = 1;
        config.reference.levels = 1;
        config
    }

    fn texture(w: u32, h: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let bw = w.div_ceil(8);
        let blocks: Vec<u8> = (0..bw * h.div_ceil(8)).map(|_| rng.gen()).collect();
        GrayImage::from_fn(w, h, |x, y| Luma([blocks[((y / 8) * bw + x / 8) as usize]]))
    }

    fn to_rgba(gray: &GrayImage) -> RgbaImage {
        RgbaImage::from_fn(gray.width(), gray.height(), |x, y| {
            let v = gray.get_pixel(x, y)[0];
            image::Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn test_locates_crop_of_reference() {
        let reference = texture(240, 240, 11);
        let matcher = MapMatcher::new(single_level());
        matcher.set_reference_image("main", &reference);

        let patch = image::imageops::crop_imm(&reference, 60, 80, 120, 120).to_image();
        let roi = ScreenRegion::new(0, 0, 240, 240);
        let p = matcher.locate(&to_rgba(&patch), &roi).unwrap();
        assert!((p.x - 119.5).abs() < 1.0, "x = {}", p.x);
        assert!((p.y - 139.5).abs() < 1.0, "y = {}", p.y);
    }

    #[test]
    fn test_position_scales_into_roi() {
        let p = reference_to_screen(
            Point2::new(500.0, 250.0),
            1000,
            1000,
            &ScreenRegion::new(524, 84, 866, 926),
        );
        assert!((p.x - (524.0 + 433.0)).abs() < 1e-9);
        assert!((p.y - (84.0 + 231.5)).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_correspondences() {
        let src = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        let dst: Vec<_> = src.iter().map(|p| Point2::new(p.x + 5.0, p.y + 5.0)).collect();
        assert!(patch_center(&src, &dst, 20, 20, &MatcherConfig::default()).is_none());
    }

    #[test]
    fn test_patch_center_from_translation() {
        let src: Vec<_> = (0..4)
            .flat_map(|y| (0..4).map(move |x| Point2::new(x as f64 * 20.0, y as f64 * 15.0)))
            .collect();
        let dst: Vec<_> = src.iter().map(|p| Point2::new(p.x + 100.0, p.y + 40.0)).collect();
        let c = patch_center(&src, &dst, 61, 41, &MatcherConfig::default()).unwrap();
        assert!((c.x - 130.0).abs() < 1e-6);
        assert!((c.y - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_reference_loaded() {
        let matcher = MapMatcher::new(single_level());
        let patch = RgbaImage::new(80, 80);
        assert!(matcher.locate(&patch, &ScreenRegion::new(0, 0, 10, 10)).is_none());
        assert_eq!(matcher.status().current_map, None);
    }

    #[test]
    fn test_switch_map_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.png");
        texture(160, 160, 3).save(&path).unwrap();

        let matcher = MapMatcher::new(single_level());
        let first = matcher.switch_map("main", &path).unwrap();
        std::fs::remove_file(&path).unwrap();
        // Same name is served from memory even with the file gone
        let second = matcher.switch_map("main", &path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let status = matcher.status();
        assert_eq!(status.current_map.as_deref(), Some("main"));
        assert_eq!((status.width, status.height), (160, 160));
        assert!(status.keypoints > 0);

        assert!(matcher.switch_map("other", &dir.path().join("other.png")).is_err());
        assert_eq!(matcher.status().current_map.as_deref(), Some("main"));
    }

    #[test]
    fn test_concurrent_switches_share_one_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.png");
        texture(160, 160, 5).save(&path).unwrap();

        let matcher = MapMatcher::new(single_level());
        let (a, b) = std::thread::scope(|scope| {
            let a = scope.spawn(|| matcher.switch_map("main", &path).unwrap());
            let b = scope.spawn(|| matcher.switch_map("main", &path).unwrap());
            (a.join().unwrap(), b.join().unwrap())
        });
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &matcher.current().unwrap()));
    }

    #[test]
    fn test_ppi_localizer_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.png");
        let reference = texture(240, 240, 19);
        reference.save(&path).unwrap();

        // Screen shows the map patch at the capture region
        let capture = ScreenRegion::new(300, 10, 120, 120);
        let mut screen = RgbaImage::from_pixel(500, 300, image::Rgba([0, 0, 0, 255]));
        let patch = image::imageops::crop_imm(&reference, 100, 40, 120, 120).to_image();
        image::imageops::replace(&mut screen, &to_rgba(&patch), 300, 10);

        let localizer = PpiLocalizer::new(
            Arc::new(FrameSampler::new(screen)),
            Arc::new(MapMatcher::new(single_level())),
            capture,
            ScreenRegion::new(0, 0, 480, 480),
            "main",
            path,
        );
        let p = localizer.locate().unwrap();
        // Reference centre (159.5, 99.5) doubled into the 480 px ROI
        assert!((p.x - 319.0).abs() < 2.0, "x = {}", p.x);
        assert!((p.y - 199.0).abs() < 2.0, "y = {}", p.y);
    }
}
