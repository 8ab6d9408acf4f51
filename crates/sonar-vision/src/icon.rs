use crate::contour::find_external_contours;
use crate::mask::{upscale, white_mask};
use crate::triangle::min_enclosing_triangle;
use image::RgbaImage;
use nalgebra::Point2;
use sonar_capture::{ScreenRegion, ScreenSampler};
use sonar_data::{DetectionConfig, MinimapConfig};
use sonar_state::bearing::vector_heading;
use sonar_state::{Pose, ScreenPoint};
use std::sync::Arc;
use tracing::{debug, warn};

/// The avatar glyph found in one capture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlyphDetection {
    /// Centroid in capture pixels (before upscaling)
    pub centroid: Point2<f64>,
    pub heading: f64,
    /// Contour area in upscaled pixels
    pub area: f64,
}

/// Finds the white arrow glyph in a capture. Scale factor and area band are
/// calibrated together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IconDetector {
    pub scale_factor: u32,
    pub white_threshold: u8,
    pub min_area: f64,
    pub max_area: f64,
}

impl IconDetector {
    pub fn from_detection(config: &DetectionConfig) -> Self {
        Self {
            scale_factor: config.scale_factor,
            white_threshold: config.white_threshold,
            min_area: config.min_area,
            max_area: config.max_area,
        }
    }

    pub fn from_minimap(config: &MinimapConfig) -> Self {
        Self {
            scale_factor: config.scale_factor,
            white_threshold: config.white_threshold,
            min_area: config.min_area,
            max_area: config.max_area,
        }
    }

    pub fn detect(&self, capture: &RgbaImage) -> Option<GlyphDetection> {
        let scale = self.scale_factor.max(1);
        let large = upscale(capture, scale);
        let mask = white_mask(&large, self.white_threshold);

        // Largest contour strictly inside the band; ties keep the first
        let mut best = None;
        for contour in find_external_contours(&mask) {
            let area = contour.area();
            if area <= self.min_area || area >= self.max_area {
                continue;
            }
            let Some(centroid) = contour.centroid() else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, _, a)| area > *a) {
                best = Some((contour, centroid, area));
            }
        }

        let Some((contour, centroid, area)) = best else {
            debug!("No glyph in area band ({}, {})", self.min_area, self.max_area);
            return None;
        };

        let Some(triangle) = min_enclosing_triangle(&contour.to_points()) else {
            debug!("Glyph contour of area {:.0} has no enclosing triangle", area);
            return None;
        };
        let tip = triangle.tip();
        let heading = vector_heading(tip.x - centroid.x, tip.y - centroid.y);

        Some(GlyphDetection {
            centroid: Point2::new(centroid.x / scale as f64, centroid.y / scale as f64),
            heading,
            area,
        })
    }
}

/// Position and heading from the avatar glyph on the open full map.
pub struct IconLocalizer {
    sampler: Arc<dyn ScreenSampler>,
    roi: ScreenRegion,
    detector: IconDetector,
}

impl IconLocalizer {
    pub fn new(sampler: Arc<dyn ScreenSampler>, roi: ScreenRegion, detector: IconDetector) -> Self {
        Self {
            sampler,
            roi,
            detector,
        }
    }

    /// Interpret an already-captured ROI image
    pub fn locate_in(&self, capture: &RgbaImage) -> Pose {
        match self.detector.detect(capture) {
            Some(glyph) => {
                let position = ScreenPoint::new(
                    glyph.centroid.x + self.roi.x as f64,
                    glyph.centroid.y + self.roi.y as f64,
                );
                debug!(
                    "Icon at ({:.1}, {:.1}) facing {:.1}",
                    position.x, position.y, glyph.heading
                );
                Pose::new(Some(position), Some(glyph.heading))
            }
            None => Pose::unknown(),
        }
    }

    /// Capture the ROI and locate the icon. Capture failures yield an
    /// unknown pose.
    pub fn locate(&self) -> Pose {
        match self.sampler.capture(&self.roi) {
            Ok(capture) => self.locate_in(&capture),
            Err(e) => {
                warn!("Map capture failed: {:#}", e);
                Pose::unknown()
            }
        }
    }
}

/// Heading only, from the glyph at the centre of the minimap.
pub struct MinimapLocalizer {
    sampler: Arc<dyn ScreenSampler>,
    region: ScreenRegion,
    detector: IconDetector,
}

impl MinimapLocalizer {
    pub fn new(sampler: Arc<dyn ScreenSampler>, config: &MinimapConfig) -> Self {
        Self {
            sampler,
            region: config.region,
            detector: IconDetector::from_minimap(config),
        }
    }

    pub fn heading_in(&self, capture: &RgbaImage) -> Option<f64> {
        self.detector.detect(capture).map(|g| g.heading)
    }

    pub fn heading(&self) -> Option<f64> {
        match self.sampler.capture(&self.region) {
            Ok(capture) => self.heading_in(&capture),
            Err(e) => {
                warn!("Minimap capture failed: {:#}", e);
                None
            }
        }
    }
}
