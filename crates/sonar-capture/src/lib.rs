use anyhow::{bail, Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use xcap::Monitor;

/// Rectangular screen area in full-screen pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ScreenRegion {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a region from its top-left (inclusive) and bottom-right (exclusive) corners.
    pub const fn from_corners(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            x: start.0,
            y: start.1,
            width: end.0.saturating_sub(start.0),
            height: end.1.saturating_sub(start.1),
        }
    }

    pub fn end(&self) -> (u32, u32) {
        (self.x + self.width, self.y + self.height)
    }

    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x as f64
            && py >= self.y as f64
            && px < (self.x + self.width) as f64
            && py < (self.y + self.height) as f64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Well-known screen regions for a 1920x1080 reference resolution
pub mod regions {
    use super::ScreenRegion;

    /// Full-map area the avatar icon is searched in. Also the coordinate
    /// frame that terrain overlays and reference maps are scaled into.
    pub const fn map_roi() -> ScreenRegion {
        ScreenRegion::from_corners((524, 84), (1390, 1010))
    }

    /// Avatar icon at the centre of the minimap.
    pub const fn minimap_icon() -> ScreenRegion {
        ScreenRegion::from_corners((1745, 144), (1776, 174))
    }

    /// Minimap icon for the legacy ("o g") island.
    pub const fn minimap_icon_legacy() -> ScreenRegion {
        ScreenRegion::from_corners((1735, 154), (1766, 184))
    }

    /// Patch captured for map matching when the full map is closed.
    pub const fn ppi_capture() -> ScreenRegion {
        ScreenRegion::new(1637, 33, 250, 250)
    }

    /// Map matching patch for the legacy island.
    pub const fn ppi_capture_legacy() -> ScreenRegion {
        ScreenRegion::new(1600, 20, 300, 300)
    }
}

/// Source of screen pixels. Captures are synchronous and bounded.
pub trait ScreenSampler: Send + Sync {
    fn capture(&self, region: &ScreenRegion) -> Result<RgbaImage>;
}

/// Samples the primary display through xcap.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisplaySampler;

impl DisplaySampler {
    pub fn new() -> Self {
        Self
    }
}

/// Find the primary monitor, falling back to the first one reported
fn primary_monitor() -> Result<Monitor> {
    let monitors = Monitor::all().context("Failed to enumerate monitors")?;
    let mut first = None;
    for monitor in monitors {
        if monitor.is_primary().unwrap_or(false) {
            return Ok(monitor);
        }
        if first.is_none() {
            first = Some(monitor);
        }
    }
    match first {
        Some(m) => {
            warn!("No primary monitor reported, using first available");
            Ok(m)
        }
        None => bail!("No monitors available"),
    }
}

impl ScreenSampler for DisplaySampler {
    fn capture(&self, region: &ScreenRegion) -> Result<RgbaImage> {
        if region.is_empty() {
            bail!("Empty capture region {:?}", region);
        }
        let monitor = primary_monitor()?;
        let frame = monitor
            .capture_image()
            .context("Failed to capture monitor image")?;
        debug!(
            "Captured {}x{} frame from {}",
            frame.width(),
            frame.height(),
            monitor.name().unwrap_or_default()
        );
        crop_region(&frame, region)
    }
}

/// Serves regions out of a fixed screenshot. Used for offline analysis of
/// saved frames and as a deterministic source in tests.
#[derive(Clone)]
pub struct FrameSampler {
    frame: Arc<RwLock<Arc<RgbaImage>>>,
}

impl FrameSampler {
    pub fn new(frame: RgbaImage) -> Self {
        Self {
            frame: Arc::new(RwLock::new(Arc::new(frame))),
        }
    }

    /// Load a screenshot from disk
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .to_rgba8();
        Ok(Self::new(img))
    }

    /// Replace the frame served to subsequent captures
    pub fn set_frame(&self, frame: RgbaImage) {
        if let Ok(mut guard) = self.frame.write() {
            *guard = Arc::new(frame);
        }
    }

    fn current(&self) -> Option<Arc<RgbaImage>> {
        self.frame.read().ok().map(|g| g.clone())
    }
}

impl ScreenSampler for FrameSampler {
    fn capture(&self, region: &ScreenRegion) -> Result<RgbaImage> {
        let frame = self
            .current()
            .context("Frame lock poisoned")?;
        crop_region(&frame, region)
    }
}

/// Crop a pixel region out of a captured frame.
///
/// The region is clamped to the frame; a region that lies entirely outside
/// the frame is an error.
pub fn crop_region(frame: &RgbaImage, region: &ScreenRegion) -> Result<RgbaImage> {
    let (w, h) = (frame.width(), frame.height());
    if region.x >= w || region.y >= h {
        bail!(
            "Region {:?} lies outside the {}x{} frame",
            region,
            w,
            h
        );
    }

    // Clamp to image bounds
    let rw = region.width.min(w - region.x);
    let rh = region.height.min(h - region.y);
    if rw == 0 || rh == 0 {
        bail!("Region {:?} is empty after clamping", region);
    }

    Ok(image::imageops::crop_imm(frame, region.x, region.y, rw, rh).to_image())
}
