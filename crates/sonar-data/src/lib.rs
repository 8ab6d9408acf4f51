use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sonar_capture::{regions, ScreenRegion};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config file location
pub const CONFIG_ENV: &str = "SONAR_NAV_CONFIG";

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "sonar-nav.toml";

/// Name of the map used when nothing else is configured
pub const DEFAULT_MAP: &str = "main";

/// Name of the legacy island, which has its own HUD layout
pub const LEGACY_MAP: &str = "o g";

/// Avatar icon detection on the full map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub roi: ScreenRegion,
    /// Integer upscale applied before thresholding. Coupled to the area band.
    pub scale_factor: u32,
    /// Minimum value on every RGB channel for a pixel to count as icon white
    pub white_threshold: u8,
    /// Exclusive lower bound of the accepted contour area (upscaled pixels)
    pub min_area: f64,
    /// Exclusive upper bound of the accepted contour area (upscaled pixels)
    pub max_area: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            roi: regions::map_roi(),
            scale_factor: 4,
            white_threshold: 253,
            min_area: 1008.0,
            max_area: 1386.0,
        }
    }
}

/// Avatar icon detection on the minimap (heading only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimapConfig {
    pub region: ScreenRegion,
    pub scale_factor: u32,
    pub white_threshold: u8,
    pub min_area: f64,
    pub max_area: f64,
}

impl Default for MinimapConfig {
    fn default() -> Self {
        Self {
            region: regions::minimap_icon(),
            scale_factor: 4,
            white_threshold: 226,
            min_area: 650.0,
            max_area: 1130.0,
        }
    }
}

/// Map matching against the reference map image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpiConfig {
    pub capture: ScreenRegion,
    /// Lowe ratio: keep a match only if best < ratio * second best
    pub ratio: f32,
    pub min_matches: usize,
    /// RANSAC inlier reprojection error in reference pixels
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
    /// Seed for RANSAC sampling, so repeated runs agree
    pub ransac_seed: u64,
    pub fast_threshold: u8,
    pub pyramid_levels: usize,
    /// Keypoints kept for a captured patch
    pub patch_features: usize,
    /// Keypoints kept for a reference map
    pub reference_features: usize,
}

impl Default for PpiConfig {
    fn default() -> Self {
        Self {
            capture: regions::ppi_capture(),
            ratio: 0.75,
            min_matches: 10,
            ransac_threshold: 5.0,
            ransac_iterations: 500,
            ransac_seed: 0x5eed,
            fast_threshold: 20,
            pyramid_levels: 4,
            patch_features: 1000,
            reference_features: 20000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathfindingConfig {
    pub check_interval_ms: u64,
    /// A waypoint counts as reached inside this many screen pixels
    pub point_radius_px: f64,
    pub ping_interval_ms: u64,
    /// Distance in meters at which ping volume falls to zero
    pub ping_volume_max_distance: f64,
    pub facing_threshold_deg: f64,
    pub perform_facing_check: bool,
    /// Rotate the camera towards waypoints instead of playing pings
    pub auto_turn: bool,
    /// Route segments longer than this (Manhattan, grid cells) are re-planned
    pub max_segment_distance: u32,
    /// Minimum spacing (Chebyshev, grid cells) between kept route points
    pub thin_stride: u32,
    /// Locate the player by map matching instead of the full-map icon
    pub use_map_matching: bool,
}

impl Default for PathfindingConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 200,
            point_radius_px: 4.0,
            ping_interval_ms: 500,
            ping_volume_max_distance: 100.0,
            facing_threshold_deg: 30.0,
            perform_facing_check: true,
            auto_turn: false,
            max_segment_distance: 50,
            thin_stride: 3,
            use_map_matching: true,
        }
    }
}

impl PathfindingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTurnConfig {
    pub tolerance_deg: f64,
    pub max_attempts: u32,
    /// Heading misses tolerated at the start of a turn before giving up
    pub sensor_retries: u32,
    /// Rotation requested per degree of error
    pub gain: f64,
    pub max_step_deg: f64,
    pub min_step_deg: f64,
    /// Time allowed for a rotation to finish before re-sampling
    pub settle_ms: u64,
    pub interval_ms: u64,
}

impl Default for AutoTurnConfig {
    fn default() -> Self {
        Self {
            tolerance_deg: 10.0,
            max_attempts: 20,
            sensor_retries: 3,
            gain: 0.8,
            max_step_deg: 90.0,
            min_step_deg: 2.0,
            settle_ms: 100,
            interval_ms: 500,
        }
    }
}

impl AutoTurnConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long stop waits for each background task
    pub join_timeout_ms: u64,
    /// Consecutive position misses before navigation is abandoned
    pub failure_threshold: u32,
    pub stall_interval_ms: u64,
    /// Movement below this many pixels per stall check counts as standing still
    pub min_movement_px: f64,
    /// Consecutive still checks before reporting
    pub stall_checks: u32,
    /// Consecutive incomplete turns before asking the player to turn manually
    pub turn_failure_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 3000,
            failure_threshold: 3,
            stall_interval_ms: 1000,
            min_movement_px: 2.0,
            stall_checks: 3,
            turn_failure_limit: 3,
        }
    }
}

impl SessionConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn stall_interval(&self) -> Duration {
        Duration::from_millis(self.stall_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub dir: PathBuf,
    /// Terrain overlay, relative to `dir`
    pub overlay: PathBuf,
    /// Directory of reference maps (`<name>.png`), relative to `dir`
    pub maps: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("assets"),
            overlay: PathBuf::from("overlay.png"),
            maps: PathBuf::from("maps"),
        }
    }
}

/// Per-map overrides of HUD coordinates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOverride {
    pub minimap: Option<ScreenRegion>,
    pub minimap_min_area: Option<f64>,
    pub minimap_max_area: Option<f64>,
    pub ppi_capture: Option<ScreenRegion>,
    pub roi: Option<ScreenRegion>,
}

fn default_maps() -> BTreeMap<String, MapOverride> {
    let mut maps = BTreeMap::new();
    maps.insert(
        LEGACY_MAP.to_string(),
        MapOverride {
            minimap: Some(regions::minimap_icon_legacy()),
            minimap_min_area: Some(800.0),
            minimap_max_area: Some(1100.0),
            ppi_capture: Some(regions::ppi_capture_legacy()),
            roi: None,
        },
    );
    maps
}

fn default_current_map() -> String {
    DEFAULT_MAP.to_string()
}

/// Fully resolved HUD layout for one map
#[derive(Debug, Clone, PartialEq)]
pub struct MapProfile {
    pub name: String,
    pub roi: ScreenRegion,
    pub ppi_capture: ScreenRegion,
    pub minimap: MinimapConfig,
}

/// Every tunable the engine reads. Missing keys fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavConfig {
    #[serde(default = "default_current_map")]
    pub current_map: String,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub minimap: MinimapConfig,
    #[serde(default)]
    pub ppi: PpiConfig,
    #[serde(default)]
    pub pathfinding: PathfindingConfig,
    #[serde(default)]
    pub auto_turn: AutoTurnConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default = "default_maps")]
    pub maps: BTreeMap<String, MapOverride>,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            current_map: default_current_map(),
            detection: DetectionConfig::default(),
            minimap: MinimapConfig::default(),
            ppi: PpiConfig::default(),
            pathfinding: PathfindingConfig::default(),
            auto_turn: AutoTurnConfig::default(),
            session: SessionConfig::default(),
            assets: AssetsConfig::default(),
            maps: default_maps(),
        }
    }
}

impl NavConfig {
    /// Load the config file, or defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "No config found at {}. Using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Config path from the environment, else the working directory default
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    pub fn overlay_path(&self) -> PathBuf {
        self.assets.dir.join(&self.assets.overlay)
    }

    /// Reference image for a map id such as `main` or `map_reload_pois`
    pub fn map_image_path(&self, map_id: &str) -> PathBuf {
        self.assets
            .dir
            .join(&self.assets.maps)
            .join(format!("{}.png", map_file_stem(map_id)))
    }

    /// Resolve the HUD layout for a map id, applying any overrides
    pub fn map_profile(&self, map_id: &str) -> MapProfile {
        let name = map_file_stem(map_id).to_string();
        let overrides = self.maps.get(&name).cloned().unwrap_or_default();

        let mut minimap = self.minimap.clone();
        if let Some(region) = overrides.minimap {
            minimap.region = region;
        }
        if let Some(min) = overrides.minimap_min_area {
            minimap.min_area = min;
        }
        if let Some(max) = overrides.minimap_max_area {
            minimap.max_area = max;
        }

        MapProfile {
            roi: overrides.roi.unwrap_or(self.detection.roi),
            ppi_capture: overrides.ppi_capture.unwrap_or(self.ppi.capture),
            minimap,
            name,
        }
    }

    pub fn current_profile(&self) -> MapProfile {
        self.map_profile(&self.current_map)
    }
}

/// Map ids of the form `map_<name>_pois` load `<name>.png`.
pub fn map_file_stem(map_id: &str) -> &str {
    if let Some(rest) = map_id.strip_prefix("map_") {
        if let Some(idx) = rest.find("_pois") {
            return &rest[..idx];
        }
    }
    map_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_nonexistent_uses_defaults() {
        let config = NavConfig::load(Path::new("/nonexistent/sonar-nav.toml")).unwrap();
        assert_eq!(config, NavConfig::default());
        assert_eq!(config.detection.scale_factor, 4);
        assert_eq!(config.ppi.min_matches, 10);
    }

    #[test]
    fn test_partial_file_falls_back_per_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
current_map = "map_reload_pois"

[pathfinding]
auto_turn = true
point_radius_px = 6.5

[auto_turn]
tolerance_deg = 5.0
"#
        )
        .unwrap();

        let config = NavConfig::load(file.path()).unwrap();
        assert!(config.pathfinding.auto_turn);
        assert_eq!(config.pathfinding.point_radius_px, 6.5);
        assert_eq!(config.pathfinding.check_interval_ms, 200);
        assert_eq!(config.auto_turn.tolerance_deg, 5.0);
        assert_eq!(config.auto_turn.max_attempts, 20);
        assert_eq!(config.current_profile().name, "reload");
        assert!(config.maps.contains_key(LEGACY_MAP));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pathfinding]\nauto_turn = \"sometimes\"").unwrap();
        assert!(NavConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_map_file_stem() {
        assert_eq!(map_file_stem("main"), "main");
        assert_eq!(map_file_stem("map_reload_pois"), "reload");
        assert_eq!(map_file_stem("map_blitz"), "map_blitz");
        assert_eq!(map_file_stem(LEGACY_MAP), LEGACY_MAP);
    }

    #[test]
    fn test_legacy_profile_overrides_minimap() {
        let config = NavConfig::default();
        let legacy = config.map_profile(LEGACY_MAP);
        assert_eq!(legacy.minimap.region, regions::minimap_icon_legacy());
        assert_eq!(legacy.minimap.min_area, 800.0);
        assert_eq!(legacy.ppi_capture, regions::ppi_capture_legacy());
        assert_eq!(legacy.roi, regions::map_roi());

        let main = config.map_profile(DEFAULT_MAP);
        assert_eq!(main.minimap.region, regions::minimap_icon());
        assert_eq!(main.minimap.max_area, 1130.0);
    }

    #[test]
    fn test_asset_paths() {
        let config = NavConfig::default();
        assert_eq!(config.overlay_path(), PathBuf::from("assets/overlay.png"));
        assert_eq!(
            config.map_image_path("map_reload_pois"),
            PathBuf::from("assets/maps/reload.png")
        );
    }
}
