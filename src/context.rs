use crate::error::NavError;
use sonar_capture::ScreenSampler;
use sonar_data::NavConfig;
use sonar_route::{CostGrid, CostGridBuilder, GridTransform, PathPlanner, PlannerConfig};
use sonar_state::Pose;
use sonar_vision::{
    IconDetector, IconLocalizer, MapMatcher, MatcherConfig, MatcherStatus, MinimapLocalizer,
    PpiLocalizer,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The sensing entry point used by navigation. Calls are synchronous and
/// bounded by one screen capture plus its analysis.
pub trait PoseSensor: Send + Sync {
    /// Position from map matching when `use_map_matching` is set, else from
    /// the full-map icon.
    fn pose(&self, use_map_matching: bool) -> Pose;

    /// Heading from the cheaper minimap sensor
    fn heading(&self) -> Option<f64>;
}

/// Pose sensing from live screen pixels.
pub struct ScreenPoseSensor {
    icon: IconLocalizer,
    minimap: MinimapLocalizer,
    ppi: PpiLocalizer,
}

impl ScreenPoseSensor {
    pub fn new(icon: IconLocalizer, minimap: MinimapLocalizer, ppi: PpiLocalizer) -> Self {
        Self { icon, minimap, ppi }
    }
}

impl PoseSensor for ScreenPoseSensor {
    fn pose(&self, use_map_matching: bool) -> Pose {
        if use_map_matching {
            return Pose::new(self.ppi.locate(), self.minimap.heading());
        }
        let pose = self.icon.locate();
        if pose.heading.is_some() {
            return pose;
        }
        // Icon covered by UI: the minimap still knows which way we face
        pose.or(Pose::new(None, self.minimap.heading()))
    }

    fn heading(&self) -> Option<f64> {
        self.minimap.heading()
    }
}

/// Owns everything the sensors and planner share for the life of the
/// process: the config snapshot, screen access, the terrain grid and the
/// map-matching reference cache.
pub struct LocalizationContext {
    config: Arc<NavConfig>,
    sampler: Arc<dyn ScreenSampler>,
    matcher: Arc<MapMatcher>,
    planner: Result<Arc<PathPlanner>, NavError>,
}

impl LocalizationContext {
    /// Build the context, loading the terrain overlay. A missing overlay
    /// only disables planning.
    pub fn new(config: NavConfig, sampler: Arc<dyn ScreenSampler>) -> Self {
        let overlay = config.overlay_path();
        let planner = match CostGridBuilder::default().load(&overlay) {
            Ok(grid) => Ok(build_planner(&config, grid)),
            Err(e) => {
                warn!("Pathfinding disabled: {:#}", e);
                Err(NavError::NotInitialised(format!(
                    "cost grid ({})",
                    overlay.display()
                )))
            }
        };
        Self::assemble(config, sampler, planner)
    }

    /// Build the context around an already classified grid
    pub fn with_grid(config: NavConfig, sampler: Arc<dyn ScreenSampler>, grid: CostGrid) -> Self {
        let planner = Ok(build_planner(&config, grid));
        Self::assemble(config, sampler, planner)
    }

    fn assemble(
        config: NavConfig,
        sampler: Arc<dyn ScreenSampler>,
        planner: Result<Arc<PathPlanner>, NavError>,
    ) -> Self {
        let matcher = Arc::new(MapMatcher::new(MatcherConfig::from_ppi(&config.ppi)));
        info!(
            "Localization context ready for map '{}' (pathfinding {})",
            config.current_map,
            if planner.is_ok() { "enabled" } else { "disabled" }
        );
        Self {
            config: Arc::new(config),
            sampler,
            matcher,
            planner,
        }
    }

    pub fn config(&self) -> Arc<NavConfig> {
        self.config.clone()
    }

    pub fn planner(&self) -> Result<Arc<PathPlanner>, NavError> {
        self.planner.clone()
    }

    pub fn matcher(&self) -> Arc<MapMatcher> {
        self.matcher.clone()
    }

    pub fn matcher_status(&self) -> MatcherStatus {
        self.matcher.status()
    }

    /// Load the reference image for the configured map ahead of the first
    /// map-matching request.
    pub fn prepare_map(&self) -> Result<(), NavError> {
        let profile = self.config.current_profile();
        let name = &profile.name;
        let path = self.config.map_image_path(name);
        self.matcher
            .switch_map(name, &path)
            .map(|reference| {
                debug!(
                    "Map '{}' ready with {} keypoints",
                    reference.name,
                    reference.keypoint_count()
                );
            })
            .map_err(|e| NavError::MapUnavailable(format!("{:#}", e)))
    }

    /// Screen sensors laid out for the configured map
    pub fn sensor(&self) -> Arc<ScreenPoseSensor> {
        let profile = self.config.current_profile();
        let icon = IconLocalizer::new(
            self.sampler.clone(),
            profile.roi,
            IconDetector::from_detection(&self.config.detection),
        );
        let minimap = MinimapLocalizer::new(self.sampler.clone(), &profile.minimap);
        let ppi = PpiLocalizer::new(
            self.sampler.clone(),
            self.matcher.clone(),
            profile.ppi_capture,
            profile.roi,
            profile.name.clone(),
            self.config.map_image_path(&profile.name),
        );
        Arc::new(ScreenPoseSensor::new(icon, minimap, ppi))
    }
}

fn build_planner(config: &NavConfig, grid: CostGrid) -> Arc<PathPlanner> {
    let profile = config.current_profile();
    let transform = GridTransform::for_grid(profile.roi, &grid);
    let planner_config = PlannerConfig {
        max_segment_distance: config.pathfinding.max_segment_distance as usize,
        thin_stride: config.pathfinding.thin_stride as usize,
    };
    Arc::new(PathPlanner::new(Arc::new(grid), transform, planner_config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, RgbaImage};
    use sonar_capture::{FrameSampler, ScreenRegion};
    use sonar_route::Terrain;
    use sonar_state::ScreenPoint;

    fn blank_sampler() -> Arc<dyn ScreenSampler> {
        Arc::new(FrameSampler::new(RgbaImage::new(64, 64)))
    }

    fn config_in(dir: &std::path::Path) -> NavConfig {
        let mut config = NavConfig::default();
        config.assets.dir = dir.to_path_buf();
        config.detection.roi = ScreenRegion::new(0, 0, 20, 20);
        config
    }

    #[test]
    fn test_missing_overlay_disables_planning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalizationContext::new(config_in(dir.path()), blank_sampler());
        assert!(matches!(ctx.planner(), Err(NavError::NotInitialised(_))));
    }

    #[test]
    fn test_overlay_loaded_from_assets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut overlay = RgbImage::from_pixel(20, 20, Rgb([30, 140, 40]));
        overlay.put_pixel(5, 5, Rgb([255, 0, 0]));
        overlay.save(config.overlay_path()).unwrap();

        let ctx = LocalizationContext::new(config, blank_sampler());
        let planner = ctx.planner().unwrap();
        assert_eq!(planner.grid().width(), 20);
        assert_eq!(
            planner.grid().get(sonar_route::GridCell::new(5, 5)),
            Some(Terrain::Blocked)
        );
        let route = planner
            .plan(ScreenPoint::new(0.0, 0.0), ScreenPoint::new(9.0, 0.0))
            .unwrap();
        assert_eq!(route.last(), Some(&ScreenPoint::new(9.0, 0.0)));
    }

    #[test]
    fn test_prepare_map_reports_missing_reference() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalizationContext::with_grid(
            config_in(dir.path()),
            blank_sampler(),
            CostGrid::filled(20, 20, Terrain::Open),
        );
        assert!(matches!(ctx.prepare_map(), Err(NavError::MapUnavailable(_))));
        assert_eq!(ctx.matcher_status().current_map, None);
    }

    #[test]
    fn test_screen_sensor_without_icon_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalizationContext::with_grid(
            config_in(dir.path()),
            blank_sampler(),
            CostGrid::filled(20, 20, Terrain::Open),
        );
        let sensor = ctx.sensor();
        assert!(sensor.pose(false).is_unknown());
        assert!(sensor.pose(true).is_unknown());
        assert_eq!(sensor.heading(), None);
    }
}
