use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

/// Fixed, non-directional sounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cue {
    PointReached,
    Facing,
    Arrived,
}

/// Audio output for navigation pings.
pub trait SpatialAudio: Send + Sync {
    /// `bearing_degrees` is signed in [-180, 180): negative is to the left
    /// of the player's facing direction.
    fn play_ping(&self, bearing_degrees: f64, distance_meters: f64) -> Result<()>;

    fn play_cue(&self, cue: Cue) -> Result<()>;
}

/// Camera rotation through the input-simulation layer. Fire and forget;
/// the rotation is assumed to finish within the auto-turn settle time.
pub trait CameraActuator: Send + Sync {
    fn rotate(&self, delta_degrees: f64) -> Result<()>;
}

/// Channel gains for one ping
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StereoMix {
    pub volume: f64,
    pub left: f64,
    pub right: f64,
}

impl StereoMix {
    /// Louder when closer; panned hard once the target is 90 degrees or
    /// more off-axis.
    pub fn new(bearing_degrees: f64, distance_meters: f64, max_distance_meters: f64) -> Self {
        let falloff = if max_distance_meters > 0.0 {
            (distance_meters / max_distance_meters).min(1.0)
        } else {
            1.0
        };
        let pan = (bearing_degrees / 90.0).clamp(-1.0, 1.0);
        Self {
            volume: 1.0 - falloff.max(0.0),
            left: ((1.0 - pan) / 2.0).clamp(0.0, 1.0),
            right: ((1.0 + pan) / 2.0).clamp(0.0, 1.0),
        }
    }
}

/// Audio backend that only logs what it would play
#[derive(Debug, Clone, Copy)]
pub struct LoggingAudio {
    max_distance_meters: f64,
}

impl LoggingAudio {
    pub fn new(max_distance_meters: f64) -> Self {
        Self {
            max_distance_meters,
        }
    }
}

impl SpatialAudio for LoggingAudio {
    fn play_ping(&self, bearing_degrees: f64, distance_meters: f64) -> Result<()> {
        let mix = StereoMix::new(bearing_degrees, distance_meters, self.max_distance_meters);
        debug!(
            "Ping {:+.0} deg at {:.0} m (volume {:.2}, L {:.2} R {:.2})",
            bearing_degrees, distance_meters, mix.volume, mix.left, mix.right
        );
        Ok(())
    }

    fn play_cue(&self, cue: Cue) -> Result<()> {
        info!("Cue: {:?}", cue);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCamera;

impl CameraActuator for LoggingCamera {
    fn rotate(&self, delta_degrees: f64) -> Result<()> {
        info!("Rotate camera {:+.1} deg", delta_degrees);
        Ok(())
    }
}
