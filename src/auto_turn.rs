//! Closed-loop camera turning towards a waypoint.
//!
//! Each attempt re-samples the heading, requests a rotation proportional to
//! the remaining error and waits for the camera to settle. Runs on a
//! blocking thread; the stop flag is checked before every attempt.

use crate::context::PoseSensor;
use crate::error::NavError;
use crate::feedback::CameraActuator;
use sonar_data::AutoTurnConfig;
use sonar_state::bearing::{bearing_degrees, relative_angle};
use sonar_state::ScreenPoint;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnOutcome {
    /// Within tolerance after this many rotations
    Aligned { rotations: u32 },
    Cancelled,
}

/// Rotation to request for a signed error. Never below `min_step_deg`, so
/// every attempt makes progress.
pub fn turn_step(error_deg: f64, config: &AutoTurnConfig) -> f64 {
    let magnitude = (error_deg.abs() * config.gain).clamp(config.min_step_deg, config.max_step_deg);
    magnitude.copysign(error_deg)
}

fn sample_heading(sensor: &dyn PoseSensor, config: &AutoTurnConfig) -> Option<f64> {
    for attempt in 0..config.sensor_retries.max(1) {
        if let Some(h) = sensor.heading() {
            return Some(h);
        }
        debug!("Heading unavailable (try {})", attempt + 1);
    }
    None
}

/// Turn the camera until the player faces `target`.
///
/// Fails with `TurnIncomplete` once the attempt budget is spent, with
/// `SensorUnavailable` when the heading cannot be read, and with
/// `ActuatorFailure` when a rotation request is rejected.
pub fn turn_towards(
    sensor: &dyn PoseSensor,
    camera: &dyn CameraActuator,
    player: ScreenPoint,
    target: ScreenPoint,
    config: &AutoTurnConfig,
    stop: &AtomicBool,
) -> Result<TurnOutcome, NavError> {
    let bearing = bearing_degrees(&player, &target);
    let mut error = 0.0;

    for rotations in 0..=config.max_attempts {
        if stop.load(Ordering::Relaxed) {
            return Ok(TurnOutcome::Cancelled);
        }
        let heading = sample_heading(sensor, config).ok_or(NavError::SensorUnavailable)?;
        error = relative_angle(heading, bearing);
        if error.abs() <= config.tolerance_deg {
            debug!("Aligned to {:.0} deg after {} rotations", bearing, rotations);
            return Ok(TurnOutcome::Aligned { rotations });
        }
        if rotations == config.max_attempts {
            break;
        }

        let step = turn_step(error, config);
        camera
            .rotate(step)
            .map_err(|e| NavError::ActuatorFailure(format!("{:#}", e)))?;
        std::thread::sleep(config.settle());
    }

    Err(NavError::TurnIncomplete {
        attempts: config.max_attempts,
        error_deg: error,
    })
}
