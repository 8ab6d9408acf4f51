use sonar_route::PlanError;
use thiserror::Error;

/// Failures surfaced by the navigation core.
///
/// "Not detected this frame" is never an error at the sensor level; it only
/// becomes `SensorUnavailable` where an operation cannot proceed without a
/// position.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NavError {
    #[error("player position unavailable")]
    SensorUnavailable,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no path found: {0}")]
    Unreachable(String),

    #[error("turn not completed after {attempts} attempts, still {error_deg:.1} degrees off")]
    TurnIncomplete { attempts: u32, error_deg: f64 },

    #[error("actuator failure: {0}")]
    ActuatorFailure(String),

    #[error("a navigation session is already active")]
    Busy,

    #[error("{0} not initialised")]
    NotInitialised(String),

    #[error("map unavailable: {0}")]
    MapUnavailable(String),
}

impl From<PlanError> for NavError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::InvalidEndpoint { .. } => NavError::InvalidEndpoint(e.to_string()),
            PlanError::Unreachable { .. } => NavError::Unreachable(e.to_string()),
        }
    }
}
