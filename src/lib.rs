//! Audio navigation engine: screen-based localization, route planning over
//! the terrain overlay and the guidance loops that run a navigation session.

pub mod auto_turn;
pub mod commands;
pub mod context;
pub mod controller;
pub mod error;
pub mod feedback;

pub use auto_turn::{turn_towards, TurnOutcome};
pub use context::{LocalizationContext, PoseSensor, ScreenPoseSensor};
pub use controller::{NavEvent, NavState, NavStatus, NavigationController, StopSignal, Toggle};
pub use error::NavError;
pub use feedback::{CameraActuator, Cue, LoggingAudio, LoggingCamera, SpatialAudio, StereoMix};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sonar_nav=debug,sonar_nav_lib=debug,sonar_vision=debug,sonar_capture=debug".into()
            }),
        )
        .init();
}
