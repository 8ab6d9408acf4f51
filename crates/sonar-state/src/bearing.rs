//! Compass math shared by the localizers, the navigation loops and the
//! feedback text.
//!
//! Screen space has y growing downwards. Compass angles put 0° at North
//! (screen up) and grow clockwise.

use crate::{normalize_heading, ScreenPoint};

/// Compass angle of the vector (dx, dy) given in screen axes.
pub fn vector_heading(dx: f64, dy: f64) -> f64 {
    normalize_heading(90.0 - (-dy).atan2(dx).to_degrees())
}

/// Compass bearing from `from` to `to`
pub fn bearing_degrees(from: &ScreenPoint, to: &ScreenPoint) -> f64 {
    vector_heading(to.x - from.x, to.y - from.y)
}

/// Signed turn from `heading` to `bearing` in [-180, 180). Positive means
/// turn clockwise (right).
pub fn relative_angle(heading: f64, bearing: f64) -> f64 {
    (bearing - heading + 180.0).rem_euclid(360.0) - 180.0
}

const CARDINALS: [&str; 8] = [
    "North",
    "Northeast",
    "East",
    "Southeast",
    "South",
    "Southwest",
    "West",
    "Northwest",
];

pub fn cardinal_direction(angle: f64) -> &'static str {
    let index = ((angle + 22.5).rem_euclid(360.0) / 45.0) as usize;
    CARDINALS[index.min(7)]
}

/// Describe where something at compass `target` lies for a player facing
/// `heading`.
pub fn relative_direction(heading: f64, target: f64) -> &'static str {
    let diff = (target - heading).rem_euclid(360.0);
    match diff {
        d if !(22.5..337.5).contains(&d) => "in front",
        d if d < 67.5 => "in front and to the right",
        d if d < 112.5 => "to the right",
        d if d < 157.5 => "behind and to the right",
        d if d < 202.5 => "behind",
        d if d < 247.5 => "behind and to the left",
        d if d < 292.5 => "to the left",
        _ => "in front and to the left",
    }
}
