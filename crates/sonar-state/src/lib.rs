use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub mod bearing;

pub use bearing::{bearing_degrees, cardinal_direction, relative_angle, relative_direction};

/// Pixels on the full map correspond to roughly this many in-game meters.
pub const METERS_PER_PIXEL: f64 = 2.65;

/// A point in full-screen pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &ScreenPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Straight-line distance in in-game meters
    pub fn distance_meters(&self, other: &ScreenPoint) -> f64 {
        self.distance(other) * METERS_PER_PIXEL
    }
}

/// One point along a planned route
pub type Waypoint = ScreenPoint;

/// Player position and heading as sensed this tick.
///
/// Either field may be unknown independently; a pose with a position but
/// no heading is valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Option<ScreenPoint>,
    /// Compass heading: 0 = North, clockwise, in [0, 360)
    pub heading: Option<f64>,
}

impl Pose {
    pub fn new(position: Option<ScreenPoint>, heading: Option<f64>) -> Self {
        Self {
            position,
            heading: heading.map(normalize_heading),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.position.is_none() && self.heading.is_none()
    }

    /// Keep this pose's fields, filling gaps from `other`
    pub fn or(self, other: Pose) -> Pose {
        Pose {
            position: self.position.or(other.position),
            heading: self.heading.or(other.heading),
        }
    }
}

/// Wrap any angle into [0, 360)
pub fn normalize_heading(degrees: f64) -> f64 {
    let h = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if h >= 360.0 {
        0.0
    } else {
        h
    }
}

/// Ordered waypoints from start to goal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn first(&self) -> Option<&Waypoint> {
        self.waypoints.first()
    }

    pub fn last(&self) -> Option<&Waypoint> {
        self.waypoints.last()
    }

    /// Work out how far the cursor moves given the player's position.
    ///
    /// Returns each new cursor value in order; an empty result means no
    /// progress. The cursor only moves forward and stops at `len()`, which
    /// means the route is complete.
    ///
    /// A waypoint counts as reached when the player is within `radius_px` of
    /// it, or when the player is already closer to some later waypoint (the
    /// cursor then jumps to that later waypoint).
    pub fn advance(&self, cursor: usize, player: ScreenPoint, radius_px: f64) -> Vec<usize> {
        let mut steps = Vec::new();
        let mut cursor = cursor;

        while cursor < self.waypoints.len() {
            let to_current = player.distance(&self.waypoints[cursor]);

            let closer_later = (cursor + 1..self.waypoints.len())
                .find(|&i| player.distance(&self.waypoints[i]) < to_current);

            match closer_later {
                Some(i) => {
                    cursor = i;
                    steps.push(cursor);
                }
                None if to_current <= radius_px => {
                    cursor += 1;
                    steps.push(cursor);
                }
                None => break,
            }
        }

        steps
    }
}

/// Where the player wants to go. The name is only used in feedback text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub goal: ScreenPoint,
}

impl Destination {
    pub fn new(name: impl Into<String>, goal: ScreenPoint) -> Self {
        Self {
            name: name.into(),
            goal,
        }
    }

    /// Parse a stored selection of the form `"Name, x, y"`.
    pub fn parse_selection(selection: &str) -> Result<Self> {
        let parts: Vec<&str> = selection.split(',').map(str::trim).collect();
        if parts.len() != 3 || parts[0].is_empty() {
            bail!("Expected 'name, x, y' but got '{}'", selection);
        }
        let x: f64 = parts[1]
            .parse()
            .with_context(|| format!("Invalid x coordinate '{}'", parts[1]))?;
        let y: f64 = parts[2]
            .parse()
            .with_context(|| format!("Invalid y coordinate '{}'", parts[2]))?;
        if !x.is_finite() || !y.is_finite() {
            bail!("Non-finite coordinates in '{}'", selection);
        }
        Ok(Self::new(parts[0], ScreenPoint::new(x, y)))
    }

    /// Pick the destination closest to `from`. Ties keep the earliest entry.
    pub fn closest<'a, I>(from: ScreenPoint, candidates: I) -> Option<Destination>
    where
        I: IntoIterator<Item = &'a Destination>,
    {
        let mut best: Option<(&Destination, f64)> = None;
        for candidate in candidates {
            let d = from.distance(&candidate.goal);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((candidate, d));
            }
        }
        best.map(|(d, _)| d.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_route() -> Route {
        Route::new(
            (0..5)
                .map(|i| ScreenPoint::new(i as f64 * 10.0, 0.0))
                .collect(),
        )
    }

    #[test]
    fn test_pose_serializes_unknown_fields_as_null() {
        let pose = Pose::new(Some(ScreenPoint::new(1.0, 2.0)), None);
        let json = serde_json::to_value(pose).unwrap();
        assert_eq!(json["heading"], serde_json::Value::Null);
        assert_eq!(json["position"]["x"], 1.0);
        assert!(Pose::unknown().is_unknown());
    }

    #[test]
    fn test_pose_normalizes_heading() {
        let pose = Pose::new(None, Some(-90.0));
        assert_eq!(pose.heading, Some(270.0));
        assert_eq!(normalize_heading(720.0), 0.0);
    }

    #[test]
    fn test_pose_or_fills_missing_fields() {
        let icon = Pose::new(Some(ScreenPoint::new(5.0, 5.0)), None);
        let minimap = Pose::new(None, Some(45.0));
        let merged = icon.or(minimap);
        assert_eq!(merged.position, Some(ScreenPoint::new(5.0, 5.0)));
        assert_eq!(merged.heading, Some(45.0));
    }

    #[test]
    fn test_advance_within_radius() {
        let route = straight_route();
        assert_eq!(route.advance(0, ScreenPoint::new(1.0, 0.0), 3.0), vec![1]);
    }

    #[test]
    fn test_advance_no_progress_when_far() {
        let route = straight_route();
        assert!(route.advance(0, ScreenPoint::new(-20.0, 0.0), 3.0).is_empty());
    }

    #[test]
    fn test_advance_skips_to_closer_later_waypoint() {
        let route = straight_route();
        // Player stands next to waypoint 3 while the cursor is still at 0
        let steps = route.advance(0, ScreenPoint::new(31.0, 20.0), 3.0);
        assert_eq!(steps.first(), Some(&1));
        assert_eq!(*steps.last().unwrap(), 3);
        assert!(steps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_advance_completes_route() {
        let route = straight_route();
        let steps = route.advance(4, ScreenPoint::new(40.0, 1.0), 3.0);
        assert_eq!(steps, vec![5]);
        // Already complete: nothing further
        assert!(route.advance(5, ScreenPoint::new(40.0, 1.0), 3.0).is_empty());
    }

    #[test]
    fn test_parse_selection() {
        let d = Destination::parse_selection("Pleasant Park, 712.0, 301").unwrap();
        assert_eq!(d.name, "Pleasant Park");
        assert_eq!(d.goal, ScreenPoint::new(712.0, 301.0));

        assert!(Destination::parse_selection("Only a name").is_err());
        assert!(Destination::parse_selection("Bad, x, 1").is_err());
        assert!(Destination::parse_selection(", 1, 2").is_err());
    }

    #[test]
    fn test_closest_destination() {
        let pois = vec![
            Destination::new("A", ScreenPoint::new(100.0, 100.0)),
            Destination::new("B", ScreenPoint::new(10.0, 10.0)),
            Destination::new("C", ScreenPoint::new(10.0, 10.0)),
        ];
        let closest = Destination::closest(ScreenPoint::new(0.0, 0.0), &pois).unwrap();
        assert_eq!(closest.name, "B");
        assert!(Destination::closest(ScreenPoint::new(0.0, 0.0), &[]).is_none());
    }
}
