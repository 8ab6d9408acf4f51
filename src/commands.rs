//! One-shot queries behind the CLI subcommands. Each returns a JSON payload
//! for printing.

use crate::context::{LocalizationContext, PoseSensor};
use crate::controller::NavStatus;
use crate::error::NavError;
use anyhow::Context;
use serde_json::{json, Value};
use sonar_state::{
    bearing_degrees, cardinal_direction, relative_direction, Destination, ScreenPoint,
};

/// Current pose from the icon, or from map matching when `use_ppi` is set
pub fn locate(context: &LocalizationContext, use_ppi: bool) -> Value {
    if use_ppi {
        if let Err(e) = context.prepare_map() {
            tracing::warn!("{}", e);
        }
    }
    let pose = context.sensor().pose(use_ppi);
    let source = if use_ppi { "map_matching" } else { "icon" };
    json!({
        "source": source,
        "pose": pose,
        "direction": pose.heading.map(cardinal_direction),
        "matcher": context.matcher_status(),
    })
}

pub fn heading(context: &LocalizationContext) -> Value {
    let heading = context.sensor().heading();
    json!({
        "heading": heading,
        "direction": heading.map(cardinal_direction),
    })
}

/// Plan from the current position to `goal` without starting navigation
pub fn plan(context: &LocalizationContext, goal: ScreenPoint) -> Result<Value, NavError> {
    context.planner()?;
    let use_map_matching = context.config().pathfinding.use_map_matching;
    let pose = context.sensor().pose(use_map_matching);
    let start = pose.position.ok_or(NavError::SensorUnavailable)?;
    let route = plan_between(context, start, goal)?;
    Ok(json!({
        "start": start,
        "goal": goal,
        "direction": next_direction(start, pose.heading, &route),
        "waypoints": route,
    }))
}

/// Where the first waypoint away from `start` lies relative to the facing.
/// The start waypoint sits underfoot, so it is skipped.
fn next_direction(
    start: ScreenPoint,
    heading: Option<f64>,
    route: &[ScreenPoint],
) -> Option<&'static str> {
    let next = route.iter().find(|w| w.distance(&start) > 0.0)?;
    Some(relative_direction(heading?, bearing_degrees(&start, next)))
}

/// Destination from a single `"Name, x, y"` selection or from separate
/// name, x and y arguments.
pub fn destination_from_args(args: &[String]) -> anyhow::Result<Destination> {
    match args {
        [selection] => Destination::parse_selection(selection),
        [name, x, y] => {
            let x: f64 = x.parse().with_context(|| format!("Invalid x coordinate '{}'", x))?;
            let y: f64 = y.parse().with_context(|| format!("Invalid y coordinate '{}'", y))?;
            Ok(Destination::new(name.as_str(), ScreenPoint::new(x, y)))
        }
        _ => anyhow::bail!("Expected '<name>, <x>, <y>' or <name> <x> <y>"),
    }
}

/// The candidate nearest to the player's current position
pub fn closest_destination(
    context: &LocalizationContext,
    candidates: &[Destination],
) -> Result<Destination, NavError> {
    if candidates.is_empty() {
        return Err(NavError::InvalidEndpoint("no destinations given".to_string()));
    }
    let use_map_matching = context.config().pathfinding.use_map_matching;
    let from = context
        .sensor()
        .pose(use_map_matching)
        .position
        .ok_or(NavError::SensorUnavailable)?;
    let chosen = closest_to(from, candidates)?;
    tracing::info!("Closest of {} destinations is {}", candidates.len(), chosen.name);
    Ok(chosen)
}

fn closest_to(from: ScreenPoint, candidates: &[Destination]) -> Result<Destination, NavError> {
    Destination::closest(from, candidates)
        .ok_or_else(|| NavError::InvalidEndpoint("no destinations given".to_string()))
}

/// Route between two explicit screen points
pub fn plan_between(
    context: &LocalizationContext,
    start: ScreenPoint,
    goal: ScreenPoint,
) -> Result<Vec<ScreenPoint>, NavError> {
    let planner = context.planner()?;
    Ok(planner.plan(start, goal)?.waypoints)
}

pub fn status(status: &NavStatus) -> Value {
    json!({
        "state": status.state,
        "goal": status.goal,
        "cursor": status.cursor,
        "routeLength": status.route_len,
        "pose": status.pose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NavState;
    use image::RgbaImage;
    use sonar_capture::{FrameSampler, ScreenRegion};
    use sonar_data::NavConfig;
    use sonar_route::{CostGrid, Terrain};
    use std::sync::Arc;

    fn context() -> LocalizationContext {
        let mut config = NavConfig::default();
        config.detection.roi = ScreenRegion::new(0, 0, 20, 20);
        LocalizationContext::with_grid(
            config,
            Arc::new(FrameSampler::new(RgbaImage::new(32, 32))),
            CostGrid::filled(20, 20, Terrain::Open),
        )
    }

    #[test]
    fn test_locate_without_icon_reports_nulls() {
        let value = locate(&context(), false);
        assert_eq!(value["source"], "icon");
        assert_eq!(value["pose"]["position"], Value::Null);
        assert_eq!(value["direction"], Value::Null);
        assert_eq!(value["matcher"]["current_map"], Value::Null);
    }

    #[test]
    fn test_plan_needs_a_position() {
        assert_eq!(
            plan(&context(), ScreenPoint::new(5.0, 5.0)).unwrap_err(),
            NavError::SensorUnavailable
        );
    }

    #[test]
    fn test_plan_between_points() {
        let route = plan_between(
            &context(),
            ScreenPoint::new(0.0, 0.0),
            ScreenPoint::new(0.0, 9.0),
        )
        .unwrap();
        assert_eq!(route.first(), Some(&ScreenPoint::new(0.0, 0.0)));
        assert_eq!(route.last(), Some(&ScreenPoint::new(0.0, 9.0)));
    }

    #[test]
    fn test_destination_from_selection_or_parts() {
        let selection = vec!["Lazy Lake, 120, 340.5".to_string()];
        assert_eq!(
            destination_from_args(&selection).unwrap(),
            Destination::new("Lazy Lake", ScreenPoint::new(120.0, 340.5))
        );

        let parts: Vec<String> = ["Retail Row", "9", "4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            destination_from_args(&parts).unwrap(),
            Destination::new("Retail Row", ScreenPoint::new(9.0, 4.0))
        );

        assert!(destination_from_args(&["Retail Row".to_string(), "9".to_string()]).is_err());
        assert!(destination_from_args(&["Retail Row, nine, 4".to_string()]).is_err());
    }

    #[test]
    fn test_closest_destination() {
        let candidates = vec![
            Destination::new("Far", ScreenPoint::new(19.0, 19.0)),
            Destination::new("Near", ScreenPoint::new(3.0, 2.0)),
        ];
        let chosen = closest_to(ScreenPoint::new(0.0, 0.0), &candidates).unwrap();
        assert_eq!(chosen.name, "Near");
        assert!(matches!(
            closest_to(ScreenPoint::new(0.0, 0.0), &[]),
            Err(NavError::InvalidEndpoint(_))
        ));

        // No icon on screen, so no position to measure from
        assert_eq!(
            closest_destination(&context(), &candidates).unwrap_err(),
            NavError::SensorUnavailable
        );
    }

    #[test]
    fn test_next_direction_skips_start_waypoint() {
        let start = ScreenPoint::new(0.0, 0.0);
        let route = [start, ScreenPoint::new(5.0, 0.0), ScreenPoint::new(5.0, 9.0)];
        // Facing North with the route heading East
        assert_eq!(next_direction(start, Some(0.0), &route), Some("to the right"));
        assert_eq!(next_direction(start, Some(90.0), &route), Some("in front"));
        assert_eq!(next_direction(start, Some(180.0), &route), Some("to the left"));
        assert_eq!(next_direction(start, None, &route), None);
        assert_eq!(next_direction(start, Some(0.0), &[start]), None);
    }

    #[test]
    fn test_status_payload() {
        let value = status(&NavStatus {
            state: NavState::Active,
            goal: Some("Lazy Lake".to_string()),
            cursor: 2,
            route_len: 7,
            ..NavStatus::default()
        });
        assert_eq!(value["state"], "active");
        assert_eq!(value["goal"], "Lazy Lake");
        assert_eq!(value["routeLength"], 7);
    }
}
