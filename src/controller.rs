use crate::auto_turn::{turn_towards, TurnOutcome};
use crate::context::{LocalizationContext, PoseSensor};
use crate::error::NavError;
use crate::feedback::{CameraActuator, Cue, SpatialAudio};
use serde::Serialize;
use sonar_data::NavConfig;
use sonar_route::PathPlanner;
use sonar_state::bearing::{bearing_degrees, relative_angle};
use sonar_state::{Destination, Pose, Route, ScreenPoint};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavState {
    Idle,
    Planning,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl NavState {
    pub fn is_running(&self) -> bool {
        matches!(self, NavState::Planning | NavState::Active)
    }
}

/// User-facing navigation signals, rendered as speech or sound by the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NavEvent {
    Started { goal: String, waypoints: usize },
    PositionUnknown,
    NoPath { reason: String },
    WaypointReached { index: usize, remaining: usize },
    Facing { index: usize },
    TurnManually,
    NotMoving,
    Completed { goal: String },
    Cancelled,
    Failed { reason: String },
}

/// Snapshot of the controller for external readers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavStatus {
    pub state: NavState,
    pub goal: Option<String>,
    pub cursor: usize,
    pub route_len: usize,
    pub pose: Pose,
}

impl Default for NavStatus {
    fn default() -> Self {
        Self {
            state: NavState::Idle,
            goal: None,
            cursor: 0,
            route_len: 0,
            pose: Pose::unknown(),
        }
    }
}

#[derive(Debug)]
pub enum Toggle {
    Started(Route),
    Stopped,
}

/// Cooperative cancellation shared by a session's tasks. Sleeping tasks are
/// woken as soon as it fires.
#[derive(Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The raw flag, for synchronous loops on blocking threads
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    /// Sleep for `duration` unless stopped first. Returns true when stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return true;
        }
        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(duration) => self.is_set(),
        }
    }
}

/// Plays the facing cue once per waypoint.
#[derive(Debug, Default)]
struct FacingTracker {
    cued: Option<usize>,
}

impl FacingTracker {
    fn should_cue(&mut self, cursor: usize) -> bool {
        if self.cued == Some(cursor) {
            return false;
        }
        self.cued = Some(cursor);
        true
    }
}

/// State shared between the controller and one session's tasks.
struct Session {
    goal: String,
    route: Route,
    /// Written only by the progress task
    cursor: AtomicUsize,
    last_pose: Mutex<Pose>,
    finished: AtomicBool,
    stop: StopSignal,
    config: Arc<NavConfig>,
    sensor: Arc<dyn PoseSensor>,
    audio: Arc<dyn SpatialAudio>,
    camera: Arc<dyn CameraActuator>,
    events: mpsc::UnboundedSender<NavEvent>,
    status: Arc<watch::Sender<NavStatus>>,
}

impl Session {
    fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn last_pose(&self) -> Pose {
        self.last_pose.lock().map(|p| *p).unwrap_or_default()
    }

    fn emit(&self, event: NavEvent) {
        let _ = self.events.send(event);
    }

    /// Enter a terminal state. Only the first caller wins, so each session
    /// signals exactly one of completed, cancelled or failed.
    fn finish(&self, state: NavState, event: NavEvent) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stop.trigger();
        info!("Navigation to {} ended: {:?}", self.goal, state);
        self.status.send_modify(|s| s.state = state);
        self.emit(event);
        true
    }

    async fn sample_pose(&self) -> Pose {
        let sensor = self.sensor.clone();
        let use_map_matching = self.config.pathfinding.use_map_matching;
        tokio::task::spawn_blocking(move || sensor.pose(use_map_matching))
            .await
            .unwrap_or_else(|e| {
                warn!("Pose sampling task failed: {}", e);
                Pose::unknown()
            })
    }

    async fn sample_heading(&self) -> Option<f64> {
        let sensor = self.sensor.clone();
        tokio::task::spawn_blocking(move || sensor.heading())
            .await
            .unwrap_or_else(|e| {
                warn!("Heading sampling task failed: {}", e);
                None
            })
    }

    fn record_pose(&self, pose: Pose) {
        if let Ok(mut last) = self.last_pose.lock() {
            *last = pose;
        }
        self.status.send_modify(|s| s.pose = pose);
    }
}

/// Handles of a session's background tasks
struct Running {
    session: Arc<Session>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Running {
    /// Wait for every task to observe the stop signal. Tasks that overrun
    /// the deadline are logged and aborted.
    async fn join(self, timeout: Duration) {
        self.session.stop.trigger();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => debug!("{} task stopped", name),
                Ok(Err(e)) => warn!("{} task ended abnormally: {}", name, e),
                Err(_) => {
                    error!("{} task did not stop within {:?}; aborting it", name, timeout);
                    handle.abort();
                }
            }
        }
    }
}

/// Runs at most one navigation session at a time.
pub struct NavigationController {
    config: Arc<NavConfig>,
    sensor: Arc<dyn PoseSensor>,
    planner: Result<Arc<PathPlanner>, NavError>,
    audio: Arc<dyn SpatialAudio>,
    camera: Arc<dyn CameraActuator>,
    events: mpsc::UnboundedSender<NavEvent>,
    status: Arc<watch::Sender<NavStatus>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl NavigationController {
    pub fn new(
        context: &LocalizationContext,
        audio: Arc<dyn SpatialAudio>,
        camera: Arc<dyn CameraActuator>,
    ) -> (Self, mpsc::UnboundedReceiver<NavEvent>) {
        Self::from_parts(
            context.config(),
            context.sensor(),
            context.planner(),
            audio,
            camera,
        )
    }

    pub fn from_parts(
        config: Arc<NavConfig>,
        sensor: Arc<dyn PoseSensor>,
        planner: Result<Arc<PathPlanner>, NavError>,
        audio: Arc<dyn SpatialAudio>,
        camera: Arc<dyn CameraActuator>,
    ) -> (Self, mpsc::UnboundedReceiver<NavEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(NavStatus::default());
        let controller = Self {
            config,
            sensor,
            planner,
            audio,
            camera,
            events,
            status: Arc::new(status),
            running: tokio::sync::Mutex::new(None),
        };
        (controller, events_rx)
    }

    pub fn snapshot(&self) -> NavStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NavStatus> {
        self.status.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().state.is_running()
    }

    fn set_state(&self, state: NavState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// Plan a route from the current position and start guiding.
    ///
    /// Fails with `Busy` while another session runs. Without a position the
    /// controller stays idle and emits `PositionUnknown`.
    pub async fn start_pathfinding(&self, destination: Destination) -> Result<Route, NavError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.session.finished.load(Ordering::SeqCst) {
                return Err(NavError::Busy);
            }
        }
        // Reap a session that ended on its own
        if let Some(previous) = running.take() {
            previous.join(self.config.session.join_timeout()).await;
        }

        let planner = self.planner.clone()?;
        let config = self.config.clone();
        info!("Navigation to {} requested", destination.name);
        self.status.send_modify(|s| {
            *s = NavStatus {
                state: NavState::Planning,
                goal: Some(destination.name.clone()),
                ..NavStatus::default()
            }
        });

        let sensor = self.sensor.clone();
        let use_map_matching = config.pathfinding.use_map_matching;
        let pose = tokio::task::spawn_blocking(move || sensor.pose(use_map_matching))
            .await
            .unwrap_or_default();
        let Some(start) = pose.position else {
            warn!("Cannot start navigation: position unknown");
            self.set_state(NavState::Idle);
            let _ = self.events.send(NavEvent::PositionUnknown);
            return Err(NavError::SensorUnavailable);
        };

        let goal = destination.goal;
        let planned = match tokio::task::spawn_blocking(move || planner.plan(start, goal)).await {
            Ok(result) => result.map_err(NavError::from),
            Err(e) => Err(NavError::Unreachable(format!("planner task failed: {}", e))),
        };
        let route = match planned {
            Ok(route) => route,
            Err(e) => {
                warn!("No route to {}: {}", destination.name, e);
                self.set_state(NavState::Failed);
                let _ = self.events.send(NavEvent::NoPath {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            goal: destination.name.clone(),
            route: route.clone(),
            cursor: AtomicUsize::new(0),
            last_pose: Mutex::new(pose),
            finished: AtomicBool::new(false),
            stop: StopSignal::default(),
            config: config.clone(),
            sensor: self.sensor.clone(),
            audio: self.audio.clone(),
            camera: self.camera.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
        });

        self.status.send_modify(|s| {
            s.state = NavState::Active;
            s.route_len = route.len();
            s.pose = pose;
        });
        info!(
            "Navigating to {} over {} waypoints",
            destination.name,
            route.len()
        );
        session.emit(NavEvent::Started {
            goal: destination.name,
            waypoints: route.len(),
        });

        let mut tasks = vec![
            ("progress", tokio::spawn(progress_loop(session.clone()))),
            ("stall", tokio::spawn(stall_loop(session.clone()))),
        ];
        if config.pathfinding.auto_turn {
            tasks.push(("auto-turn", tokio::spawn(auto_turn_loop(session.clone()))));
        } else {
            tasks.push(("ping", tokio::spawn(ping_loop(session.clone()))));
        }
        *running = Some(Running { session, tasks });

        Ok(route)
    }

    /// Stop the active session and wait for its tasks. Returns false when
    /// nothing was running.
    pub async fn stop_pathfinding(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return false;
        };
        let cancelled = current
            .session
            .finish(NavState::Cancelled, NavEvent::Cancelled);
        current.join(self.config.session.join_timeout()).await;
        cancelled
    }

    /// Start towards `destination` when idle, otherwise stop.
    pub async fn toggle(&self, destination: Destination) -> Result<Toggle, NavError> {
        let active = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .is_some_and(|r| !r.session.finished.load(Ordering::SeqCst))
        };
        if active {
            self.stop_pathfinding().await;
            Ok(Toggle::Stopped)
        } else {
            self.start_pathfinding(destination).await.map(Toggle::Started)
        }
    }
}

/// Advances the cursor as waypoints are reached. The only writer of the
/// cursor.
async fn progress_loop(session: Arc<Session>) {
    let pathfinding = &session.config.pathfinding;
    let threshold = session.config.session.failure_threshold.max(1);
    let len = session.route.len();
    let mut failures = 0u32;

    while !session.stop.is_set() {
        let pose = session.sample_pose().await;
        // Stop may have fired while the capture was in flight
        if session.stop.is_set() {
            break;
        }
        session.record_pose(pose);

        match pose.position {
            None => {
                failures += 1;
                debug!("Position miss {}/{}", failures, threshold);
                if failures >= threshold {
                    session.finish(
                        NavState::Failed,
                        NavEvent::Failed {
                            reason: "cannot determine position".to_string(),
                        },
                    );
                    break;
                }
            }
            Some(player) => {
                failures = 0;
                let steps = session
                    .route
                    .advance(session.cursor(), player, pathfinding.point_radius_px);
                for cursor in steps {
                    session.cursor.store(cursor, Ordering::SeqCst);
                    session.status.send_modify(|s| s.cursor = cursor);
                    if cursor >= len {
                        if let Err(e) = session.audio.play_cue(Cue::Arrived) {
                            warn!("Arrival cue failed: {:#}", e);
                        }
                        let goal = session.goal.clone();
                        session.finish(NavState::Completed, NavEvent::Completed { goal });
                        return;
                    }
                    debug!("Waypoint {} reached", cursor);
                    if let Err(e) = session.audio.play_cue(Cue::PointReached) {
                        warn!("Waypoint cue failed: {:#}", e);
                    }
                    session.emit(NavEvent::WaypointReached {
                        index: cursor,
                        remaining: len - cursor,
                    });
                }
            }
        }

        if session.stop.sleep(pathfinding.check_interval()).await {
            break;
        }
    }
}

/// Reports a single `NotMoving` once the player stands still for the
/// configured number of checks. Reads poses only.
async fn stall_loop(session: Arc<Session>) {
    let config = &session.config.session;
    let mut last: Option<ScreenPoint> = None;
    let mut still = 0u32;
    let mut reported = false;

    while !session.stop.sleep(config.stall_interval()).await {
        let Some(position) = session.last_pose().position else {
            continue;
        };
        if let Some(previous) = last {
            if position.distance(&previous) < config.min_movement_px {
                still += 1;
                if still >= config.stall_checks && !reported {
                    info!("Player has not moved for {} checks", still);
                    session.emit(NavEvent::NotMoving);
                    reported = true;
                }
            } else {
                still = 0;
                reported = false;
            }
        }
        last = Some(position);
    }
}

/// Next waypoint and the player's facing, from the latest pose
struct Guidance {
    cursor: usize,
    player: ScreenPoint,
    target: ScreenPoint,
    bearing: f64,
    heading: Option<f64>,
}

impl Guidance {
    /// Signed angle from the facing direction to the waypoint
    fn relative(&self) -> Option<f64> {
        self.heading.map(|heading| relative_angle(heading, self.bearing))
    }
}

/// Falls back to the minimap when the last pose carries no heading.
async fn guidance(session: &Session) -> Option<Guidance> {
    let cursor = session.cursor();
    let target = *session.route.get(cursor)?;
    let pose = session.last_pose();
    let player = pose.position?;
    let heading = match pose.heading {
        Some(heading) => Some(heading),
        None => session.sample_heading().await,
    };
    Some(Guidance {
        cursor,
        player,
        target,
        bearing: bearing_degrees(&player, &target),
        heading,
    })
}

/// True when the facing cue replaces this tick's guidance
fn check_facing(session: &Session, g: &Guidance, tracker: &mut FacingTracker) -> bool {
    let pathfinding = &session.config.pathfinding;
    let Some(relative) = g.relative() else {
        return false;
    };
    if !pathfinding.perform_facing_check || relative.abs() > pathfinding.facing_threshold_deg {
        return false;
    }
    if tracker.should_cue(g.cursor) {
        if let Err(e) = session.audio.play_cue(Cue::Facing) {
            warn!("Facing cue failed: {:#}", e);
        }
        session.emit(NavEvent::Facing { index: g.cursor });
    }
    true
}

async fn ping_loop(session: Arc<Session>) {
    let interval = session.config.pathfinding.ping_interval();
    let mut tracker = FacingTracker::default();

    while !session.stop.is_set() {
        if let Some(g) = guidance(&session).await {
            if !check_facing(&session, &g, &mut tracker) {
                match g.relative() {
                    Some(relative) => {
                        let distance = g.player.distance_meters(&g.target);
                        if let Err(e) = session.audio.play_ping(relative, distance) {
                            warn!("Ping failed: {:#}", e);
                        }
                    }
                    None => debug!("Heading unknown; ping skipped"),
                }
            }
        }
        if session.stop.sleep(interval).await {
            break;
        }
    }
}

async fn auto_turn_loop(session: Arc<Session>) {
    let interval = session.config.auto_turn.interval();
    let limit = session.config.session.turn_failure_limit.max(1);
    let mut tracker = FacingTracker::default();
    let mut failures = 0u32;

    while !session.stop.is_set() {
        if let Some(g) = guidance(&session).await {
            if check_facing(&session, &g, &mut tracker) {
                failures = 0;
            } else {
                let s = session.clone();
                let stop = session.stop.flag();
                let result = tokio::task::spawn_blocking(move || {
                    turn_towards(
                        s.sensor.as_ref(),
                        s.camera.as_ref(),
                        g.player,
                        g.target,
                        &s.config.auto_turn,
                        &stop,
                    )
                })
                .await;
                match result {
                    Ok(Ok(TurnOutcome::Aligned { .. })) | Ok(Ok(TurnOutcome::Cancelled)) => {
                        failures = 0;
                    }
                    Ok(Err(NavError::TurnIncomplete {
                        attempts,
                        error_deg,
                    })) => {
                        failures += 1;
                        debug!(
                            "Turn incomplete after {} attempts ({:.0} deg off), {} in a row",
                            attempts, error_deg, failures
                        );
                        if failures >= limit {
                            info!("Auto-turn keeps failing; asking for a manual turn");
                            session.emit(NavEvent::TurnManually);
                            failures = 0;
                        }
                    }
                    Ok(Err(NavError::SensorUnavailable)) => debug!("No heading for auto-turn"),
                    Ok(Err(e)) => warn!("Auto-turn failed: {}", e),
                    Err(e) => warn!("Auto-turn task failed: {}", e),
                }
            }
        }
        if session.stop.sleep(interval).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_capture::ScreenRegion;
    use sonar_route::{CostGrid, GridTransform, PlannerConfig, Terrain};
    use std::collections::VecDeque;

    /// Serves scripted poses, then repeats the last one
    struct ScriptedSensor {
        script: Mutex<VecDeque<Pose>>,
        last: Mutex<Pose>,
        minimap: Option<f64>,
    }

    impl ScriptedSensor {
        fn new(poses: Vec<Pose>) -> Arc<Self> {
            Self::with_minimap(poses, None)
        }

        /// Minimap heading reported even when the poses carry none
        fn with_minimap(poses: Vec<Pose>, minimap: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(poses.into()),
                last: Mutex::new(Pose::unknown()),
                minimap,
            })
        }
    }

    impl PoseSensor for ScriptedSensor {
        fn pose(&self, _use_map_matching: bool) -> Pose {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        }

        fn heading(&self) -> Option<f64> {
            self.minimap.or(self.last.lock().unwrap().heading)
        }
    }

    /// Answers the first call at once, then takes `delay` per capture
    struct SlowSensor {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl PoseSensor for SlowSensor {
        fn pose(&self, _use_map_matching: bool) -> Pose {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                std::thread::sleep(self.delay);
            }
            at(0.0, 0.0)
        }

        fn heading(&self) -> Option<f64> {
            Some(0.0)
        }
    }

    #[derive(Default)]
    struct RecordingAudio {
        pings: Mutex<Vec<(f64, f64)>>,
        cues: Mutex<Vec<Cue>>,
    }

    impl SpatialAudio for RecordingAudio {
        fn play_ping(&self, bearing_degrees: f64, distance_meters: f64) -> anyhow::Result<()> {
            self.pings.lock().unwrap().push((bearing_degrees, distance_meters));
            Ok(())
        }

        fn play_cue(&self, cue: Cue) -> anyhow::Result<()> {
            self.cues.lock().unwrap().push(cue);
            Ok(())
        }
    }

    struct StuckCamera;

    impl CameraActuator for StuckCamera {
        fn rotate(&self, _delta_degrees: f64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> NavConfig {
        let mut config = NavConfig::default();
        config.pathfinding.check_interval_ms = 5;
        config.pathfinding.ping_interval_ms = 5;
        config.session.stall_interval_ms = 5;
        config.session.join_timeout_ms = 1000;
        config.auto_turn.interval_ms = 5;
        config.auto_turn.settle_ms = 0;
        config.auto_turn.max_attempts = 2;
        config
    }

    /// Open 20x20 grid where screen pixels and cells coincide
    fn planner() -> Arc<PathPlanner> {
        let grid = Arc::new(CostGrid::filled(20, 20, Terrain::Open));
        let transform = GridTransform::new(ScreenRegion::new(0, 0, 20, 20), 20, 20);
        Arc::new(PathPlanner::new(grid, transform, PlannerConfig::default()))
    }

    fn at(x: f64, y: f64) -> Pose {
        Pose::new(Some(ScreenPoint::new(x, y)), Some(0.0))
    }

    fn controller(
        config: NavConfig,
        sensor: Arc<ScriptedSensor>,
        audio: Arc<RecordingAudio>,
    ) -> (NavigationController, mpsc::UnboundedReceiver<NavEvent>) {
        NavigationController::from_parts(
            Arc::new(config),
            sensor,
            Ok(planner()),
            audio,
            Arc::new(StuckCamera),
        )
    }

    fn destination() -> Destination {
        Destination::new("Tilted Towers", ScreenPoint::new(9.0, 9.0))
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<NavEvent>,
        seen: &mut Vec<NavEvent>,
        wanted: impl Fn(&NavEvent) -> bool,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            let done = wanted(&event);
            seen.push(event);
            if done {
                return;
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NavEvent>, seen: &mut Vec<NavEvent>) {
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
    }

    #[test]
    fn test_facing_tracker_cues_once_per_waypoint() {
        let mut tracker = FacingTracker::default();
        assert!(tracker.should_cue(1));
        assert!(!tracker.should_cue(1));
        assert!(tracker.should_cue(2));
        assert!(!tracker.should_cue(2));
    }

    #[tokio::test]
    async fn test_stop_signal_wakes_sleepers() {
        let stop = StopSignal::default();
        let sleeper = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.sleep(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.trigger();
        let stopped = tokio::time::timeout(Duration::from_secs(2), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
        assert!(stop.sleep(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_unknown_position_never_activates() {
        let audio = Arc::new(RecordingAudio::default());
        let (nav, mut rx) = controller(fast_config(), ScriptedSensor::new(vec![]), audio);

        let err = nav.start_pathfinding(destination()).await.unwrap_err();
        assert_eq!(err, NavError::SensorUnavailable);
        assert_eq!(nav.snapshot().state, NavState::Idle);
        assert!(!nav.is_active());
        assert_eq!(rx.try_recv().unwrap(), NavEvent::PositionUnknown);
        assert!(!nav.stop_pathfinding().await);
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let audio = Arc::new(RecordingAudio::default());
        let sensor = ScriptedSensor::new(vec![at(0.0, 0.0), at(0.0, 0.0), at(9.0, 9.0)]);
        let (nav, mut rx) = controller(fast_config(), sensor, audio.clone());

        let route = nav.start_pathfinding(destination()).await.unwrap();
        assert_eq!(route.first(), Some(&ScreenPoint::new(0.0, 0.0)));
        assert_eq!(route.last(), Some(&ScreenPoint::new(9.0, 9.0)));

        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |e| matches!(e, NavEvent::Completed { .. })).await;

        // The session already finished, so there is nothing to cancel
        assert!(!nav.stop_pathfinding().await);
        drain(&mut rx, &mut seen);

        let completed = seen
            .iter()
            .filter(|e| matches!(e, NavEvent::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(!seen.contains(&NavEvent::Cancelled));
        assert!(matches!(seen[0], NavEvent::Started { waypoints: 4, .. }));
        assert_eq!(nav.snapshot().state, NavState::Completed);
        assert_eq!(nav.snapshot().cursor, 4);
        assert_eq!(audio.cues.lock().unwrap().last(), Some(&Cue::Arrived));
    }

    #[tokio::test]
    async fn test_position_loss_fails_session() {
        let audio = Arc::new(RecordingAudio::default());
        let sensor = ScriptedSensor::new(vec![at(0.0, 0.0), Pose::unknown()]);
        let (nav, mut rx) = controller(fast_config(), sensor, audio);

        nav.start_pathfinding(destination()).await.unwrap();
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |e| matches!(e, NavEvent::Failed { .. })).await;
        assert!(!nav.stop_pathfinding().await);
        drain(&mut rx, &mut seen);

        let failed = seen
            .iter()
            .filter(|e| matches!(e, NavEvent::Failed { .. }))
            .count();
        assert_eq!(failed, 1);
        assert_eq!(nav.snapshot().state, NavState::Failed);
    }

    #[tokio::test]
    async fn test_toggle_starts_and_stops() {
        let audio = Arc::new(RecordingAudio::default());
        let sensor = ScriptedSensor::new(vec![at(0.0, 0.0)]);
        let (nav, mut rx) = controller(fast_config(), sensor, audio.clone());

        assert!(matches!(
            nav.toggle(destination()).await.unwrap(),
            Toggle::Started(_)
        ));
        assert!(nav.is_active());
        assert_eq!(
            nav.start_pathfinding(destination()).await.unwrap_err(),
            NavError::Busy
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            nav.toggle(destination()).await.unwrap(),
            Toggle::Stopped
        ));
        assert_eq!(nav.snapshot().state, NavState::Cancelled);

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen);
        assert_eq!(seen.iter().filter(|e| **e == NavEvent::Cancelled).count(), 1);
        // Standing on the first waypoint advanced the cursor once
        assert!(seen.contains(&NavEvent::WaypointReached {
            index: 1,
            remaining: 3
        }));
        assert!(!audio.pings.lock().unwrap().is_empty());

        // A new session may start once the old one is joined
        assert!(matches!(
            nav.toggle(destination()).await.unwrap(),
            Toggle::Started(_)
        ));
        assert!(nav.stop_pathfinding().await);
    }

    #[tokio::test]
    async fn test_facing_cue_replaces_pings() {
        let audio = Arc::new(RecordingAudio::default());
        // Facing south-east towards every waypoint on the diagonal
        let pose = Pose::new(Some(ScreenPoint::new(0.0, 0.0)), Some(135.0));
        let (nav, mut rx) = controller(fast_config(), ScriptedSensor::new(vec![pose]), audio.clone());

        nav.start_pathfinding(destination()).await.unwrap();
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |e| matches!(e, NavEvent::Facing { .. })).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        nav.stop_pathfinding().await;
        drain(&mut rx, &mut seen);

        let facing = seen
            .iter()
            .filter(|e| matches!(e, NavEvent::Facing { .. }))
            .count();
        assert_eq!(facing, 1);
        // Only the start waypoint underfoot can be pinged before the cursor moves on
        assert!(audio.pings.lock().unwrap().iter().all(|(_, d)| *d == 0.0));
    }

    #[tokio::test]
    async fn test_repeated_turn_failures_ask_for_manual_turn() {
        let mut config = fast_config();
        config.pathfinding.auto_turn = true;
        let audio = Arc::new(RecordingAudio::default());
        // Facing north with the route to the south-east, and the camera never moves
        let (nav, mut rx) = controller(config, ScriptedSensor::new(vec![at(0.0, 0.0)]), audio);

        nav.start_pathfinding(destination()).await.unwrap();
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |e| *e == NavEvent::TurnManually).await;
        assert!(nav.stop_pathfinding().await);
    }

    #[tokio::test]
    async fn test_standing_still_reported_once() {
        let mut config = fast_config();
        config.session.stall_checks = 2;
        let audio = Arc::new(RecordingAudio::default());
        let (nav, mut rx) = controller(config, ScriptedSensor::new(vec![at(0.0, 0.0)]), audio);

        nav.start_pathfinding(destination()).await.unwrap();
        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |e| *e == NavEvent::NotMoving).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        nav.stop_pathfinding().await;
        drain(&mut rx, &mut seen);
        assert_eq!(seen.iter().filter(|e| **e == NavEvent::NotMoving).count(), 1);
    }

    #[tokio::test]
    async fn test_missing_planner_is_reported() {
        let (nav, _rx) = NavigationController::from_parts(
            Arc::new(fast_config()),
            ScriptedSensor::new(vec![at(0.0, 0.0)]),
            Err(NavError::NotInitialised("cost grid".to_string())),
            Arc::new(RecordingAudio::default()),
            Arc::new(StuckCamera),
        );
        assert!(matches!(
            nav.start_pathfinding(destination()).await,
            Err(NavError::NotInitialised(_))
        ));
        assert_eq!(nav.snapshot().state, NavState::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_goal_fails_planning() {
        let audio = Arc::new(RecordingAudio::default());
        let (nav, mut rx) = controller(fast_config(), ScriptedSensor::new(vec![at(0.0, 0.0)]), audio);
        let off_map = Destination::new("Nowhere", ScreenPoint::new(500.0, 500.0));
        assert!(matches!(
            nav.start_pathfinding(off_map).await,
            Err(NavError::InvalidEndpoint(_))
        ));
        assert_eq!(nav.snapshot().state, NavState::Failed);
        assert!(matches!(rx.try_recv().unwrap(), NavEvent::NoPath { .. }));
    }

    #[tokio::test]
    async fn test_pings_use_minimap_heading_when_pose_has_none() {
        let audio = Arc::new(RecordingAudio::default());
        // Icon position without a heading while the minimap says East
        let pose = Pose::new(Some(ScreenPoint::new(0.0, 0.0)), None);
        let sensor = ScriptedSensor::with_minimap(vec![pose], Some(90.0));
        let (nav, _rx) = controller(fast_config(), sensor, audio.clone());

        nav.start_pathfinding(destination()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        nav.stop_pathfinding().await;

        let pings = audio.pings.lock().unwrap();
        let towards_next: Vec<_> = pings.iter().filter(|(_, d)| *d > 0.0).collect();
        assert!(!towards_next.is_empty());
        // (3, 3) lies south-east, 45 degrees right of East rather than 135 of North
        for (bearing, _) in towards_next {
            assert!((bearing - 45.0).abs() < 1e-6, "bearing {}", bearing);
        }
    }

    #[tokio::test]
    async fn test_no_ping_without_any_heading() {
        let audio = Arc::new(RecordingAudio::default());
        let pose = Pose::new(Some(ScreenPoint::new(0.0, 0.0)), None);
        let (nav, mut rx) = controller(fast_config(), ScriptedSensor::new(vec![pose]), audio.clone());

        nav.start_pathfinding(destination()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(nav.is_active());
        assert!(nav.stop_pathfinding().await);

        assert!(audio.pings.lock().unwrap().is_empty());
        let mut seen = Vec::new();
        drain(&mut rx, &mut seen);
        assert!(!seen.iter().any(|e| matches!(e, NavEvent::Facing { .. })));
    }

    #[tokio::test]
    async fn test_stop_during_capture_discards_the_sample() {
        let sensor = Arc::new(SlowSensor {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(150),
        });
        let mut config = fast_config();
        config.session.stall_checks = 1000;
        let (nav, mut rx) = NavigationController::from_parts(
            Arc::new(config),
            sensor,
            Ok(planner()),
            Arc::new(RecordingAudio::default()),
            Arc::new(StuckCamera),
        );

        nav.start_pathfinding(destination()).await.unwrap();
        // The progress task is now inside its first slow capture
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(nav.stop_pathfinding().await);

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen);
        let cancelled = seen
            .iter()
            .position(|e| *e == NavEvent::Cancelled)
            .unwrap();
        assert_eq!(cancelled, seen.len() - 1, "events after cancel: {:?}", seen);
        assert!(!seen
            .iter()
            .any(|e| matches!(e, NavEvent::WaypointReached { .. })));
        assert_eq!(nav.snapshot().cursor, 0);
    }
}
