// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the goal surface of the controller.
//!
//! A [`GoalClient`] sends goals and preemption requests into an inbox which the control loop
//! drains at the start of every tick, and receives [`GoalEvent`]s over a channel. The
//! [`GoalStateMachine`] tracks the lifecycle of the active goal:
//! `Idle -> Active -> {Succeeded | Preempted | Aborted} -> Idle`.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use nalgebra::Vector6;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::exception::{create_malformed_input, ControlResult};
use crate::supervisor::control_types::JointVelocities;
use crate::supervisor::logger::Record;
use crate::utils::Pose;

/// Number of events which are buffered for the goal clients before new ones are dropped.
pub static EVENT_CAPACITY: usize = 256;

/// Number of terminal results which are kept until a client collects them. The oldest one
/// is evicted first.
pub static RESULT_CAPACITY: usize = 256;

/// Identifies a goal. Ids are unique for one controller.
pub type GoalId = u64;

/// A target pose for the tracking frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalRequest {
    /// Target pose relative to the root frame.
    pub target: Pose,
    /// Per-axis tolerance (x, y, z, rx, ry, rz). If `None`, the configured default is used.
    pub tolerance: Option<Vector6<f64>>,
}

impl GoalRequest {
    pub fn new(target: Pose) -> Self {
        GoalRequest {
            target,
            tolerance: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Vector6<f64>) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Checks that the target is finite and the tolerance is non-negative and finite.
    ///
    /// # Errors
    /// * MalformedInput otherwise.
    pub fn validate(&self) -> ControlResult<()> {
        let translation = self.target.translation.vector;
        let rotation = self.target.rotation.coords;
        if !translation.iter().chain(rotation.iter()).all(|x| x.is_finite()) {
            return Err(create_malformed_input(format!(
                "goal target {} is not finite",
                self.target
            )));
        }
        if let Some(tolerance) = &self.tolerance {
            if !tolerance.iter().all(|x| x.is_finite() && *x >= 0.) {
                return Err(create_malformed_input(format!(
                    "goal tolerance {:?} must be non-negative and finite",
                    tolerance.as_slice()
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle state of the goal state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GoalStatus {
    Idle,
    Active,
    Succeeded,
    Preempted,
    Aborted,
}

impl GoalStatus {
    /// Returns true for Succeeded, Preempted and Aborted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GoalStatus::Succeeded | GoalStatus::Preempted | GoalStatus::Aborted
        )
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Progress of the active goal, sent once per tick in which a command was published.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalFeedback {
    pub goal_id: GoalId,
    pub cartesian_error: Vector6<f64>,
    pub command: JointVelocities,
}

/// Terminal outcome of a goal.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalResult {
    pub goal_id: GoalId,
    pub status: GoalStatus,
    pub message: String,
    /// Last records of the control loop, only filled for aborted goals.
    pub log: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GoalEvent {
    Accepted(GoalId),
    Feedback(GoalFeedback),
    Finished(GoalResult),
}

/// A goal which was accepted by the state machine or is waiting in the inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveGoal {
    pub id: GoalId,
    pub request: GoalRequest,
}

#[derive(Default)]
struct InboxState {
    pending: Option<ActiveGoal>,
    preempt_requested: bool,
    /// Terminal results which were not collected by a client yet.
    results: BTreeMap<GoalId, GoalResult>,
}

/// What the control loop found in the inbox at the start of a tick.
#[derive(Debug, Default)]
pub(crate) struct InboxSnapshot {
    pub preempt_requested: bool,
    pub new_goal: Option<ActiveGoal>,
}

/// Shared inbox between the goal clients and the control loop.
pub(crate) struct GoalInbox {
    state: Mutex<InboxState>,
    next_id: AtomicU64,
    events: Sender<GoalEvent>,
}

impl GoalInbox {
    pub fn new() -> (Arc<GoalInbox>, Receiver<GoalEvent>) {
        let (events, receiver) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let inbox = GoalInbox {
            state: Mutex::new(InboxState::default()),
            next_id: AtomicU64::new(1),
            events,
        };
        (Arc::new(inbox), receiver)
    }

    /// Sends an event without blocking. Events are dropped if nobody drains the channel; use
    /// [`finish`](`Self::finish`) for terminal results.
    pub fn emit(&self, event: GoalEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => debug!("goal event dropped: {:?}", event),
        }
    }

    /// Stores the terminal result until a client collects it and sends it as event.
    pub fn finish(&self, result: GoalResult) {
        {
            let mut state = self.state.lock();
            state.results.insert(result.goal_id, result.clone());
            while state.results.len() > RESULT_CAPACITY {
                let oldest = match state.results.keys().next() {
                    Some(oldest) => *oldest,
                    None => break,
                };
                if let Some(evicted) = state.results.remove(&oldest) {
                    warn!("result of goal {} was never collected", evicted.goal_id);
                }
            }
        }
        self.emit(GoalEvent::Finished(result));
    }

    fn take_result(&self, goal_id: GoalId) -> Option<GoalResult> {
        self.state.lock().results.remove(&goal_id)
    }

    fn submit(&self, request: GoalRequest) -> ControlResult<GoalId> {
        request.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self.state.lock().pending.replace(ActiveGoal { id, request });
        if let Some(replaced) = replaced {
            self.emit_preempted(replaced.id, "replaced by a newer goal before it started");
        }
        Ok(id)
    }

    fn preempt(&self) {
        let discarded = {
            let mut state = self.state.lock();
            state.preempt_requested = true;
            state.pending.take()
        };
        if let Some(discarded) = discarded {
            self.emit_preempted(discarded.id, "preempted before it started");
        }
    }

    fn emit_preempted(&self, goal_id: GoalId, message: &str) {
        self.finish(GoalResult {
            goal_id,
            status: GoalStatus::Preempted,
            message: message.to_string(),
            log: Vec::new(),
        });
    }

    /// Drains the inbox. Called once at the start of every tick.
    pub fn take(&self) -> InboxSnapshot {
        let mut state = self.state.lock();
        InboxSnapshot {
            preempt_requested: std::mem::replace(&mut state.preempt_requested, false),
            new_goal: state.pending.take(),
        }
    }
}

/// Sends goals to the controller and receives their events.
///
/// The client can be cloned and used from any thread. Clones share the event channel, so
/// every event is received by exactly one of them.
#[derive(Clone)]
pub struct GoalClient {
    inbox: Arc<GoalInbox>,
    events: Receiver<GoalEvent>,
}

impl GoalClient {
    pub(crate) fn new(inbox: Arc<GoalInbox>, events: Receiver<GoalEvent>) -> Self {
        GoalClient { inbox, events }
    }

    /// Queues a goal. It becomes active at the start of the next tick and preempts the goal
    /// which is active at that time.
    /// # Return
    /// Id of the queued goal.
    /// # Errors
    /// * MalformedInput if the target is not finite or the tolerance is negative or not finite.
    pub fn send_goal(&self, request: GoalRequest) -> ControlResult<GoalId> {
        self.inbox.submit(request)
    }

    /// Requests preemption of the active goal and discards a goal which has not started yet.
    ///
    /// The active goal is preempted at the start of the next tick.
    pub fn preempt(&self) {
        self.inbox.preempt()
    }

    /// Returns the next event if there is one.
    pub fn try_next_event(&self) -> Option<GoalEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_event(&self, timeout: Duration) -> Option<GoalEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` until the goal with the given id finished.
    ///
    /// Events received while waiting are consumed. The result is found even if its event was
    /// dropped because the channel was full.
    pub fn wait_for_result(&self, goal_id: GoalId, timeout: Duration) -> Option<GoalResult> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.inbox.take_result(goal_id) {
                return Some(result);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.next_event(remaining) {
                Some(GoalEvent::Finished(result)) if result.goal_id == goal_id => {
                    self.inbox.take_result(goal_id);
                    return Some(result);
                }
                Some(_) => continue,
                None => return self.inbox.take_result(goal_id),
            }
        }
    }
}

/// Tracks the lifecycle of the active goal.
pub struct GoalStateMachine {
    status: GoalStatus,
    active: Option<ActiveGoal>,
}

impl Default for GoalStateMachine {
    fn default() -> Self {
        GoalStateMachine {
            status: GoalStatus::Idle,
            active: None,
        }
    }
}

impl GoalStateMachine {
    pub fn status(&self) -> GoalStatus {
        self.status
    }

    pub fn active(&self) -> Option<&ActiveGoal> {
        self.active.as_ref()
    }

    /// Returns a terminal status to Idle. Called at the start of every tick, so a terminal
    /// status stays observable for exactly one period.
    pub fn start_tick(&mut self) {
        if self.status.is_terminal() {
            self.status = GoalStatus::Idle;
        }
    }

    /// Makes the given goal the active one.
    /// # Return
    /// The previously active goal, which the caller must report as preempted.
    pub fn activate(&mut self, goal: ActiveGoal) -> Option<ActiveGoal> {
        let previous = self.active.replace(goal);
        self.status = GoalStatus::Active;
        previous
    }

    /// Ends the active goal with the given terminal status.
    /// # Return
    /// The finished goal, `None` if no goal was active.
    pub fn finish(&mut self, status: GoalStatus) -> Option<ActiveGoal> {
        debug_assert!(status.is_terminal());
        let finished = self.active.take();
        if finished.is_some() {
            self.status = status;
        } else {
            warn!("no active goal to finish with {}", status);
        }
        finished
    }
}

/// Determines whether the Cartesian error is within the tolerance.
///
/// # Arguments
/// * `error` - Cartesian error (x, y, z, rx, ry, rz).
/// * `tolerance` - Per-axis tolerance.
/// # Return
/// True if the magnitude of every error component is less or equal than its tolerance.
pub fn check_infinitesimal_pose(error: &Vector6<f64>, tolerance: &Vector6<f64>) -> bool {
    error
        .iter()
        .zip(tolerance.iter())
        .all(|(error, tolerance)| error.abs() <= *tolerance)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nalgebra::Vector6;

    use crate::exception::ControlException;
    use crate::supervisor::control_types::JointVelocities;
    use crate::supervisor::goal::{
        check_infinitesimal_pose, ActiveGoal, GoalClient, GoalEvent, GoalFeedback, GoalInbox,
        GoalRequest, GoalResult, GoalStateMachine, GoalStatus, EVENT_CAPACITY, RESULT_CAPACITY,
    };
    use crate::utils::Pose;

    fn client() -> (std::sync::Arc<GoalInbox>, GoalClient) {
        let (inbox, events) = GoalInbox::new();
        (inbox.clone(), GoalClient::new(inbox, events))
    }

    #[test]
    fn infinitesimal_pose() {
        let tolerance = Vector6::new(0.01, 0.01, 0.01, 0.05, 0.05, 0.05);
        assert!(check_infinitesimal_pose(&Vector6::zeros(), &tolerance));
        assert!(check_infinitesimal_pose(
            &Vector6::new(-0.01, 0.01, 0., 0.05, -0.05, 0.),
            &tolerance
        ));
        assert!(!check_infinitesimal_pose(
            &Vector6::new(0., 0., -0.011, 0., 0., 0.),
            &tolerance
        ));
        assert!(!check_infinitesimal_pose(
            &Vector6::new(0., 0., 0., 0., 0., f64::NAN),
            &tolerance
        ));
    }

    #[test]
    fn state_machine_lifecycle() {
        let mut machine = GoalStateMachine::default();
        assert_eq!(machine.status(), GoalStatus::Idle);
        let goal = ActiveGoal {
            id: 1,
            request: GoalRequest::new(Pose::identity()),
        };
        assert!(machine.activate(goal.clone()).is_none());
        assert_eq!(machine.status(), GoalStatus::Active);
        machine.start_tick();
        assert_eq!(machine.status(), GoalStatus::Active);
        assert_eq!(machine.finish(GoalStatus::Succeeded), Some(goal));
        assert_eq!(machine.status(), GoalStatus::Succeeded);
        assert!(machine.active().is_none());
        machine.start_tick();
        assert_eq!(machine.status(), GoalStatus::Idle);
    }

    #[test]
    fn activation_returns_previous_goal() {
        let mut machine = GoalStateMachine::default();
        machine.activate(ActiveGoal {
            id: 1,
            request: GoalRequest::new(Pose::identity()),
        });
        let previous = machine.activate(ActiveGoal {
            id: 2,
            request: GoalRequest::new(Pose::translation(0.1, 0., 0.)),
        });
        assert_eq!(previous.map(|goal| goal.id), Some(1));
        assert_eq!(machine.active().map(|goal| goal.id), Some(2));
    }

    #[test]
    fn inbox_is_drained_once() {
        let (inbox, client) = client();
        let id = client.send_goal(GoalRequest::new(Pose::identity())).unwrap();
        let snapshot = inbox.take();
        assert!(!snapshot.preempt_requested);
        assert_eq!(snapshot.new_goal.map(|goal| goal.id), Some(id));
        let snapshot = inbox.take();
        assert!(snapshot.new_goal.is_none());
    }

    #[test]
    fn preempt_discards_pending_goal() {
        let (inbox, client) = client();
        let id = client.send_goal(GoalRequest::new(Pose::identity())).unwrap();
        client.preempt();
        let snapshot = inbox.take();
        assert!(snapshot.preempt_requested);
        assert!(snapshot.new_goal.is_none());
        match client.try_next_event() {
            Some(GoalEvent::Finished(result)) => {
                assert_eq!(result.goal_id, id);
                assert_eq!(result.status, GoalStatus::Preempted);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!inbox.take().preempt_requested);
    }

    #[test]
    fn newer_goal_replaces_pending_goal() {
        let (inbox, client) = client();
        let first = client.send_goal(GoalRequest::new(Pose::identity())).unwrap();
        let second = client.send_goal(GoalRequest::new(Pose::translation(0., 0., 0.1))).unwrap();
        assert_ne!(first, second);
        assert_eq!(inbox.take().new_goal.map(|goal| goal.id), Some(second));
        let result = client
            .wait_for_result(first, Duration::from_millis(10))
            .unwrap();
        assert_eq!(result.status, GoalStatus::Preempted);
    }

    #[test]
    fn result_survives_full_event_channel() {
        let (inbox, client) = client();
        let id = client.send_goal(GoalRequest::new(Pose::identity())).unwrap();
        inbox.take();
        for _ in 0..EVENT_CAPACITY + 44 {
            inbox.emit(GoalEvent::Feedback(GoalFeedback {
                goal_id: id,
                cartesian_error: Vector6::zeros(),
                command: JointVelocities::zeros(2),
            }));
        }
        inbox.finish(GoalResult {
            goal_id: id,
            status: GoalStatus::Succeeded,
            message: "goal reached".to_string(),
            log: Vec::new(),
        });
        let result = client.wait_for_result(id, Duration::from_millis(50)).unwrap();
        assert_eq!(result.status, GoalStatus::Succeeded);
        assert!(client.wait_for_result(id, Duration::from_millis(1)).is_none());
    }

    #[test]
    fn oldest_uncollected_result_is_evicted() {
        let (inbox, client) = client();
        for goal_id in 1..=(RESULT_CAPACITY as u64 + 1) {
            inbox.finish(GoalResult {
                goal_id,
                status: GoalStatus::Aborted,
                message: String::new(),
                log: Vec::new(),
            });
        }
        while client.try_next_event().is_some() {}
        assert!(client.wait_for_result(1, Duration::from_millis(1)).is_none());
        assert!(client.wait_for_result(2, Duration::from_millis(1)).is_some());
    }

    #[test]
    fn malformed_goals_are_rejected() {
        let (inbox, client) = client();
        let nan_target = GoalRequest::new(Pose::translation(f64::NAN, 0., 0.));
        assert!(matches!(
            client.send_goal(nan_target),
            Err(ControlException::MalformedInput { .. })
        ));
        let negative = GoalRequest::new(Pose::identity())
            .with_tolerance(Vector6::new(0.01, 0.01, -0.01, 0.1, 0.1, 0.1));
        assert!(client.send_goal(negative).is_err());
        let nan_tolerance = GoalRequest::new(Pose::identity()).with_tolerance(Vector6::repeat(f64::NAN));
        assert!(client.send_goal(nan_tolerance).is_err());
        assert!(inbox.take().new_goal.is_none());
        let valid = GoalRequest::new(Pose::identity()).with_tolerance(Vector6::zeros());
        assert!(client.send_goal(valid).is_ok());
    }
}
