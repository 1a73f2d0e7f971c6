// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the [`ControlSupervisor`] which runs one tick of the reactive controller and the
//! types it is built from.
use std::sync::Arc;
use std::time::Instant;

use nalgebra::Vector6;
use tracing::{debug, error, info, warn};

use crate::collision::self_collision::SelfCollisionModel;
use crate::collision::static_collision::{
    ObstacleRegistryHandle, StaticCollisionModel, StaticObstacle,
};
use crate::collision::{merge_collision_costs, CollisionCostVector};
use crate::config::ControllerConfiguration;
use crate::exception::{ControlException, ControlResult};
use crate::interfaces::{
    CommandPublisher, KinematicsProvider, Telemetry, TrajectoryGenerator, TrajectoryRequest,
    TransformProvider,
};
use crate::supervisor::control_types::JointVelocities;
use crate::supervisor::goal::{
    check_infinitesimal_pose, ActiveGoal, GoalClient, GoalEvent, GoalFeedback, GoalId,
    GoalInbox, GoalRequest, GoalResult, GoalStateMachine, GoalStatus,
};
use crate::supervisor::joint_state::{JointState, JointStateFeed};
use crate::supervisor::limits::Limits;
use crate::supervisor::logger::{Logger, Record};
use crate::supervisor::switches::ControlSwitches;
use crate::utils::{all_finite, cartesian_error, JointVector, Pose};

pub mod control_loop;
pub mod control_tools;
pub mod control_types;
pub mod goal;
pub mod joint_state;
pub mod limits;
pub mod logger;
pub mod switches;

/// Telemetry topic of the summed collision cost.
pub static COLLISION_COST_TOPIC: &str = "collision_cost";
/// Telemetry topic of the Euclidean norm of the translational error.
pub static CARTESIAN_DISTANCE_TOPIC: &str = "cartesian_distance";
/// Telemetry topic of the norm of the rotational error.
pub static ROTATION_DISTANCE_TOPIC: &str = "rotation_distance";

/// External collaborators of the controller.
#[derive(Clone)]
pub struct Collaborators {
    pub kinematics: Arc<dyn KinematicsProvider>,
    pub transforms: Arc<dyn TransformProvider>,
    pub trajectory_generator: Arc<dyn TrajectoryGenerator>,
    pub telemetry: Arc<dyn Telemetry>,
    pub command_publisher: Arc<dyn CommandPublisher>,
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// [`ControlSupervisor::initialize`] was not called successfully yet. Nothing was published.
    Uninitialized,
    /// No goal is active and tracking is disabled. Nothing was published, unless tracking was
    /// just disabled; then a zero velocity was published once.
    Idle,
    /// The command was published for the active goal or the tracked target.
    Commanded(JointVelocities),
    /// The command was computed but the output is disabled, so a zero velocity was published.
    Suppressed(JointVelocities),
    /// The tracked target is within the tolerance. A zero velocity was published and tracking
    /// continues.
    Holding,
    /// A zero velocity was published because of a transient fault. The goal stays active.
    SafetyStop { reason: String },
    /// The active goal ended with the given status. A zero velocity was published.
    Finished(GoalStatus),
}

/// Runs the reactive controller.
///
/// Owns both collision models and the goal state machine. Every recomputation happens in
/// [`tick`](`Self::tick`), which is driven by a fixed period timer, usually a
/// [`ControlLoop`](`control_loop::ControlLoop`). Joint states, goals and obstacles come in
/// through handles which can be used from other threads.
pub struct ControlSupervisor {
    config: Arc<ControllerConfiguration>,
    collaborators: Collaborators,
    self_collision: SelfCollisionModel,
    static_collision: StaticCollisionModel,
    limits: Limits,
    joint_state_feed: JointStateFeed,
    inbox: Arc<GoalInbox>,
    goal_client: GoalClient,
    goal: GoalStateMachine,
    switches: ControlSwitches,
    logger: Logger,
    initialized: bool,
    transform_failures: u32,
    was_tracking: bool,
}

impl ControlSupervisor {
    /// Creates a new supervisor.
    ///
    /// # Arguments
    /// * `config` - Configuration shared with both collision models.
    /// * `collaborators` - External collaborators. They are initialized in
    /// [`initialize`](`Self::initialize`).
    /// # Errors
    /// * ConfigurationException if the configuration is inconsistent.
    pub fn new(config: ControllerConfiguration, collaborators: Collaborators) -> ControlResult<Self> {
        config.validate()?;
        let limits = Limits::from_configuration(&config)?;
        let config = Arc::new(config);
        let self_collision = SelfCollisionModel::new(
            config.clone(),
            collaborators.transforms.clone(),
            collaborators.telemetry.clone(),
        );
        let static_collision = StaticCollisionModel::new(
            config.clone(),
            collaborators.transforms.clone(),
            collaborators.telemetry.clone(),
        );
        let (inbox, events) = GoalInbox::new();
        let switches = ControlSwitches::new(config.tracking, config.output_enabled);
        Ok(ControlSupervisor {
            joint_state_feed: JointStateFeed::new(config.degree_of_freedom),
            goal_client: GoalClient::new(inbox.clone(), events),
            logger: Logger::new(config.log_size),
            config,
            collaborators,
            self_collision,
            static_collision,
            limits,
            inbox,
            goal: GoalStateMachine::default(),
            switches,
            initialized: false,
            transform_failures: 0,
            was_tracking: false,
        })
    }

    /// Initializes all collaborators and generates the collision volumes.
    ///
    /// The self-collision volume is generated at the newest joint state or, if none arrived
    /// yet, at the zero configuration.
    /// # Errors
    /// * InitializationException if a collaborator fails to initialize or the kinematics has
    /// a different degree of freedom than the configuration.
    /// * KinematicsException or MalformedInput if the collision volume could not be generated.
    pub fn initialize(&mut self) -> ControlResult<()> {
        initialize_collaborator("kinematics", self.collaborators.kinematics.initialize())?;
        initialize_collaborator("transforms", self.collaborators.transforms.initialize())?;
        initialize_collaborator(
            "trajectory generator",
            self.collaborators.trajectory_generator.initialize(),
        )?;
        let kinematics_dof = self.collaborators.kinematics.degree_of_freedom();
        if kinematics_dof != self.config.degree_of_freedom {
            return Err(ControlException::InitializationException {
                message: format!(
                    "kinematics has {} joints, configuration expects {}",
                    kinematics_dof, self.config.degree_of_freedom
                ),
            });
        }
        let position = match self.joint_state_feed.latest() {
            Some(sample) => sample.state.position.clone(),
            None => {
                debug!("no joint state yet, generating collision volume at zero configuration");
                JointVector::zeros(self.config.degree_of_freedom)
            }
        };
        let forward_kinematics = self.collaborators.kinematics.forward_kinematics(&position)?;
        self.self_collision
            .generate_collision_volume(&forward_kinematics)?;
        self.static_collision.generate_static_collision_volume();
        self.initialized = true;
        info!(
            "controller initialized with {} joints at {} Hz",
            self.config.degree_of_freedom, self.config.clock_frequency
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &ControllerConfiguration {
        &self.config
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn self_collision(&self) -> &SelfCollisionModel {
        &self.self_collision
    }

    pub fn static_collision(&self) -> &StaticCollisionModel {
        &self.static_collision
    }

    /// Stores the joint state as newest sample. Never drives any computation.
    ///
    /// # Errors
    /// * MalformedInput if the state has the wrong length or non-finite values.
    pub fn on_joint_state(&self, state: JointState) -> ControlResult<()> {
        self.joint_state_feed.publish(state)
    }

    /// Returns a handle to feed joint states from another thread.
    pub fn joint_state_feed(&self) -> JointStateFeed {
        self.joint_state_feed.clone()
    }

    /// Returns a client to send goals from another thread and receive their events.
    pub fn goal_client(&self) -> GoalClient {
        self.goal_client.clone()
    }

    /// Returns a handle to mutate the obstacle registry from another thread.
    pub fn obstacle_registry(&self) -> ObstacleRegistryHandle {
        self.static_collision.registry()
    }

    /// Returns the switches for tracking and output, which can be used from another thread.
    pub fn switches(&self) -> ControlSwitches {
        self.switches.clone()
    }

    /// Queues a goal, see [`GoalClient::send_goal`].
    ///
    /// # Errors
    /// * MalformedInput if the goal is not finite or its tolerance is negative.
    pub fn accept_goal(&self, request: GoalRequest) -> ControlResult<GoalId> {
        self.goal_client.send_goal(request)
    }

    /// Requests preemption of the active goal, see [`GoalClient::preempt`].
    pub fn preempt(&self) {
        self.goal_client.preempt()
    }

    /// Current state of the goal state machine.
    pub fn status(&self) -> GoalStatus {
        self.goal.status()
    }

    /// See [`ObstacleRegistryHandle::add_obstacle`].
    pub fn add_obstacle(&self, obstacle: StaticObstacle) -> ControlResult<()> {
        self.static_collision.add_obstacle(obstacle)
    }

    /// See [`ObstacleRegistryHandle::remove_obstacle`].
    pub fn remove_obstacle(&self, id: &str) -> ControlResult<()> {
        self.static_collision.remove_obstacle(id)
    }

    /// See [`ObstacleRegistryHandle::remove_all_obstacles`].
    pub fn remove_all_obstacles(&self) {
        self.static_collision.remove_all_obstacles()
    }

    /// See [`Limits::check_position_limit_violation`].
    pub fn check_position_limit_violation(&self, position: &JointVector, tolerance: f64) -> bool {
        self.limits.check_position_limit_violation(position, tolerance)
    }

    /// See [`Limits::check_velocity_limit_violation`].
    pub fn check_velocity_limit_violation(&self, velocity: &JointVector, tolerance: f64) -> bool {
        self.limits.check_velocity_limit_violation(velocity, tolerance)
    }

    /// See [`Limits::enforce_position_in_limits`].
    pub fn enforce_position_in_limits(&self, position: &JointVector) -> JointVector {
        self.limits.enforce_position_in_limits(position)
    }

    /// See [`Limits::enforce_velocity_in_limits`].
    pub fn enforce_velocity_in_limits(&self, velocity: &JointVector) -> JointVector {
        self.limits.enforce_velocity_in_limits(velocity)
    }

    /// Determines whether the Cartesian error is within the tolerance of the active goal, or
    /// the configured default tolerance if no goal is active.
    pub fn check_infinitesimal_pose(&self, error: &Vector6<f64>) -> bool {
        check_infinitesimal_pose(error, &self.goal_tolerance())
    }

    fn goal_tolerance(&self) -> Vector6<f64> {
        self.goal
            .active()
            .and_then(|goal| goal.request.tolerance)
            .unwrap_or_else(|| self.config.goal_tolerance())
    }

    /// Runs one period of the controller.
    ///
    /// Drains the goal inbox, reads the newest joint state, computes the Cartesian error
    /// of the tracking frame, updates both collision models, asks the trajectory generator
    /// for a command, enforces the limits and publishes the command. Faults only affect this
    /// tick; the next tick starts over.
    ///
    /// Without an active goal and with tracking enabled, the target is the pose of the
    /// [`target_frame`](`ControllerConfiguration::target_frame`), looked up every tick.
    pub fn tick(&mut self) -> TickOutcome {
        self.goal.start_tick();
        if !self.initialized {
            return TickOutcome::Uninitialized;
        }

        let inbox = self.inbox.take();
        if inbox.preempt_requested {
            if let Some(preempted) = self.goal.finish(GoalStatus::Preempted) {
                info!("goal {} preempted", preempted.id);
                self.publish_zero_velocity();
                self.report(preempted.id, GoalStatus::Preempted, "preempted", Vec::new());
                if inbox.new_goal.is_none() {
                    return TickOutcome::Finished(GoalStatus::Preempted);
                }
            }
        }
        if let Some(new_goal) = inbox.new_goal {
            let id = new_goal.id;
            if let Some(previous) = self.goal.activate(new_goal) {
                info!("goal {} preempted by goal {}", previous.id, id);
                self.report(
                    previous.id,
                    GoalStatus::Preempted,
                    "preempted by a newer goal",
                    Vec::new(),
                );
            }
            self.transform_failures = 0;
            self.logger.clear();
            self.inbox.emit(GoalEvent::Accepted(id));
            info!("goal {} active", id);
        }
        let goal = self.goal.active().cloned();
        let tracking = goal.is_none() && self.switches.is_tracking();
        if goal.is_none() && !tracking {
            if self.was_tracking {
                self.was_tracking = false;
                self.publish_zero_velocity();
            }
            return TickOutcome::Idle;
        }
        self.was_tracking = tracking;

        let sample = match self
            .joint_state_feed
            .fresh(self.config.joint_state_timeout(), Instant::now())
        {
            Some(sample) => sample,
            None => return self.safety_stop("no fresh joint state"),
        };
        let state = &sample.state;

        let (target, tolerance) = match &goal {
            Some(goal) => (goal.request.target, self.goal_tolerance()),
            None => match self.lookup(&self.config.target_frame) {
                Ok(target) => (target, self.config.goal_tolerance()),
                Err(error) => return self.safety_stop(&error.to_string()),
            },
        };

        let current_pose = match self.lookup(&self.config.tracking_frame) {
            Ok(pose) => {
                self.transform_failures = 0;
                pose
            }
            Err(error) => {
                self.transform_failures += 1;
                if let Some(goal) = &goal {
                    if self.transform_failures >= self.config.max_transform_failures {
                        return self.abort(
                            goal.id,
                            format!(
                                "{} ({} consecutive failures)",
                                error, self.transform_failures
                            ),
                        );
                    }
                }
                return self.safety_stop(&error.to_string());
            }
        };

        let error = cartesian_error(&current_pose, &target);
        self.publish_error_telemetry(&error);
        if check_infinitesimal_pose(&error, &tolerance) {
            self.publish_zero_velocity();
            return match &goal {
                Some(goal) => {
                    self.goal.finish(GoalStatus::Succeeded);
                    info!("goal {} reached", goal.id);
                    self.report(goal.id, GoalStatus::Succeeded, "goal reached", Vec::new());
                    TickOutcome::Finished(GoalStatus::Succeeded)
                }
                None => TickOutcome::Holding,
            };
        }

        let collision_costs = match self.update_collision_costs(&state.position) {
            Ok(costs) => costs,
            Err(error) => return self.safety_stop(&error.to_string()),
        };

        let request = TrajectoryRequest {
            pose_error: error,
            limits: &self.limits,
            collision_costs: &collision_costs,
            joint_state: state,
        };
        let velocity = match self
            .collaborators
            .trajectory_generator
            .compute_velocity(&request)
        {
            Ok(velocity) => velocity,
            Err(infeasible) => {
                let error = ControlException::TrajectoryInfeasible {
                    message: infeasible.0,
                };
                return self.fail(goal.as_ref(), error.to_string());
            }
        };
        let command = match self.enforce_limits(&state.position, &velocity) {
            Ok(command) => command,
            Err(error) => return self.fail(goal.as_ref(), error.to_string()),
        };

        let output_enabled = self.switches.is_output_enabled();
        if output_enabled {
            self.collaborators.command_publisher.publish(&command);
        } else {
            self.publish_zero_velocity();
        }
        self.collaborators
            .telemetry
            .publish_scalar(COLLISION_COST_TOPIC, collision_costs.sum());
        self.logger.log(state, &command, &error);
        if let Some(goal) = &goal {
            self.inbox.emit(GoalEvent::Feedback(GoalFeedback {
                goal_id: goal.id,
                cartesian_error: error,
                command: command.clone(),
            }));
        }
        if output_enabled {
            TickOutcome::Commanded(command)
        } else {
            TickOutcome::Suppressed(command)
        }
    }

    /// Publishes a zero velocity and ends the active goal as preempted.
    ///
    /// Called when the control loop shuts down.
    pub fn halt(&mut self) {
        if !self.initialized {
            return;
        }
        self.publish_zero_velocity();
        if let Some(goal) = self.goal.finish(GoalStatus::Preempted) {
            self.report(
                goal.id,
                GoalStatus::Preempted,
                "controller shut down",
                Vec::new(),
            );
        }
    }

    fn lookup(&self, frame: &str) -> ControlResult<Pose> {
        let root = &self.config.root_frame;
        self.collaborators
            .transforms
            .lookup(root, frame)
            .map_err(|source| ControlException::TransformUnavailable {
                from: root.clone(),
                to: frame.to_string(),
                source,
            })
    }

    fn update_collision_costs(&mut self, position: &JointVector) -> ControlResult<CollisionCostVector> {
        let forward_kinematics = self.collaborators.kinematics.forward_kinematics(position)?;
        self.self_collision
            .update_collision_volume(&forward_kinematics)?;
        let self_costs = self.self_collision.update_cost()?.clone();
        let static_costs = self
            .static_collision
            .update_cost(self.self_collision.collision_matrix());
        Ok(merge_collision_costs(&self_costs, &static_costs))
    }

    fn enforce_limits(
        &self,
        position: &JointVector,
        velocity: &JointVector,
    ) -> ControlResult<JointVelocities> {
        if velocity.len() != self.config.degree_of_freedom || !all_finite(velocity) {
            return Err(ControlException::LimitViolation {
                message: format!(
                    "trajectory generator returned an invalid command {:?}",
                    velocity.as_slice()
                ),
            });
        }
        let period = self.config.period().as_secs_f64();
        let limited = self.limits.limit_velocity(position, velocity, period);
        if !all_finite(&limited) || self.limits.check_velocity_limit_violation(&limited, 0.) {
            return Err(ControlException::LimitViolation {
                message: format!(
                    "command {:?} cannot be brought into the limits",
                    velocity.as_slice()
                ),
            });
        }
        if &limited != velocity {
            debug!(
                "command clamped from {:?} to {:?}",
                velocity.as_slice(),
                limited.as_slice()
            );
        }
        Ok(limited.into())
    }

    fn publish_zero_velocity(&self) {
        self.collaborators
            .command_publisher
            .publish(&JointVelocities::zeros(self.config.degree_of_freedom));
    }

    fn publish_error_telemetry(&self, error: &Vector6<f64>) {
        let telemetry = &self.collaborators.telemetry;
        telemetry.publish_cartesian_error(error);
        telemetry.publish_scalar(
            CARTESIAN_DISTANCE_TOPIC,
            error.fixed_rows::<3>(0).norm(),
        );
        telemetry.publish_scalar(ROTATION_DISTANCE_TOPIC, error.fixed_rows::<3>(3).norm());
    }

    fn safety_stop(&self, reason: &str) -> TickOutcome {
        warn!("safety stop: {}", reason);
        self.publish_zero_velocity();
        TickOutcome::SafetyStop {
            reason: reason.to_string(),
        }
    }

    /// Aborts the active goal or, while tracking, stops for this tick.
    fn fail(&mut self, goal: Option<&ActiveGoal>, message: String) -> TickOutcome {
        match goal {
            Some(goal) => self.abort(goal.id, message),
            None => self.safety_stop(&message),
        }
    }

    fn abort(&mut self, goal_id: GoalId, message: String) -> TickOutcome {
        error!("goal {} aborted: {}", goal_id, message);
        self.goal.finish(GoalStatus::Aborted);
        self.publish_zero_velocity();
        let log = self.logger.flush();
        self.report(goal_id, GoalStatus::Aborted, &message, log);
        TickOutcome::Finished(GoalStatus::Aborted)
    }

    fn report(
        &self,
        goal_id: GoalId,
        status: GoalStatus,
        message: &str,
        log: Vec<Record>,
    ) {
        self.inbox.finish(GoalResult {
            goal_id,
            status,
            message: message.to_string(),
            log,
        });
    }
}

fn initialize_collaborator(name: &str, result: ControlResult<()>) -> ControlResult<()> {
    result.map_err(|error| ControlException::InitializationException {
        message: format!("{} failed to initialize: {}", name, error),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use nalgebra::{Matrix4, Translation3, Vector3, Vector6};
    use parking_lot::Mutex;

    use crate::collision::static_collision::{Primitive, StaticObstacle};
    use crate::config::ControllerConfiguration;
    use crate::exception::{ControlException, ControlResult};
    use crate::interfaces::{
        CommandPublisher, ForwardKinematics, KinematicsProvider, Marker, Telemetry,
        TrajectoryGenerator, TrajectoryInfeasible, TrajectoryRequest, TransformError,
        TransformProvider,
    };
    use crate::supervisor::control_types::JointVelocities;
    use crate::supervisor::goal::{GoalClient, GoalEvent, GoalRequest, GoalStatus};
    use crate::supervisor::joint_state::JointState;
    use crate::supervisor::{Collaborators, ControlSupervisor, TickOutcome};
    use crate::utils::{JointVector, Pose};

    /// Straight chain along z with one link per joint, 0.3 m apart.
    pub struct ChainKinematics {
        pub dof: usize,
    }

    impl KinematicsProvider for ChainKinematics {
        fn degree_of_freedom(&self) -> usize {
            self.dof
        }

        fn forward_kinematics(&self, joint_positions: &JointVector) -> ControlResult<ForwardKinematics> {
            if joint_positions.len() != self.dof {
                return Err(ControlException::KinematicsException {
                    message: "wrong number of joints".to_string(),
                });
            }
            let step = Translation3::new(0., 0., 0.3).to_homogeneous();
            Ok(ForwardKinematics {
                link_transforms: (0..self.dof)
                    .map(|i| Translation3::new(0., 0., 0.3 * i as f64).to_homogeneous())
                    .collect(),
                joint_transforms: vec![step; self.dof],
            })
        }
    }

    /// Returns the pose of a frame in `frames` and `tracking_pose` for every other frame.
    pub struct FakeTransforms {
        pub tracking_pose: Mutex<Result<Pose, TransformError>>,
        pub frames: Mutex<BTreeMap<String, Pose>>,
    }

    impl FakeTransforms {
        pub fn new(tracking_pose: Pose) -> Self {
            FakeTransforms {
                tracking_pose: Mutex::new(Ok(tracking_pose)),
                frames: Mutex::new(BTreeMap::new()),
            }
        }
    }

    impl TransformProvider for FakeTransforms {
        fn lookup(&self, _from: &str, to: &str) -> Result<Pose, TransformError> {
            if let Some(pose) = self.frames.lock().get(to) {
                return Ok(*pose);
            }
            self.tracking_pose.lock().clone()
        }

        fn broadcast_static(&self, _frame: &str, _parent: &str, _pose: &Pose) {}
    }

    /// Returns a fixed command and optionally preempts the goal while computing it.
    pub struct FakeGenerator {
        pub command: Mutex<Result<JointVector, TrajectoryInfeasible>>,
        pub calls: AtomicUsize,
        pub cost_lengths: Mutex<Vec<usize>>,
        pub preempt_with: Mutex<Option<GoalClient>>,
    }

    impl FakeGenerator {
        pub fn new(command: JointVector) -> Self {
            FakeGenerator {
                command: Mutex::new(Ok(command)),
                calls: AtomicUsize::new(0),
                cost_lengths: Mutex::new(Vec::new()),
                preempt_with: Mutex::new(None),
            }
        }
    }

    impl TrajectoryGenerator for FakeGenerator {
        fn compute_velocity(
            &self,
            request: &TrajectoryRequest<'_>,
        ) -> Result<JointVector, TrajectoryInfeasible> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cost_lengths.lock().push(request.collision_costs.len());
            if let Some(client) = self.preempt_with.lock().take() {
                client.preempt();
            }
            self.command.lock().clone()
        }
    }

    #[derive(Default)]
    pub struct NullTelemetry;

    impl Telemetry for NullTelemetry {
        fn publish_markers(&self, _markers: &[Marker]) {}

        fn publish_scalar(&self, _topic: &str, _value: f64) {}

        fn publish_cartesian_error(&self, _error: &Vector6<f64>) {}
    }

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub commands: Mutex<Vec<JointVelocities>>,
    }

    impl RecordingPublisher {
        fn last(&self) -> JointVelocities {
            self.commands.lock().last().cloned().unwrap()
        }
    }

    impl CommandPublisher for RecordingPublisher {
        fn publish(&self, command: &JointVelocities) {
            self.commands.lock().push(command.clone());
        }
    }

    struct Fixture {
        supervisor: ControlSupervisor,
        transforms: Arc<FakeTransforms>,
        generator: Arc<FakeGenerator>,
        publisher: Arc<RecordingPublisher>,
    }

    fn configuration(dof: usize) -> ControllerConfiguration {
        ControllerConfiguration {
            degree_of_freedom: dof,
            min_position_limit: vec![-3.; dof],
            max_position_limit: vec![3.; dof],
            min_velocity_limit: vec![-1.; dof],
            max_velocity_limit: vec![1.; dof],
            max_transform_failures: 3,
            publish_markers: false,
            ..Default::default()
        }
    }

    fn fixture(dof: usize, command: &[f64]) -> Fixture {
        let transforms = Arc::new(FakeTransforms::new(Pose::identity()));
        let generator = Arc::new(FakeGenerator::new(JointVector::from_row_slice(command)));
        let publisher = Arc::new(RecordingPublisher::default());
        let collaborators = Collaborators {
            kinematics: Arc::new(ChainKinematics { dof }),
            transforms: transforms.clone(),
            trajectory_generator: generator.clone(),
            telemetry: Arc::new(NullTelemetry),
            command_publisher: publisher.clone(),
        };
        let mut supervisor = ControlSupervisor::new(configuration(dof), collaborators).unwrap();
        supervisor.initialize().unwrap();
        supervisor
            .on_joint_state(JointState::at_rest(JointVector::zeros(dof)))
            .unwrap();
        Fixture {
            supervisor,
            transforms,
            generator,
            publisher,
        }
    }

    fn far_goal() -> GoalRequest {
        GoalRequest::new(Pose::translation(0.5, 0., 0.5))
    }

    fn finished_events(client: &GoalClient) -> Vec<(u64, GoalStatus)> {
        let mut finished = Vec::new();
        while let Some(event) = client.try_next_event() {
            if let GoalEvent::Finished(result) = event {
                finished.push((result.goal_id, result.status));
            }
        }
        finished
    }

    #[test]
    fn goal_at_current_pose_succeeds_immediately() {
        let mut f = fixture(6, &[0.5; 6]);
        f.supervisor.accept_goal(GoalRequest::new(Pose::identity())).unwrap();
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Succeeded)
        );
        assert_eq!(f.supervisor.status(), GoalStatus::Succeeded);
        assert!(f.publisher.last().is_zero());
        assert_eq!(f.publisher.last().len(), 6);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.supervisor.tick(), TickOutcome::Idle);
        assert_eq!(f.supervisor.status(), GoalStatus::Idle);
    }

    #[test]
    fn command_is_clamped_into_velocity_limits() {
        let mut f = fixture(6, &[2., -2., 0., 0., 0., 0.]);
        f.supervisor.accept_goal(far_goal()).unwrap();
        match f.supervisor.tick() {
            TickOutcome::Commanded(command) => {
                assert_eq!(command.dq, vec![1., -1., 0., 0., 0., 0.])
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.publisher.last().dq, vec![1., -1., 0., 0., 0., 0.]);
        assert_eq!(f.supervisor.status(), GoalStatus::Active);
    }

    #[test]
    fn preemption_during_tick_is_observed_in_next_tick() {
        let mut f = fixture(6, &[0.5; 6]);
        let client = f.supervisor.goal_client();
        let id = client.send_goal(far_goal()).unwrap();
        *f.generator.preempt_with.lock() = Some(client.clone());
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        assert_eq!(f.supervisor.status(), GoalStatus::Active);
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Preempted)
        );
        assert_eq!(f.supervisor.status(), GoalStatus::Preempted);
        assert!(f.publisher.last().is_zero());
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(finished_events(&client), vec![(id, GoalStatus::Preempted)]);
        assert_eq!(f.supervisor.tick(), TickOutcome::Idle);
    }

    #[test]
    fn new_goal_preempts_active_goal() {
        let mut f = fixture(3, &[0.1; 3]);
        let client = f.supervisor.goal_client();
        let first = client.send_goal(far_goal()).unwrap();
        f.supervisor.tick();
        let second = client.send_goal(GoalRequest::new(Pose::translation(0., 0.5, 0.5))).unwrap();
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        assert_eq!(f.supervisor.status(), GoalStatus::Active);
        assert_eq!(finished_events(&client), vec![(first, GoalStatus::Preempted)]);
        f.supervisor.preempt();
        f.supervisor.tick();
        assert_eq!(finished_events(&client), vec![(second, GoalStatus::Preempted)]);
    }

    #[test]
    fn stale_joint_state_forces_zero_velocity() {
        let mut f = fixture(3, &[0.1; 3]);
        f.supervisor
            .joint_state_feed()
            .publish_at(
                JointState::at_rest(JointVector::zeros(3)),
                Instant::now() - Duration::from_secs(2),
            )
            .unwrap();
        f.supervisor.accept_goal(far_goal()).unwrap();
        assert!(matches!(
            f.supervisor.tick(),
            TickOutcome::SafetyStop { .. }
        ));
        assert!(f.publisher.last().is_zero());
        assert_eq!(f.supervisor.status(), GoalStatus::Active);
        f.supervisor
            .on_joint_state(JointState::at_rest(JointVector::zeros(3)))
            .unwrap();
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
    }

    #[test]
    fn repeated_transform_failures_abort_the_goal() {
        let mut f = fixture(3, &[0.1; 3]);
        let client = f.supervisor.goal_client();
        let id = client.send_goal(far_goal()).unwrap();
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        *f.transforms.tracking_pose.lock() = Err(TransformError::Expired("arm_7_link".into()));
        assert!(matches!(
            f.supervisor.tick(),
            TickOutcome::SafetyStop { .. }
        ));
        assert!(f.publisher.last().is_zero());
        assert!(matches!(
            f.supervisor.tick(),
            TickOutcome::SafetyStop { .. }
        ));
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Aborted)
        );
        let result = client
            .wait_for_result(id, Duration::from_millis(10))
            .unwrap();
        assert_eq!(result.status, GoalStatus::Aborted);
        assert!(result.message.contains("arm_7_link"));
        assert_eq!(result.log.len(), 1);
    }

    #[test]
    fn transient_transform_failure_recovers() {
        let mut f = fixture(3, &[0.1; 3]);
        f.supervisor.accept_goal(far_goal()).unwrap();
        for _ in 0..5 {
            *f.transforms.tracking_pose.lock() = Err(TransformError::NotFound("x".into()));
            assert!(matches!(
                f.supervisor.tick(),
                TickOutcome::SafetyStop { .. }
            ));
            *f.transforms.tracking_pose.lock() = Ok(Pose::identity());
            assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        }
    }

    #[test]
    fn non_finite_command_aborts() {
        let mut f = fixture(3, &[0.1, f64::NAN, 0.]);
        f.supervisor.accept_goal(far_goal()).unwrap();
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Aborted)
        );
        assert!(f.publisher.last().is_zero());
        *f.generator.command.lock() = Ok(JointVector::zeros(2));
        f.supervisor.accept_goal(far_goal()).unwrap();
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Aborted)
        );
    }

    #[test]
    fn infeasible_trajectory_aborts() {
        let mut f = fixture(3, &[0.1; 3]);
        *f.generator.command.lock() = Err(TrajectoryInfeasible("no solution".into()));
        let client = f.supervisor.goal_client();
        let id = client.send_goal(far_goal()).unwrap();
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Aborted)
        );
        let result = client
            .wait_for_result(id, Duration::from_millis(10))
            .unwrap();
        assert!(result.message.contains("no solution"));
    }

    #[test]
    fn command_respects_position_limits() {
        let mut f = fixture(3, &[1., 1., -1.]);
        f.supervisor
            .on_joint_state(JointState::at_rest(JointVector::from_row_slice(&[
                2.99, 0., -2.995,
            ])))
            .unwrap();
        f.supervisor.accept_goal(far_goal()).unwrap();
        match f.supervisor.tick() {
            TickOutcome::Commanded(command) => {
                assert!((command.dq[0] - 0.5).abs() < 1e-9);
                assert_eq!(command.dq[1], 1.);
                assert!((command.dq[2] + 0.25).abs() < 1e-9);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn merged_cost_length_does_not_depend_on_obstacles() {
        let mut f = fixture(6, &[0.1; 6]);
        f.supervisor.accept_goal(far_goal()).unwrap();
        f.supervisor.tick();
        f.supervisor
            .add_obstacle(StaticObstacle::new(
                "box1",
                Primitive::Sphere { radius: 0.1 },
                Pose::translation(0.2, 0., 0.6),
            ))
            .unwrap();
        f.supervisor
            .obstacle_registry()
            .add_obstacle(StaticObstacle::new(
                "table",
                Primitive::Box { x: 1., y: 1., z: 0.05 },
                Pose::translation(0.5, 0., -0.05),
            ))
            .unwrap();
        f.supervisor.tick();
        f.supervisor.remove_all_obstacles();
        f.supervisor.tick();
        let lengths = f.generator.cost_lengths.lock().clone();
        let pairs = f.supervisor.self_collision().tracked_pairs().len();
        let points = f.supervisor.self_collision().collision_matrix().len();
        assert_eq!(lengths, vec![pairs + points; 3]);
        assert!(f.supervisor.remove_obstacle("box1").is_err());
    }

    #[test]
    fn feedback_is_sent_for_published_commands() {
        let mut f = fixture(3, &[0.1; 3]);
        let client = f.supervisor.goal_client();
        let id = client.send_goal(far_goal()).unwrap();
        f.supervisor.tick();
        assert_eq!(client.try_next_event(), Some(GoalEvent::Accepted(id)));
        match client.try_next_event() {
            Some(GoalEvent::Feedback(feedback)) => {
                assert_eq!(feedback.goal_id, id);
                assert!((feedback.cartesian_error[0] - 0.5).abs() < 1e-12);
                assert_eq!(feedback.command.dq, vec![0.1; 3]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn tick_before_initialize_does_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let collaborators = Collaborators {
            kinematics: Arc::new(ChainKinematics { dof: 2 }),
            transforms: Arc::new(FakeTransforms::new(Pose::identity())),
            trajectory_generator: Arc::new(FakeGenerator::new(JointVector::zeros(2))),
            telemetry: Arc::new(NullTelemetry),
            command_publisher: publisher.clone(),
        };
        let mut supervisor = ControlSupervisor::new(configuration(2), collaborators).unwrap();
        supervisor.accept_goal(far_goal()).unwrap();
        assert_eq!(supervisor.tick(), TickOutcome::Uninitialized);
        assert!(publisher.commands.lock().is_empty());
        supervisor.initialize().unwrap();
        assert!(matches!(supervisor.tick(), TickOutcome::SafetyStop { .. }));
    }

    #[test]
    fn initialize_rejects_mismatching_kinematics() {
        let collaborators = Collaborators {
            kinematics: Arc::new(ChainKinematics { dof: 7 }),
            transforms: Arc::new(FakeTransforms::new(Pose::identity())),
            trajectory_generator: Arc::new(FakeGenerator::new(JointVector::zeros(6))),
            telemetry: Arc::new(NullTelemetry),
            command_publisher: Arc::new(RecordingPublisher::default()),
        };
        let mut supervisor = ControlSupervisor::new(configuration(6), collaborators).unwrap();
        assert!(matches!(
            supervisor.initialize(),
            Err(ControlException::InitializationException { .. })
        ));
        assert!(!supervisor.is_initialized());
    }

    #[test]
    fn limit_helpers_delegate_to_limits() {
        let f = fixture(6, &[0.; 6]);
        let velocity = JointVector::from_row_slice(&[2., -2., 0., 0., 0., 0.]);
        assert!(f.supervisor.check_velocity_limit_violation(&velocity, 0.));
        assert_eq!(
            f.supervisor.enforce_velocity_in_limits(&velocity).as_slice(),
            &[1., -1., 0., 0., 0., 0.]
        );
        let position = JointVector::from_element(6, 4.);
        assert!(f.supervisor.check_position_limit_violation(&position, 0.5));
        assert!(!f.supervisor.check_position_limit_violation(&position, 1.));
        assert_eq!(
            f.supervisor.enforce_position_in_limits(&position),
            JointVector::from_element(6, 3.)
        );
        assert!(f.supervisor.check_infinitesimal_pose(&Vector6::repeat(0.005)));
        assert!(!f.supervisor.check_infinitesimal_pose(&Vector6::new(
            0., 0., 0., 0.1, 0., 0.
        )));
    }

    #[test]
    fn chain_kinematics_is_homogeneous() {
        let kinematics = ChainKinematics { dof: 2 };
        let fk = kinematics
            .forward_kinematics(&JointVector::zeros(2))
            .unwrap();
        assert_eq!(fk.link_transforms[1], Matrix4::new_translation(&Vector3::new(0., 0., 0.3)));
    }

    #[test]
    fn result_is_kept_after_many_ticks_of_feedback() {
        let mut f = fixture(3, &[0.1; 3]);
        let client = f.supervisor.goal_client();
        let id = client.send_goal(far_goal()).unwrap();
        for _ in 0..300 {
            assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        }
        *f.transforms.tracking_pose.lock() = Ok(far_goal().target);
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Succeeded)
        );
        let result = client
            .wait_for_result(id, Duration::from_millis(50))
            .unwrap();
        assert_eq!(result.status, GoalStatus::Succeeded);
    }

    #[test]
    fn malformed_goal_is_not_queued() {
        let mut f = fixture(3, &[0.1; 3]);
        let goal = far_goal().with_tolerance(Vector6::repeat(-1.));
        assert!(matches!(
            f.supervisor.accept_goal(goal),
            Err(ControlException::MalformedInput { .. })
        ));
        assert_eq!(f.supervisor.tick(), TickOutcome::Idle);
    }

    #[test]
    fn tracking_follows_target_frame() {
        let mut f = fixture(3, &[0.1; 3]);
        let client = f.supervisor.goal_client();
        let switches = f.supervisor.switches();
        assert_eq!(f.supervisor.tick(), TickOutcome::Idle);
        assert!(f.publisher.commands.lock().is_empty());

        f.transforms
            .frames
            .lock()
            .insert("target".to_string(), Pose::translation(0.5, 0., 0.5));
        switches.set_tracking(true);
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        assert_eq!(f.publisher.last().dq, vec![0.1; 3]);

        f.transforms
            .frames
            .lock()
            .insert("target".to_string(), Pose::identity());
        assert_eq!(f.supervisor.tick(), TickOutcome::Holding);
        assert!(f.publisher.last().is_zero());
        assert_eq!(f.supervisor.status(), GoalStatus::Idle);

        f.transforms
            .frames
            .lock()
            .insert("target".to_string(), Pose::translation(0., 0.3, 0.));
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        assert!(client.try_next_event().is_none());

        switches.set_tracking(false);
        let published = f.publisher.commands.lock().len();
        assert_eq!(f.supervisor.tick(), TickOutcome::Idle);
        assert!(f.publisher.last().is_zero());
        assert_eq!(f.supervisor.tick(), TickOutcome::Idle);
        assert_eq!(f.publisher.commands.lock().len(), published + 1);
    }

    #[test]
    fn goal_takes_precedence_over_tracking() {
        let mut f = fixture(3, &[0.1; 3]);
        f.transforms
            .frames
            .lock()
            .insert("target".to_string(), Pose::translation(0.5, 0., 0.5));
        f.supervisor.switches().set_tracking(true);
        f.supervisor
            .accept_goal(GoalRequest::new(Pose::identity()))
            .unwrap();
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Finished(GoalStatus::Succeeded)
        );
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
    }

    #[test]
    fn tracking_faults_stop_without_ending_tracking() {
        let mut f = fixture(3, &[0.1; 3]);
        f.supervisor.switches().set_tracking(true);
        *f.transforms.tracking_pose.lock() = Err(TransformError::NotFound("target".into()));
        for _ in 0..5 {
            assert!(matches!(
                f.supervisor.tick(),
                TickOutcome::SafetyStop { .. }
            ));
        }
        *f.transforms.tracking_pose.lock() = Ok(Pose::identity());
        f.transforms
            .frames
            .lock()
            .insert("target".to_string(), Pose::translation(0.5, 0., 0.5));
        *f.generator.command.lock() = Err(TrajectoryInfeasible("no solution".into()));
        assert!(matches!(
            f.supervisor.tick(),
            TickOutcome::SafetyStop { .. }
        ));
        assert!(f.publisher.last().is_zero());
        assert!(f.supervisor.switches().is_tracking());
    }

    #[test]
    fn disabled_output_publishes_zero() {
        let mut f = fixture(3, &[0.1; 3]);
        let client = f.supervisor.goal_client();
        let switches = f.supervisor.switches();
        switches.set_output_enabled(false);
        let id = client.send_goal(far_goal()).unwrap();
        assert_eq!(
            f.supervisor.tick(),
            TickOutcome::Suppressed(JointVelocities::new(vec![0.1; 3]))
        );
        assert!(f.publisher.last().is_zero());
        assert_eq!(client.try_next_event(), Some(GoalEvent::Accepted(id)));
        match client.try_next_event() {
            Some(GoalEvent::Feedback(feedback)) => assert_eq!(feedback.command.dq, vec![0.1; 3]),
            other => panic!("unexpected event {:?}", other),
        }
        switches.set_output_enabled(true);
        assert!(matches!(f.supervisor.tick(), TickOutcome::Commanded(_)));
        assert_eq!(f.publisher.last().dq, vec![0.1; 3]);
    }
}
