// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the [`ProcessContext`] which owns a running controller.
use tracing::info;

use crate::collision::static_collision::ObstacleRegistryHandle;
use crate::config::ControllerConfiguration;
use crate::exception::ControlResult;
use crate::supervisor::control_loop::{ControlLoop, LoopStatistics};
use crate::supervisor::goal::GoalClient;
use crate::supervisor::joint_state::{JointState, JointStateFeed};
use crate::supervisor::switches::ControlSwitches;
use crate::supervisor::{Collaborators, ControlSupervisor};

/// Owns the control loop of one controller and hands out the handles to talk to it.
///
/// Constructed once at startup. Joint states, goals and obstacles go through the handles,
/// which can be cloned into any thread. Dropping the context stops the loop; use
/// [`shutdown`](`Self::shutdown`) to stop it explicitly and get the controller back.
///
/// # Example
/// ```no_run
/// # use reactive_control::{Collaborators, ControllerConfiguration, ControlResult, GoalRequest, ProcessContext};
/// # use nalgebra::Isometry3;
/// # fn run(collaborators: Collaborators) -> ControlResult<()> {
/// let context = ProcessContext::start(ControllerConfiguration::default(), collaborators, None)?;
/// let goals = context.goal_client();
/// let id = goals.send_goal(GoalRequest::new(Isometry3::translation(0.4, 0., 0.6)))?;
/// let _result = goals.wait_for_result(id, std::time::Duration::from_secs(10));
/// context.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct ProcessContext {
    control_loop: ControlLoop,
    joint_state_feed: JointStateFeed,
    goal_client: GoalClient,
    obstacle_registry: ObstacleRegistryHandle,
    switches: ControlSwitches,
}

impl ProcessContext {
    /// Creates and initializes the controller and starts its control loop.
    ///
    /// # Arguments
    /// * `config` - Configuration of the controller.
    /// * `collaborators` - External collaborators.
    /// * `initial_state` - Joint state at which the collision volumes are generated. If
    /// `None`, the zero configuration is used.
    /// # Errors
    /// * ConfigurationException if the configuration is inconsistent.
    /// * InitializationException if a collaborator fails to initialize.
    /// * RealTimeException if realtime mode is enforced but cannot be set.
    pub fn start(
        config: ControllerConfiguration,
        collaborators: Collaborators,
        initial_state: Option<JointState>,
    ) -> ControlResult<Self> {
        let mut supervisor = ControlSupervisor::new(config, collaborators)?;
        if let Some(state) = initial_state {
            supervisor.on_joint_state(state)?;
        }
        supervisor.initialize()?;
        ProcessContext::from_supervisor(supervisor)
    }

    /// Starts the control loop of an initialized controller.
    ///
    /// # Errors
    /// * InitializationException if the controller is not initialized.
    /// * RealTimeException if realtime mode is enforced but cannot be set.
    pub fn from_supervisor(supervisor: ControlSupervisor) -> ControlResult<Self> {
        let joint_state_feed = supervisor.joint_state_feed();
        let goal_client = supervisor.goal_client();
        let obstacle_registry = supervisor.obstacle_registry();
        let switches = supervisor.switches();
        let control_loop = ControlLoop::spawn(supervisor)?;
        info!("process context started");
        Ok(ProcessContext {
            control_loop,
            joint_state_feed,
            goal_client,
            obstacle_registry,
            switches,
        })
    }

    pub fn joint_state_feed(&self) -> JointStateFeed {
        self.joint_state_feed.clone()
    }

    pub fn goal_client(&self) -> GoalClient {
        self.goal_client.clone()
    }

    pub fn obstacle_registry(&self) -> ObstacleRegistryHandle {
        self.obstacle_registry.clone()
    }

    /// Returns the switches for tracking and output.
    pub fn switches(&self) -> ControlSwitches {
        self.switches.clone()
    }

    /// Stores a joint state as newest sample, see [`JointStateFeed::publish`].
    pub fn on_joint_state(&self, state: JointState) -> ControlResult<()> {
        self.joint_state_feed.publish(state)
    }

    pub fn is_running(&self) -> bool {
        self.control_loop.is_running()
    }

    pub fn statistics(&self) -> &LoopStatistics {
        self.control_loop.statistics()
    }

    /// Stops the control loop and returns the controller.
    ///
    /// # Errors
    /// * InitializationException if the control loop thread panicked.
    pub fn shutdown(self) -> ControlResult<ControlSupervisor> {
        let supervisor = self.control_loop.shutdown()?;
        info!("process context shut down");
        Ok(supervisor)
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("running", &self.is_running())
            .field("ticks", &self.statistics().ticks())
            .field("obstacles", &self.obstacle_registry.len())
            .field("tracking", &self.switches.is_tracking())
            .finish()
    }
}
