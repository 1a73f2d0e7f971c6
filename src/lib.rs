// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! # reactive-control-rs
//! reactive-control-rs is a library for reactive joint velocity control of robot arms. It drives
//! the end effector towards a Cartesian goal pose while smooth penalty costs keep the arm away
//! from itself and from static obstacles.
//!
//! **ALWAYS HAVE THE USER STOP BUTTON AT
//! HAND WHILE CONTROLLING THE ROBOT!**
//!
//!
//! ## Design
//! The controller does not talk to any middleware. Everything it needs from the outside world
//! is described by the traits in [interfaces](`crate::interfaces`): forward kinematics,
//! coordinate frame lookups, the trajectory generator which turns errors and costs into a
//! velocity, telemetry and the sink for the velocity commands.
//!
//! The library is divided into three main Modules:
//! * [collision](`crate::collision`) - the self-collision and static-collision models and the
//! logistic cost they share.
//! * [supervisor](`crate::supervisor`) - the [`ControlSupervisor`] which runs one tick of the
//! controller, the goal state machine, joint limits and the periodic control loop.
//! * [context](`crate::context`) - the [`ProcessContext`] which owns a running controller.
//!
//! Every tick the supervisor
//! 1. reads the newest joint state,
//! 2. looks up the pose of the tracking frame and computes the error to the goal pose,
//! 3. finishes the goal if the error is within the tolerance,
//! 4. updates both collision models and merges their costs,
//! 5. asks the trajectory generator for a joint velocity,
//! 6. clamps the velocity into the joint limits and publishes it.
//!
//! # Example:
//!```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nalgebra::Isometry3;
//! use reactive_control::{
//!     Collaborators, ControlResult, ControllerConfiguration, GoalRequest, JointState,
//!     Primitive, ProcessContext, StaticObstacle,
//! };
//! # fn collaborators() -> Collaborators { unimplemented!() }
//! # fn read_joint_state() -> JointState { unimplemented!() }
//! fn main() -> ControlResult<()> {
//!     let config = ControllerConfiguration::default();
//!     let context = ProcessContext::start(config, collaborators(), None)?;
//!     context.obstacle_registry().add_obstacle(StaticObstacle::new(
//!         "box1",
//!         Primitive::Sphere { radius: 0.1 },
//!         Isometry3::translation(0.5, 0.2, 0.4),
//!     ))?;
//!     let goals = context.goal_client();
//!     let id = goals.send_goal(GoalRequest::new(Isometry3::translation(0.4, 0., 0.6)))?;
//!     let feed = context.joint_state_feed();
//!     loop {
//!         feed.publish(read_joint_state())?;
//!         if goals.wait_for_result(id, Duration::from_millis(1)).is_some() {
//!             break;
//!         }
//!     }
//!     context.shutdown()?;
//!     Ok(())
//! }
//!   ```
//!
//! The main function returns a ControlResult<()> which means that it returns either Ok(())
//! or an Error of type ControlException.
//!
//!```no_run
//! # use reactive_control::{Collaborators, ControlResult, ControllerConfiguration, ProcessContext};
//! # fn collaborators() -> Collaborators { unimplemented!() }
//! # fn main() -> ControlResult<()> {
//! let context = ProcessContext::start(ControllerConfiguration::default(), collaborators(), None)?;
//! # Ok(())
//! # }
//! ```
//! validates the configuration, initializes all collaborators, generates the collision volumes
//! and starts the control loop on its own thread. The last argument is an optional initial
//! joint state at which the collision volumes are generated.
//!
//! ```ignore
//! context.obstacle_registry().add_obstacle(...)?;
//! ```
//! adds a static obstacle. The registry handle can be cloned into any thread; mutations take
//! effect between two ticks.
//!
//! The goal is sent with a [`GoalClient`]. It becomes active at the next tick and the client
//! receives feedback every tick and a [`GoalResult`] once the goal succeeded, was preempted or
//! aborted. Joint states are fed through the [`JointStateFeed`]; if no fresh joint state is
//! available the controller commands zero velocity.
//!
//! With [`ControlSwitches::set_tracking`] the controller follows the pose of a target frame
//! whenever no goal is active, and [`ControlSwitches::set_output_enabled`] replaces every
//! command by zero velocity without stopping the computation.
pub mod collision;
pub mod config;
pub mod context;
pub mod exception;
pub mod interfaces;
pub mod supervisor;
pub mod utils;

pub use collision::self_collision::SelfCollisionModel;
pub use collision::static_collision::{
    ObstacleRegistryHandle, Primitive, StaticCollisionModel, StaticObstacle,
};
pub use collision::{logistic_cost, BoundingVolume, CollisionCostVector, CollisionMatrix};
pub use config::*;
pub use context::ProcessContext;
pub use exception::{ControlException, ControlResult};
pub use interfaces::*;
pub use supervisor::control_loop::ControlLoop;
pub use supervisor::control_types::JointVelocities;
pub use supervisor::goal::{
    GoalClient, GoalEvent, GoalFeedback, GoalId, GoalRequest, GoalResult, GoalStatus,
};
pub use supervisor::joint_state::{JointState, JointStateFeed};
pub use supervisor::limits::Limits;
pub use supervisor::logger::Record;
pub use supervisor::switches::ControlSwitches;
pub use supervisor::{Collaborators, ControlSupervisor, TickOutcome};
pub use utils::*;
