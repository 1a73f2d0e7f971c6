// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the traits of the external collaborators of the controller.
//!
//! The controller never talks to a transport directly. Everything it consumes or produces
//! goes through one of these traits, so they can be backed by any middleware or by plain
//! in-process implementations. All traits require `Send + Sync` because the control loop
//! runs on its own thread and calls them through shared handles.
use nalgebra::{Matrix4, Vector3, Vector6};
use thiserror::Error;

use crate::collision::CollisionCostVector;
use crate::exception::ControlResult;
use crate::supervisor::control_types::JointVelocities;
use crate::supervisor::joint_state::JointState;
use crate::supervisor::limits::Limits;
use crate::utils::{JointVector, Pose};

#[cfg(test)]
use mockall::automock;

/// Reason why a transform lookup failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// One of the frames is not known to the provider.
    #[error("frame not found: {0}")]
    NotFound(String),
    /// The newest transform between the frames is too old.
    #[error("transform expired: {0}")]
    Expired(String),
    /// The transform would have to be extrapolated into the future.
    #[error("extrapolation required: {0}")]
    Extrapolation(String),
}

/// Queries and broadcasts coordinate frame transforms.
#[cfg_attr(test, automock)]
pub trait TransformProvider: Send + Sync {
    /// Prepares the provider. Called once from
    /// [`ControlSupervisor::initialize`](`crate::ControlSupervisor::initialize`).
    fn initialize(&self) -> ControlResult<()> {
        Ok(())
    }

    /// Returns the pose of `to` expressed in `from`.
    ///
    /// Implementations must not block for longer than a small fraction of a tick; they fail
    /// instead.
    fn lookup(&self, from: &str, to: &str) -> Result<Pose, TransformError>;

    /// Broadcasts a frame which never moves relative to its parent.
    fn broadcast_static(&self, frame: &str, parent: &str, pose: &Pose);
}

/// Result of a forward kinematics computation.
#[derive(Debug, Clone)]
pub struct ForwardKinematics {
    /// Homogeneous transform of every link frame relative to the root frame.
    pub link_transforms: Vec<Matrix4<f64>>,
    /// Homogeneous transform between two consecutive link frames, i.e. entry `i` is the
    /// transform from link `i` to link `i + 1`.
    pub joint_transforms: Vec<Matrix4<f64>>,
}

/// Computes the forward kinematics of the manipulator.
#[cfg_attr(test, automock)]
pub trait KinematicsProvider: Send + Sync {
    fn initialize(&self) -> ControlResult<()> {
        Ok(())
    }

    /// Number of joints of the kinematic chain.
    fn degree_of_freedom(&self) -> usize;

    /// Computes the link transforms for the given joint positions.
    fn forward_kinematics(&self, joint_positions: &JointVector) -> ControlResult<ForwardKinematics>;
}

/// Everything the trajectory generator gets to compute one velocity command.
#[derive(Debug, Clone)]
pub struct TrajectoryRequest<'a> {
    /// Cartesian error between the tracking frame and the goal, see
    /// [`cartesian_error`](`crate::utils::cartesian_error`).
    pub pose_error: Vector6<f64>,
    pub limits: &'a Limits,
    /// Merged self and static collision costs, see
    /// [`merge_collision_costs`](`crate::collision::merge_collision_costs`).
    pub collision_costs: &'a CollisionCostVector,
    /// Joint state the command is computed for.
    pub joint_state: &'a JointState,
}

/// Reason why the trajectory generator could not produce a command.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("trajectory infeasible: {0}")]
pub struct TrajectoryInfeasible(pub String);

/// Computes the joint velocity command which drives the robot to the goal.
pub trait TrajectoryGenerator: Send + Sync {
    fn initialize(&self) -> ControlResult<()> {
        Ok(())
    }

    /// Computes a velocity command with one entry per joint.
    fn compute_velocity(
        &self,
        request: &TrajectoryRequest<'_>,
    ) -> Result<JointVector, TrajectoryInfeasible>;
}

/// Shape of a visualization marker.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MarkerShape {
    Sphere,
    Cube,
    Cylinder,
    Cone,
}

/// Whether a marker is added/updated or deleted.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MarkerAction {
    Add,
    Delete,
}

/// A visualization marker of a collision volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    /// Group of the marker, e.g. `"self_collision"`.
    pub namespace: String,
    /// Id which is unique inside the namespace.
    pub id: u32,
    /// Frame the pose is expressed in.
    pub frame_id: String,
    pub shape: MarkerShape,
    pub action: MarkerAction,
    pub pose: Pose,
    /// Extent of the marker along its axes in \[m\].
    pub scale: Vector3<f64>,
}

/// Publishes diagnostic data. Every call is fire-and-forget and must never block.
#[cfg_attr(test, automock)]
pub trait Telemetry: Send + Sync {
    fn publish_markers(&self, markers: &[Marker]);

    fn publish_scalar(&self, topic: &str, value: f64);

    /// Publishes the Cartesian error between tracking frame and goal.
    fn publish_cartesian_error(&self, error: &Vector6<f64>);
}

/// Sends the controlled joint velocities to the robot.
#[cfg_attr(test, automock)]
pub trait CommandPublisher: Send + Sync {
    fn publish(&self, command: &JointVelocities);
}
