// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the configuration types of the controller.
//!
//! The configuration is immutable once the controller was constructed. It is shared by
//! reference between the [`ControlSupervisor`](`crate::ControlSupervisor`) and both
//! collision models. All types implement [`serde::Deserialize`], so an orchestrator can read
//! them from any format it likes; missing fields fall back to the defaults.
use std::time::Duration;

use nalgebra::Vector6;
use serde::{Deserialize, Serialize};

use crate::exception::{create_configuration_exception, ControlResult};

/// Longest period and joint state timeout in \[s\] which is accepted by
/// [`ControllerConfiguration::validate`].
pub static MAX_DURATION_SECONDS: f64 = 1e6;

/// Used to decide whether to enforce realtime mode for the control loop thread.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub enum RealtimeConfig {
    Enforce,
    Ignore,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig::Ignore
    }
}

/// Parameters of the self-collision model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelfCollisionConfiguration {
    /// Radius of every bounding ball around the robot body in \[m\].
    pub ball_radius: f64,
    /// Minimum distance between two ball centers in \[m\], below that the robot should not go.
    pub minimum_distance: f64,
    /// Convergence rate of the logistic cost.
    pub weight_factor: f64,
    /// Whether an additional ball is placed between two consecutive link frames.
    pub intermediate_balls: bool,
    /// Balls which are at most this many positions apart along the chain are not checked
    /// against each other.
    pub adjacency_skip: usize,
    /// Pairs of volume names which are never checked against each other.
    pub ignored_pairs: Vec<(String, String)>,
    /// Frame names of the links, in kinematic chain order. If empty, the links are named
    /// `link_0`, `link_1`, ...
    pub link_names: Vec<String>,
}

impl Default for SelfCollisionConfiguration {
    fn default() -> Self {
        SelfCollisionConfiguration {
            ball_radius: 0.1,
            minimum_distance: 0.15,
            weight_factor: 50.,
            intermediate_balls: true,
            adjacency_skip: 2,
            ignored_pairs: Vec::new(),
            link_names: Vec::new(),
        }
    }
}

/// Parameters of the static-collision model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StaticCollisionConfiguration {
    /// Distance to the obstacle surface in \[m\] at which the cost starts to rise steeply.
    pub threshold_distance: f64,
    /// Convergence rate of the logistic cost.
    pub weight_factor: f64,
}

impl Default for StaticCollisionConfiguration {
    fn default() -> Self {
        StaticCollisionConfiguration {
            threshold_distance: 0.2,
            weight_factor: 50.,
        }
    }
}

/// Configuration of the complete controller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfiguration {
    /// Number of controlled joints.
    pub degree_of_freedom: usize,
    /// Frequency of the control loop in \[Hz\].
    pub clock_frequency: f64,
    /// Root frame of the kinematic chain. All collision volumes are expressed in this frame.
    pub root_frame: String,
    /// Frame which is driven towards the goal, usually the end effector.
    pub tracking_frame: String,
    /// Frame whose pose is used as target while tracking is enabled and no goal is active.
    pub target_frame: String,
    /// Whether tracking of the target frame is enabled at startup.
    pub tracking: bool,
    /// Whether velocity commands are published at startup. If not, zero is published instead.
    pub output_enabled: bool,
    /// Per-joint minimum positions.
    pub min_position_limit: Vec<f64>,
    /// Per-joint maximum positions.
    pub max_position_limit: Vec<f64>,
    /// Per-joint minimum velocities.
    pub min_velocity_limit: Vec<f64>,
    /// Per-joint maximum velocities.
    pub max_velocity_limit: Vec<f64>,
    /// Default goal tolerance (x, y, z, rx, ry, rz), used if a goal does not carry its own.
    pub goal_tolerance: [f64; 6],
    /// Tolerance used when checking joint positions against their limits.
    pub position_tolerance: f64,
    /// Joint states older than this many seconds force a zero velocity command.
    pub joint_state_timeout: f64,
    /// Number of consecutive failed transform lookups after which the goal is aborted.
    pub max_transform_failures: u32,
    /// Number of (state, command) records kept for diagnostics.
    pub log_size: usize,
    /// Whether collision volumes are published as markers.
    pub publish_markers: bool,
    /// Whether the control loop thread runs with realtime priority.
    pub realtime_config: RealtimeConfig,
    pub self_collision: SelfCollisionConfiguration,
    pub static_collision: StaticCollisionConfiguration,
}

impl Default for ControllerConfiguration {
    fn default() -> Self {
        ControllerConfiguration {
            degree_of_freedom: 7,
            clock_frequency: 50.,
            root_frame: "arm_base_link".to_string(),
            tracking_frame: "arm_7_link".to_string(),
            target_frame: "target".to_string(),
            tracking: false,
            output_enabled: true,
            min_position_limit: vec![-2.9, -1.76, -2.9, -3.07, -2.9, -0.02, -2.9],
            max_position_limit: vec![2.9, 1.76, 2.9, -0.07, 2.9, 3.75, 2.9],
            min_velocity_limit: vec![-1.0; 7],
            max_velocity_limit: vec![1.0; 7],
            goal_tolerance: [0.01, 0.01, 0.01, 0.05, 0.05, 0.05],
            position_tolerance: 0.0,
            joint_state_timeout: 0.5,
            max_transform_failures: 10,
            log_size: 50,
            publish_markers: true,
            realtime_config: RealtimeConfig::Ignore,
            self_collision: SelfCollisionConfiguration::default(),
            static_collision: StaticCollisionConfiguration::default(),
        }
    }
}

impl ControllerConfiguration {
    /// Duration of one tick of the control loop.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1. / self.clock_frequency)
    }

    /// Maximum age of a joint state before the safety fallback kicks in.
    pub fn joint_state_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.joint_state_timeout)
    }

    /// Default goal tolerance as vector.
    pub fn goal_tolerance(&self) -> Vector6<f64> {
        Vector6::from_column_slice(&self.goal_tolerance)
    }

    /// Checks that the configuration is consistent.
    ///
    /// # Errors
    /// * ConfigurationException if a limit vector does not match the degree of freedom, a
    /// frequency, distance or weight is not positive, a tolerance is negative or the period
    /// or joint state timeout exceed [`MAX_DURATION_SECONDS`].
    pub fn validate(&self) -> ControlResult<()> {
        if self.degree_of_freedom == 0 {
            return Err(create_configuration_exception(
                "degree_of_freedom must be greater than zero",
            ));
        }
        let limits = [
            ("min_position_limit", &self.min_position_limit),
            ("max_position_limit", &self.max_position_limit),
            ("min_velocity_limit", &self.min_velocity_limit),
            ("max_velocity_limit", &self.max_velocity_limit),
        ];
        for (name, limit) in limits.iter() {
            if limit.len() != self.degree_of_freedom {
                return Err(create_configuration_exception(format!(
                    "{} has {} entries, expected {}",
                    name,
                    limit.len(),
                    self.degree_of_freedom
                )));
            }
            if limit.iter().any(|x| !x.is_finite()) {
                return Err(create_configuration_exception(format!(
                    "{} contains non-finite values",
                    name
                )));
            }
        }
        let positive = [
            ("clock_frequency", self.clock_frequency),
            ("joint_state_timeout", self.joint_state_timeout),
            ("self_collision.ball_radius", self.self_collision.ball_radius),
            (
                "self_collision.minimum_distance",
                self.self_collision.minimum_distance,
            ),
            (
                "self_collision.weight_factor",
                self.self_collision.weight_factor,
            ),
            (
                "static_collision.threshold_distance",
                self.static_collision.threshold_distance,
            ),
            (
                "static_collision.weight_factor",
                self.static_collision.weight_factor,
            ),
        ];
        for (name, value) in positive.iter() {
            if !(value.is_finite() && *value > 0.) {
                return Err(create_configuration_exception(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        let durations = [
            ("period", 1. / self.clock_frequency),
            ("joint_state_timeout", self.joint_state_timeout),
        ];
        for (name, seconds) in durations.iter() {
            if *seconds > MAX_DURATION_SECONDS {
                return Err(create_configuration_exception(format!(
                    "{} of {} s exceeds {} s",
                    name, seconds, MAX_DURATION_SECONDS
                )));
            }
        }
        if self
            .goal_tolerance
            .iter()
            .chain(std::iter::once(&self.position_tolerance))
            .any(|x| !(x.is_finite() && *x >= 0.))
        {
            return Err(create_configuration_exception(
                "tolerances must be non-negative and finite",
            ));
        }
        if self.root_frame.is_empty()
            || self.tracking_frame.is_empty()
            || self.target_frame.is_empty()
        {
            return Err(create_configuration_exception(
                "root_frame, tracking_frame and target_frame must not be empty",
            ));
        }
        if self.log_size == 0 {
            return Err(create_configuration_exception(
                "log_size must be greater than zero",
            ));
        }
        Ok(())
    }
}
