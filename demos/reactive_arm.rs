// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use nalgebra::{DMatrix, Isometry3, Matrix4, Translation3, UnitQuaternion, Vector3, Vector6};
use parking_lot::Mutex;
use reactive_control::{
    cartesian_error, homogeneous_to_pose, Collaborators, CommandPublisher, ControlResult,
    ControllerConfiguration, ForwardKinematics, GoalEvent, GoalRequest, GoalStatus, JointState,
    JointVector, JointVelocities, KinematicsProvider, Marker, Pose, Primitive, ProcessContext,
    RealtimeConfig, StaticObstacle, Telemetry, TrajectoryGenerator, TrajectoryInfeasible,
    TrajectoryRequest, TransformError, TransformProvider,
};
use tracing::{debug, info, warn};

/// Simulates a serial arm and drives its end effector to a goal pose while avoiding a spherical
/// obstacle. The arm is integrated in this process, no hardware is needed.
#[derive(Parser, Debug)]
#[command(name = "reactive_arm")]
struct CommandLineArguments {
    /// Number of joints of the simulated arm
    #[arg(long, default_value_t = 6)]
    dof: usize,
    /// Frequency of the control loop in Hz
    #[arg(long, default_value_t = 50.)]
    frequency: f64,
    /// Goal position of the end effector (x y z) in m
    #[arg(long, num_args = 3, default_values_t = [0.4, 0.2, 0.9])]
    goal: Vec<f64>,
    /// Adds a sphere obstacle with radius 0.1 m at this position (x y z)
    #[arg(long, num_args = 3)]
    obstacle: Option<Vec<f64>>,
    /// Time in s after which the goal is preempted
    #[arg(long, default_value_t = 20.)]
    timeout: f64,
    /// Run the control loop with realtime priority
    #[arg(long)]
    realtime: bool,
}

/// Length of every link in m.
static LINK_LENGTH: f64 = 0.3;

/// Serial arm whose joints alternate between rotations about z and y, with links along z.
struct SerialArm {
    dof: usize,
}

impl SerialArm {
    fn joint_transform(&self, joint: usize, angle: f64) -> Matrix4<f64> {
        let axis = if joint % 2 == 0 {
            Vector3::z_axis()
        } else {
            Vector3::y_axis()
        };
        Isometry3::from_parts(
            Translation3::new(0., 0., LINK_LENGTH),
            UnitQuaternion::from_axis_angle(&axis, angle),
        )
        .to_homogeneous()
    }

    fn end_effector(&self, joint_positions: &JointVector) -> Pose {
        let mut pose = Matrix4::identity();
        for (joint, angle) in joint_positions.iter().enumerate() {
            pose *= self.joint_transform(joint, *angle);
        }
        homogeneous_to_pose(&pose)
    }
}

impl KinematicsProvider for SerialArm {
    fn degree_of_freedom(&self) -> usize {
        self.dof
    }

    fn forward_kinematics(&self, joint_positions: &JointVector) -> ControlResult<ForwardKinematics> {
        let mut link_transforms = Vec::with_capacity(self.dof);
        let mut joint_transforms = Vec::with_capacity(self.dof);
        let mut pose = Matrix4::identity();
        for (joint, angle) in joint_positions.iter().enumerate() {
            let transform = self.joint_transform(joint, *angle);
            link_transforms.push(pose);
            joint_transforms.push(transform);
            pose *= transform;
        }
        Ok(ForwardKinematics {
            link_transforms,
            joint_transforms,
        })
    }
}

/// Knows only the pose of the end effector of the simulated arm.
struct SimulatedTransforms {
    arm: Arc<SerialArm>,
    joint_positions: Arc<Mutex<JointVector>>,
    tracking_frame: String,
}

impl TransformProvider for SimulatedTransforms {
    fn lookup(&self, _from: &str, to: &str) -> Result<Pose, TransformError> {
        if to != self.tracking_frame {
            return Err(TransformError::NotFound(to.to_string()));
        }
        Ok(self.arm.end_effector(&self.joint_positions.lock()))
    }

    fn broadcast_static(&self, frame: &str, parent: &str, pose: &Pose) {
        debug!("static frame {} in {}: {}", frame, parent, pose);
    }
}

/// Jacobian transpose controller which slows down with increasing collision cost.
struct JacobianTranspose {
    arm: Arc<SerialArm>,
    gain: f64,
}

impl JacobianTranspose {
    fn jacobian(&self, joint_positions: &JointVector) -> DMatrix<f64> {
        let epsilon = 1e-6;
        let base = self.arm.end_effector(joint_positions);
        let mut jacobian = DMatrix::zeros(6, joint_positions.len());
        for joint in 0..joint_positions.len() {
            let mut shifted = joint_positions.clone();
            shifted[joint] += epsilon;
            let error = cartesian_error(&base, &self.arm.end_effector(&shifted));
            jacobian.column_mut(joint).copy_from(&(error / epsilon));
        }
        jacobian
    }
}

impl TrajectoryGenerator for JacobianTranspose {
    fn compute_velocity(
        &self,
        request: &TrajectoryRequest<'_>,
    ) -> Result<JointVector, TrajectoryInfeasible> {
        let jacobian = self.jacobian(&request.joint_state.position);
        let mut error: Vector6<f64> = request.pose_error;
        // position only, the orientation of the end effector is free
        error.fixed_rows_mut::<3>(3).fill(0.);
        let error = DMatrix::from_column_slice(6, 1, error.as_slice());
        let velocity = jacobian.transpose() * error * self.gain;
        let slow_down = 1. + request.collision_costs.sum();
        let velocity = JointVector::from_column_slice(velocity.as_slice()) / slow_down;
        if velocity.iter().any(|x| !x.is_finite()) {
            return Err(TrajectoryInfeasible("jacobian is singular".to_string()));
        }
        Ok(velocity)
    }
}

/// Stores the newest command for the simulation.
struct SimulatedDrive {
    command: Arc<Mutex<JointVelocities>>,
}

impl CommandPublisher for SimulatedDrive {
    fn publish(&self, command: &JointVelocities) {
        *self.command.lock() = command.clone();
    }
}

struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn publish_markers(&self, markers: &[Marker]) {
        debug!("{} markers", markers.len());
    }

    fn publish_scalar(&self, topic: &str, value: f64) {
        debug!("{}: {:.4}", topic, value);
    }

    fn publish_cartesian_error(&self, error: &Vector6<f64>) {
        debug!("cartesian error: {:?}", error.as_slice());
    }
}

fn main() -> ControlResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .init();
    let args = CommandLineArguments::parse();

    let config = ControllerConfiguration {
        degree_of_freedom: args.dof,
        clock_frequency: args.frequency,
        root_frame: "base_link".to_string(),
        tracking_frame: "end_effector".to_string(),
        min_position_limit: vec![-2.8; args.dof],
        max_position_limit: vec![2.8; args.dof],
        min_velocity_limit: vec![-1.; args.dof],
        max_velocity_limit: vec![1.; args.dof],
        realtime_config: if args.realtime {
            RealtimeConfig::Enforce
        } else {
            RealtimeConfig::Ignore
        },
        ..Default::default()
    };

    let arm = Arc::new(SerialArm { dof: args.dof });
    let mut initial = JointVector::from_element(args.dof, 0.3);
    initial[0] = 0.;
    let joint_positions = Arc::new(Mutex::new(initial.clone()));
    let command = Arc::new(Mutex::new(JointVelocities::zeros(args.dof)));
    let collaborators = Collaborators {
        kinematics: arm.clone(),
        transforms: Arc::new(SimulatedTransforms {
            arm: arm.clone(),
            joint_positions: joint_positions.clone(),
            tracking_frame: config.tracking_frame.clone(),
        }),
        trajectory_generator: Arc::new(JacobianTranspose {
            arm: arm.clone(),
            gain: 2.,
        }),
        telemetry: Arc::new(LogTelemetry),
        command_publisher: Arc::new(SimulatedDrive {
            command: command.clone(),
        }),
    };
    let period = config.period();
    let context = ProcessContext::start(config, collaborators, Some(JointState::at_rest(initial)))?;

    if let Some(obstacle) = &args.obstacle {
        context.obstacle_registry().add_obstacle(StaticObstacle::new(
            "obstacle",
            Primitive::Sphere { radius: 0.1 },
            Pose::translation(obstacle[0], obstacle[1], obstacle[2]),
        ))?;
    }

    let goals = context.goal_client();
    let tolerance = Vector6::new(0.01, 0.01, 0.01, PI, PI, PI);
    let id = goals.send_goal(
        GoalRequest::new(Pose::translation(args.goal[0], args.goal[1], args.goal[2]))
            .with_tolerance(tolerance),
    )?;
    info!("sent goal {} to {:?}", id, args.goal);

    let feed = context.joint_state_feed();
    let started = Instant::now();
    let mut last_step = Instant::now();
    let mut preempted = false;
    let status = loop {
        let velocity = command.lock().as_vector();
        let position = {
            let mut position = joint_positions.lock();
            *position += &velocity * last_step.elapsed().as_secs_f64();
            position.clone()
        };
        last_step = Instant::now();
        feed.publish(JointState::new(position, velocity))?;

        match goals.next_event(period) {
            Some(GoalEvent::Finished(result)) if result.goal_id == id => {
                info!("goal finished: {} ({})", result.status, result.message);
                for record in result.log.iter() {
                    warn!("{}", record.log());
                }
                break result.status;
            }
            Some(GoalEvent::Feedback(feedback)) => debug!(
                "distance to goal {:.4} m",
                feedback.cartesian_error.fixed_rows::<3>(0).norm()
            ),
            _ => {}
        }
        if !preempted && started.elapsed() > Duration::from_secs_f64(args.timeout) {
            warn!("goal not reached after {} s, preempting", args.timeout);
            goals.preempt();
            preempted = true;
        }
    };

    context.shutdown()?;
    let end_effector = arm.end_effector(&joint_positions.lock());
    info!(
        "final status {} after {:.2} s, end effector at {:?}",
        status,
        started.elapsed().as_secs_f64(),
        end_effector.translation.vector.as_slice()
    );
    if status != GoalStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
