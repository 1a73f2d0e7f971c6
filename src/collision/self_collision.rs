// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the bounding ball model of the robot body and its self-collision cost.
use std::sync::Arc;

use nalgebra::{Matrix4, Translation3, UnitQuaternion, Vector3};
use tracing::{debug, warn};

use crate::collision::{logistic_cost, BoundingVolume, CollisionCostVector, CollisionMatrix};
use crate::config::ControllerConfiguration;
use crate::exception::{create_malformed_input, ControlException, ControlResult};
use crate::interfaces::{
    ForwardKinematics, Marker, MarkerAction, MarkerShape, Telemetry, TransformProvider,
};
use crate::utils::{
    get_euclidean_distance, homogeneous_to_pose, is_homogeneous_transformation, Pose,
};

/// Marker namespace of the self-collision balls.
pub static SELF_COLLISION_NAMESPACE: &str = "self_collision";

/// Change of an intermediate ball offset in \[m\] above which its frame is broadcast again.
static OFFSET_EPSILON: f64 = 1e-9;

/// A ball attached to the kinematic chain.
#[derive(Debug, Clone)]
struct TrackedBall {
    volume: BoundingVolume,
    /// Index of the link frame the ball is attached to.
    link: usize,
    /// Position along the chain, used to skip neighbouring balls.
    chain_index: usize,
    /// Offset relative to the link frame.
    offset: Translation3<f64>,
    /// Whether the ball sits halfway to the next link frame.
    intermediate: bool,
}

/// Approximates the manipulator by bounding balls and computes a repulsive cost between
/// balls which are not neighbours along the kinematic chain.
///
/// One ball is placed at the origin of every link frame. If
/// [`intermediate_balls`](`crate::config::SelfCollisionConfiguration::intermediate_balls`) is
/// set, an additional ball named `<link>_mid` is placed halfway to the next link frame. Its
/// offset follows the transform to the next link at every update.
pub struct SelfCollisionModel {
    config: Arc<ControllerConfiguration>,
    transforms: Arc<dyn TransformProvider>,
    telemetry: Arc<dyn Telemetry>,
    balls: Vec<TrackedBall>,
    tracked_pairs: Vec<(String, String)>,
    collision_matrix: CollisionMatrix,
    collision_cost_vector: CollisionCostVector,
}

impl SelfCollisionModel {
    /// Creates an empty model. Call [`generate_collision_volume`](`Self::generate_collision_volume`)
    /// before using it.
    pub fn new(
        config: Arc<ControllerConfiguration>,
        transforms: Arc<dyn TransformProvider>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        SelfCollisionModel {
            config,
            transforms,
            telemetry,
            balls: Vec::new(),
            tracked_pairs: Vec::new(),
            collision_matrix: CollisionMatrix::new(),
            collision_cost_vector: CollisionCostVector::zeros(0),
        }
    }

    /// Pose of every ball center relative to the root frame.
    pub fn collision_matrix(&self) -> &CollisionMatrix {
        &self.collision_matrix
    }

    /// Cost vector of the last call to [`update_cost`](`Self::update_cost`).
    pub fn collision_cost_vector(&self) -> &CollisionCostVector {
        &self.collision_cost_vector
    }

    /// Pairs of ball ids which are checked against each other, in the order of the cost vector.
    pub fn tracked_pairs(&self) -> &[(String, String)] {
        &self.tracked_pairs
    }

    /// All bounding volumes with their current centers.
    pub fn bounding_volumes(&self) -> Vec<BoundingVolume> {
        self.balls.iter().map(|ball| ball.volume.clone()).collect()
    }

    /// Returns true once the collision volume was generated.
    pub fn is_generated(&self) -> bool {
        !self.balls.is_empty()
    }

    fn link_name(&self, link: usize) -> String {
        match self.config.self_collision.link_names.get(link) {
            Some(name) => name.clone(),
            None => format!("link_{}", link),
        }
    }

    fn is_ignored(&self, a: &str, b: &str) -> bool {
        self.config
            .self_collision
            .ignored_pairs
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Creates the collision matrix using forward kinematics relative to the root frame.
    ///
    /// Fixes the set of balls and the set of tracked pairs, broadcasts a static frame for every
    /// intermediate ball and publishes the ball markers.
    /// # Arguments
    /// * `forward_kinematics` - Link transforms relative to the root frame and transforms
    /// between consecutive links.
    /// # Errors
    /// * MalformedInput if a transform is not a valid homogeneous transformation or the
    /// configured link names do not match the number of links.
    pub fn generate_collision_volume(
        &mut self,
        forward_kinematics: &ForwardKinematics,
    ) -> ControlResult<()> {
        validate_transforms(forward_kinematics)?;
        let link_count = forward_kinematics.link_transforms.len();
        let link_names = &self.config.self_collision.link_names;
        if !link_names.is_empty() && link_names.len() != link_count {
            return Err(create_malformed_input(format!(
                "{} link names configured but forward kinematics has {} links",
                link_names.len(),
                link_count
            )));
        }
        let radius = self.config.self_collision.ball_radius;
        let intermediate = self.config.self_collision.intermediate_balls;

        let mut balls = Vec::new();
        for (link, transform) in forward_kinematics.link_transforms.iter().enumerate() {
            let link_pose = homogeneous_to_pose(transform);
            let chain_index = if intermediate { 2 * link } else { link };
            balls.push(TrackedBall {
                volume: BoundingVolume {
                    id: self.link_name(link),
                    center: link_pose,
                    radius,
                },
                link,
                chain_index,
                offset: Translation3::identity(),
                intermediate: false,
            });
            if !intermediate {
                continue;
            }
            if let Some(joint_transform) = forward_kinematics.joint_transforms.get(link) {
                if link + 1 >= link_count {
                    continue;
                }
                let offset = half_way(joint_transform);
                balls.push(TrackedBall {
                    volume: BoundingVolume {
                        id: format!("{}_mid", self.link_name(link)),
                        center: link_pose * offset,
                        radius,
                    },
                    link,
                    chain_index: chain_index + 1,
                    offset,
                    intermediate: true,
                });
            }
        }

        let skip = self.config.self_collision.adjacency_skip;
        let mut tracked_pairs = Vec::new();
        for (i, a) in balls.iter().enumerate() {
            for b in balls.iter().skip(i + 1) {
                if b.chain_index.abs_diff(a.chain_index) <= skip {
                    continue;
                }
                if self.is_ignored(&a.volume.id, &b.volume.id) {
                    continue;
                }
                tracked_pairs.push((a.volume.id.clone(), b.volume.id.clone()));
            }
        }

        for ball in balls.iter().filter(|ball| ball.intermediate) {
            self.broadcast_intermediate(ball);
        }

        debug!(
            "generated {} self-collision balls with {} tracked pairs",
            balls.len(),
            tracked_pairs.len()
        );
        self.balls = balls;
        self.tracked_pairs = tracked_pairs;
        self.collision_cost_vector = CollisionCostVector::zeros(self.tracked_pairs.len());
        self.rebuild_matrix();
        self.visualize_collision_volume();
        Ok(())
    }

    fn broadcast_intermediate(&self, ball: &TrackedBall) {
        self.transforms.broadcast_static(
            &ball.volume.id,
            &self.link_name(ball.link),
            &Pose::from_parts(ball.offset, UnitQuaternion::identity()),
        );
    }

    /// Updates the collision matrix using forward kinematics relative to the root frame.
    ///
    /// Intermediate balls are moved halfway along the current transform to the next link, and
    /// their frame is broadcast again if that offset changed. Runs in O(number of balls).
    /// # Errors
    /// * InitializationException if the volume was not generated yet.
    /// * MalformedInput if the number of links changed or a transform is invalid.
    pub fn update_collision_volume(
        &mut self,
        forward_kinematics: &ForwardKinematics,
    ) -> ControlResult<()> {
        if !self.is_generated() {
            return Err(ControlException::InitializationException {
                message: "self-collision volume was not generated".to_string(),
            });
        }
        validate_transforms(forward_kinematics)?;
        let link_count = forward_kinematics.link_transforms.len();
        let joint_count = forward_kinematics.joint_transforms.len();
        if self
            .balls
            .iter()
            .any(|ball| ball.link >= link_count || (ball.intermediate && ball.link >= joint_count))
        {
            return Err(create_malformed_input(format!(
                "forward kinematics has {} links and {} joint transforms, expected more",
                link_count, joint_count
            )));
        }
        let mut moved = Vec::new();
        for (index, ball) in self.balls.iter_mut().enumerate() {
            if ball.intermediate {
                let offset = half_way(&forward_kinematics.joint_transforms[ball.link]);
                if (offset.vector - ball.offset.vector).norm() > OFFSET_EPSILON {
                    moved.push(index);
                }
                ball.offset = offset;
            }
            let link_pose = homogeneous_to_pose(&forward_kinematics.link_transforms[ball.link]);
            ball.volume.center = link_pose * ball.offset;
        }
        for index in moved {
            self.broadcast_intermediate(&self.balls[index]);
        }
        self.rebuild_matrix();
        self.visualize_collision_volume();
        Ok(())
    }

    fn rebuild_matrix(&mut self) {
        self.collision_matrix = self
            .balls
            .iter()
            .map(|ball| (ball.volume.id.clone(), ball.volume.center))
            .collect();
    }

    /// Publishes one sphere marker per ball, if markers are enabled.
    ///
    /// Never fails; the telemetry sink is fire-and-forget.
    pub fn visualize_collision_volume(&self) {
        if !self.config.publish_markers {
            return;
        }
        let markers: Vec<Marker> = self
            .balls
            .iter()
            .enumerate()
            .map(|(id, ball)| Marker {
                namespace: SELF_COLLISION_NAMESPACE.to_string(),
                id: id as u32,
                frame_id: self.config.root_frame.clone(),
                shape: MarkerShape::Sphere,
                action: MarkerAction::Add,
                pose: ball.volume.center,
                scale: Vector3::repeat(2. * ball.volume.radius),
            })
            .collect();
        self.telemetry.publish_markers(&markers);
    }

    /// Computes the self-collision cost of every tracked pair.
    ///
    /// # Arguments
    /// * `collision_matrix` - Pose of every ball relative to the root frame.
    /// * `min_distance` - Minimum distance between two ball centers, below that the robot
    /// should not go.
    /// * `weight_factor` - Convergence rate of the cost.
    /// # Return
    /// One cost per tracked pair, see [`tracked_pairs`](`Self::tracked_pairs`).
    /// # Errors
    /// * MalformedInput if the matrix lacks a tracked ball.
    pub fn compute_collision_cost(
        &self,
        collision_matrix: &CollisionMatrix,
        min_distance: f64,
        weight_factor: f64,
    ) -> ControlResult<CollisionCostVector> {
        let mut costs = CollisionCostVector::zeros(self.tracked_pairs.len());
        for (i, (a, b)) in self.tracked_pairs.iter().enumerate() {
            let (pose_a, pose_b) = match (collision_matrix.get(a), collision_matrix.get(b)) {
                (Some(pose_a), Some(pose_b)) => (pose_a, pose_b),
                _ => {
                    return Err(create_malformed_input(format!(
                        "collision matrix lacks pair ({}, {})",
                        a, b
                    )))
                }
            };
            let distance = get_euclidean_distance(pose_a, pose_b);
            costs[i] = logistic_cost(distance, min_distance, weight_factor);
            if distance < min_distance {
                warn!(
                    "self-collision distance between {} and {} is {:.3} m",
                    a, b, distance
                );
            }
        }
        Ok(costs)
    }

    /// Computes the cost of the current collision matrix with the configured parameters and
    /// stores it.
    pub fn update_cost(&mut self) -> ControlResult<&CollisionCostVector> {
        let parameters = &self.config.self_collision;
        self.collision_cost_vector = self.compute_collision_cost(
            &self.collision_matrix,
            parameters.minimum_distance,
            parameters.weight_factor,
        )?;
        Ok(&self.collision_cost_vector)
    }
}

/// Offset from a link frame to the point halfway to the next link frame.
fn half_way(joint_transform: &Matrix4<f64>) -> Translation3<f64> {
    let half: Vector3<f64> = homogeneous_to_pose(joint_transform).translation.vector / 2.;
    Translation3::from(half)
}

fn validate_transforms(forward_kinematics: &ForwardKinematics) -> ControlResult<()> {
    if forward_kinematics.link_transforms.is_empty() {
        return Err(create_malformed_input(
            "forward kinematics contains no link transforms",
        ));
    }
    if !forward_kinematics
        .link_transforms
        .iter()
        .chain(forward_kinematics.joint_transforms.iter())
        .all(is_homogeneous_transformation)
    {
        return Err(create_malformed_input(
            "forward kinematics contains an invalid homogeneous transformation",
        ));
    }
    Ok(())
}
