// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the collision models and the cost function they share.
//!
//! * [self_collision](`crate::collision::self_collision`) - bounding balls around the robot
//! body and the cost between links which are not adjacent.
//! * [static_collision](`crate::collision::static_collision`) - registry of static obstacles
//! and the cost between the robot body and the obstacles.
use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::utils::Pose;

pub mod self_collision;
pub mod static_collision;

/// Maps the id of a bounding volume or obstacle to its pose relative to the root frame.
///
/// Iterating the map yields the ids in sorted order, which keeps every cost vector computed
/// from it in a stable order.
pub type CollisionMatrix = BTreeMap<String, Pose>;

/// One non-negative cost per tracked pair.
pub type CollisionCostVector = DVector<f64>;

/// Upper bound of [`logistic_cost`].
pub static COST_CEILING: f64 = 1e6;
/// Distances below this value are treated as this value.
pub static MIN_DISTANCE_EPS: f64 = 1e-9;

/// Sphere approximation of a robot link or an obstacle.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingVolume {
    pub id: String,
    /// Center of the ball relative to the root frame.
    pub center: Pose,
    /// Radius in \[m\].
    pub radius: f64,
}

/// Computes a smooth repulsive cost for the given distance.
///
/// The cost is a logistic function centered at `min_distance` scaled by
/// `min_distance / distance`:
/// * it is approximately 0 if `distance` is much larger than `min_distance`,
/// * it is 0.5 at `min_distance` and rises steeply when approaching it,
/// * it grows like `1 / distance` below `min_distance` and saturates at [`COST_CEILING`].
///
/// The function is non-increasing in `distance` and finite for every finite input, so a
/// gradient based optimizer can use it as soft constraint.
/// # Arguments
/// * `distance` - Distance between the two volumes in \[m\].
/// * `min_distance` - Minimum distance in \[m\], below that the robot should not go. Must be positive.
/// * `weight_factor` - Convergence rate of the logistic function. Must be positive.
/// # Return
/// Cost in the range (0, [`COST_CEILING`]].
pub fn logistic_cost(distance: f64, min_distance: f64, weight_factor: f64) -> f64 {
    debug_assert!(min_distance > 0. && weight_factor > 0.);
    let distance = f64::max(distance, MIN_DISTANCE_EPS);
    let logistic = 1. / (1. + f64::exp(weight_factor * (distance - min_distance)));
    let cost = logistic * (min_distance / distance);
    cost.max(f64::MIN_POSITIVE).min(COST_CEILING)
}

/// Merges the self-collision and static-collision costs into the vector handed to the
/// trajectory generator.
///
/// The result is the self-collision vector followed by one entry per robot critical point
/// holding the sum of its static costs over all obstacles. Its length only depends on the
/// robot model and never on the number of registered obstacles.
/// # Arguments
/// * `self_collision_costs` - One cost per tracked link pair.
/// * `static_costs_per_point` - One aggregated cost per robot critical point, see
/// [`StaticCollisionModel::aggregate_per_point`](`crate::collision::static_collision::StaticCollisionModel::aggregate_per_point`).
pub fn merge_collision_costs(
    self_collision_costs: &CollisionCostVector,
    static_costs_per_point: &CollisionCostVector,
) -> CollisionCostVector {
    CollisionCostVector::from_iterator(
        self_collision_costs.len() + static_costs_per_point.len(),
        self_collision_costs
            .iter()
            .chain(static_costs_per_point.iter())
            .copied(),
    )
}
