// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the registry of static obstacles and the robot-to-obstacle cost.
use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collision::{logistic_cost, CollisionCostVector, CollisionMatrix};
use crate::config::ControllerConfiguration;
use crate::exception::{create_registry_error, ControlResult};
use crate::interfaces::{Marker, MarkerAction, MarkerShape, Telemetry, TransformProvider};
use crate::utils::{get_euclidean_distance, Pose};

/// Marker namespace of the static obstacles.
pub static STATIC_COLLISION_NAMESPACE: &str = "static_collision";

/// Shape and dimensions of a static obstacle. All dimensions are in \[m\].
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Primitive {
    Sphere { radius: f64 },
    Box { x: f64, y: f64, z: f64 },
    Cylinder { height: f64, radius: f64 },
    Cone { height: f64, radius: f64 },
}

impl Primitive {
    /// Returns all dimensions of the primitive.
    pub fn dimensions(&self) -> Vec<f64> {
        match *self {
            Primitive::Sphere { radius } => vec![radius],
            Primitive::Box { x, y, z } => vec![x, y, z],
            Primitive::Cylinder { height, radius } => vec![height, radius],
            Primitive::Cone { height, radius } => vec![height, radius],
        }
    }

    /// Returns true if all dimensions are positive and finite.
    pub fn has_valid_dimensions(&self) -> bool {
        self.dimensions()
            .iter()
            .all(|dimension| dimension.is_finite() && *dimension > 0.)
    }

    /// Radius of the smallest ball around the primitive center which contains the primitive.
    pub fn bounding_radius(&self) -> f64 {
        match *self {
            Primitive::Sphere { radius } => radius,
            Primitive::Box { x, y, z } => 0.5 * f64::sqrt(x * x + y * y + z * z),
            Primitive::Cylinder { height, radius } | Primitive::Cone { height, radius } => {
                f64::sqrt((0.5 * height).powi(2) + radius * radius)
            }
        }
    }

    fn marker_shape(&self) -> MarkerShape {
        match self {
            Primitive::Sphere { .. } => MarkerShape::Sphere,
            Primitive::Box { .. } => MarkerShape::Cube,
            Primitive::Cylinder { .. } => MarkerShape::Cylinder,
            Primitive::Cone { .. } => MarkerShape::Cone,
        }
    }

    fn marker_scale(&self) -> Vector3<f64> {
        match *self {
            Primitive::Sphere { radius } => Vector3::repeat(2. * radius),
            Primitive::Box { x, y, z } => Vector3::new(x, y, z),
            Primitive::Cylinder { height, radius } | Primitive::Cone { height, radius } => {
                Vector3::new(2. * radius, 2. * radius, height)
            }
        }
    }
}

/// A static obstacle as it is handed to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticObstacle {
    pub id: String,
    pub primitive: Primitive,
    /// Pose of the primitive center relative to `frame_id`.
    pub pose: Pose,
    /// Frame the pose is expressed in. `None` means the root frame.
    pub frame_id: Option<String>,
}

impl StaticObstacle {
    /// Creates a new obstacle whose pose is expressed in the root frame.
    pub fn new<S: Into<String>>(id: S, primitive: Primitive, pose: Pose) -> Self {
        StaticObstacle {
            id: id.into(),
            primitive,
            pose,
            frame_id: None,
        }
    }

    /// Expresses the pose relative to another frame.
    ///
    /// The frame can be a robot critical point (a bounding ball of the
    /// [`SelfCollisionModel`](`crate::collision::self_collision::SelfCollisionModel`)) or any
    /// frame known to the [`TransformProvider`].
    pub fn relative_to<S: Into<String>>(mut self, frame_id: S) -> Self {
        self.frame_id = Some(frame_id.into());
        self
    }
}

#[derive(Debug, Clone)]
struct RegisteredObstacle {
    obstacle: StaticObstacle,
    marker_id: u32,
    /// Pose relative to the root frame, `None` until the reference frame could be resolved.
    root_pose: Option<Pose>,
}

impl RegisteredObstacle {
    fn marker(&self, root_frame: &str, action: MarkerAction) -> Marker {
        Marker {
            namespace: STATIC_COLLISION_NAMESPACE.to_string(),
            id: self.marker_id,
            frame_id: self
                .obstacle
                .frame_id
                .clone()
                .unwrap_or_else(|| root_frame.to_string()),
            shape: self.obstacle.primitive.marker_shape(),
            action,
            pose: self.obstacle.pose,
            scale: self.obstacle.primitive.marker_scale(),
        }
    }
}

#[derive(Debug, Default)]
struct ObstacleRegistry {
    obstacles: BTreeMap<String, RegisteredObstacle>,
    next_marker_id: u32,
}

/// Synchronous request/response access to the obstacle registry.
///
/// The handle is cheap to clone and can be used from any thread. Every mutation is applied
/// under a lock which the control loop also holds while it computes the static collision
/// cost, so a mutation always takes effect between two ticks.
#[derive(Clone)]
pub struct ObstacleRegistryHandle {
    registry: Arc<Mutex<ObstacleRegistry>>,
    transforms: Arc<dyn TransformProvider>,
    telemetry: Arc<dyn Telemetry>,
    root_frame: String,
    publish_markers: bool,
}

impl ObstacleRegistryHandle {
    /// Adds a new obstacle to the registry.
    ///
    /// Broadcasts a static frame named like the obstacle for its center and publishes a marker.
    /// # Errors
    /// * ObstacleRegistryError if the id is empty or already registered, or a dimension of the
    /// primitive is not positive.
    pub fn add_obstacle(&self, obstacle: StaticObstacle) -> ControlResult<()> {
        if obstacle.id.is_empty() {
            return Err(create_registry_error("obstacle id must not be empty"));
        }
        if !obstacle.primitive.has_valid_dimensions() {
            return Err(create_registry_error(format!(
                "obstacle {} has non-positive dimensions {:?}",
                obstacle.id,
                obstacle.primitive.dimensions()
            )));
        }
        if !obstacle.pose.translation.vector.iter().all(|x| x.is_finite()) {
            return Err(create_registry_error(format!(
                "obstacle {} has a non-finite pose",
                obstacle.id
            )));
        }
        let registered = {
            let mut registry = self.registry.lock();
            if registry.obstacles.contains_key(&obstacle.id) {
                return Err(create_registry_error(format!(
                    "obstacle {} already exists",
                    obstacle.id
                )));
            }
            let root_pose = match &obstacle.frame_id {
                None => Some(obstacle.pose),
                Some(frame) if *frame == self.root_frame => Some(obstacle.pose),
                Some(_) => None,
            };
            let registered = RegisteredObstacle {
                obstacle,
                marker_id: registry.next_marker_id,
                root_pose,
            };
            registry.next_marker_id += 1;
            registry
                .obstacles
                .insert(registered.obstacle.id.clone(), registered.clone());
            registered
        };
        let parent = registered
            .obstacle
            .frame_id
            .as_deref()
            .unwrap_or(&self.root_frame);
        self.transforms
            .broadcast_static(&registered.obstacle.id, parent, &registered.obstacle.pose);
        if self.publish_markers {
            self.telemetry
                .publish_markers(&[registered.marker(&self.root_frame, MarkerAction::Add)]);
        }
        info!(
            "added static obstacle {} relative to {}",
            registered.obstacle.id, parent
        );
        Ok(())
    }

    /// Removes the obstacle with the given id.
    ///
    /// # Errors
    /// * ObstacleRegistryError if no obstacle with this id exists.
    pub fn remove_obstacle(&self, id: &str) -> ControlResult<()> {
        let removed = self.registry.lock().obstacles.remove(id);
        match removed {
            Some(removed) => {
                if self.publish_markers {
                    self.telemetry.publish_markers(&[
                        removed.marker(&self.root_frame, MarkerAction::Delete)
                    ]);
                }
                info!("removed static obstacle {}", id);
                Ok(())
            }
            None => Err(create_registry_error(format!(
                "obstacle {} does not exist",
                id
            ))),
        }
    }

    /// Removes all obstacles. Always succeeds.
    pub fn remove_all_obstacles(&self) {
        let removed: Vec<RegisteredObstacle> = {
            let mut registry = self.registry.lock();
            let obstacles = std::mem::take(&mut registry.obstacles);
            obstacles.into_iter().map(|(_, obstacle)| obstacle).collect()
        };
        if self.publish_markers && !removed.is_empty() {
            let markers: Vec<Marker> = removed
                .iter()
                .map(|obstacle| obstacle.marker(&self.root_frame, MarkerAction::Delete))
                .collect();
            self.telemetry.publish_markers(&markers);
        }
        info!("removed all {} static obstacles", removed.len());
    }

    /// Number of registered obstacles.
    pub fn len(&self) -> usize {
        self.registry.lock().obstacles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.lock().obstacles.contains_key(id)
    }

    /// Returns a copy of the obstacle with the given id.
    pub fn get(&self, id: &str) -> Option<StaticObstacle> {
        self.registry
            .lock()
            .obstacles
            .get(id)
            .map(|registered| registered.obstacle.clone())
    }
}

/// Maintains the static obstacles and computes the cost between robot critical points and
/// obstacles.
pub struct StaticCollisionModel {
    config: Arc<ControllerConfiguration>,
    handle: ObstacleRegistryHandle,
    collision_matrix: CollisionMatrix,
    bounding_radii: BTreeMap<String, f64>,
    /// Reference frame of every obstacle which is not expressed in the root frame.
    reference_frames: BTreeMap<String, String>,
    collision_cost_vector: CollisionCostVector,
}

impl StaticCollisionModel {
    /// Creates a model with an empty registry.
    pub fn new(
        config: Arc<ControllerConfiguration>,
        transforms: Arc<dyn TransformProvider>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let handle = ObstacleRegistryHandle {
            registry: Arc::new(Mutex::new(ObstacleRegistry::default())),
            transforms,
            telemetry,
            root_frame: config.root_frame.clone(),
            publish_markers: config.publish_markers,
        };
        StaticCollisionModel {
            config,
            handle,
            collision_matrix: CollisionMatrix::new(),
            bounding_radii: BTreeMap::new(),
            reference_frames: BTreeMap::new(),
            collision_cost_vector: CollisionCostVector::zeros(0),
        }
    }

    /// Returns a handle to the obstacle registry which can be handed to other threads.
    pub fn registry(&self) -> ObstacleRegistryHandle {
        self.handle.clone()
    }

    /// See [`ObstacleRegistryHandle::add_obstacle`].
    pub fn add_obstacle(&self, obstacle: StaticObstacle) -> ControlResult<()> {
        self.handle.add_obstacle(obstacle)
    }

    /// See [`ObstacleRegistryHandle::remove_obstacle`].
    pub fn remove_obstacle(&self, id: &str) -> ControlResult<()> {
        self.handle.remove_obstacle(id)
    }

    /// See [`ObstacleRegistryHandle::remove_all_obstacles`].
    pub fn remove_all_obstacles(&self) {
        self.handle.remove_all_obstacles()
    }

    /// Pose of every resolved obstacle center relative to the root frame, as of the last update.
    pub fn collision_matrix(&self) -> &CollisionMatrix {
        &self.collision_matrix
    }

    /// Cost of every (robot critical point, obstacle) pair of the last update.
    pub fn collision_cost_vector(&self) -> &CollisionCostVector {
        &self.collision_cost_vector
    }

    /// Fills the collision matrix from the registry without any robot critical points.
    pub fn generate_static_collision_volume(&mut self) {
        self.update_static_collision_volume(&CollisionMatrix::new());
    }

    /// Refreshes the pose of every obstacle relative to the root frame.
    ///
    /// Obstacles expressed in the root frame do not move. Obstacles expressed relative to a
    /// robot critical point follow that point. Any other reference frame is looked up with the
    /// [`TransformProvider`]; if that fails the last known pose is kept.
    /// # Arguments
    /// * `robot_critical_points` - Pose of every robot bounding ball relative to the root frame.
    pub fn update_static_collision_volume(&mut self, robot_critical_points: &CollisionMatrix) {
        let registry = self.handle.registry.clone();
        let mut registry = registry.lock();
        self.refresh(&mut registry, robot_critical_points);
    }

    fn refresh(&mut self, registry: &mut ObstacleRegistry, robot_critical_points: &CollisionMatrix) {
        for registered in registry.obstacles.values_mut() {
            let frame = match &registered.obstacle.frame_id {
                Some(frame) if *frame != self.config.root_frame => frame,
                _ => continue,
            };
            if let Some(point) = robot_critical_points.get(frame) {
                registered.root_pose = Some(point * registered.obstacle.pose);
                continue;
            }
            match self.handle.transforms.lookup(&self.config.root_frame, frame) {
                Ok(frame_pose) => registered.root_pose = Some(frame_pose * registered.obstacle.pose),
                Err(error) => warn!(
                    "keeping last pose of obstacle {}: {}",
                    registered.obstacle.id, error
                ),
            }
        }
        self.collision_matrix.clear();
        self.bounding_radii.clear();
        self.reference_frames.clear();
        for (id, registered) in registry.obstacles.iter() {
            if let Some(pose) = registered.root_pose {
                self.collision_matrix.insert(id.clone(), pose);
                self.bounding_radii
                    .insert(id.clone(), registered.obstacle.primitive.bounding_radius());
                if let Some(frame) = &registered.obstacle.frame_id {
                    self.reference_frames.insert(id.clone(), frame.clone());
                }
            }
        }
    }

    /// Computes the cost of every (robot critical point, obstacle) pair.
    ///
    /// The distance of a pair is the distance from the robot point to the surface of the
    /// obstacle's bounding ball, floored at zero. Obstacles which are not part of the last
    /// update are treated as points. An obstacle expressed relative to a robot critical point
    /// moves with it, so that pair has zero cost.
    /// # Arguments
    /// * `static_collision_matrix` - Pose of every obstacle relative to the root frame.
    /// * `robot_collision_matrix` - Pose of every robot critical point relative to the root frame.
    /// * `threshold_distance` - Distance at which the cost starts to rise steeply.
    /// * `weight_factor` - Convergence rate of the cost.
    /// # Return
    /// Costs ordered by robot point, then by obstacle, both in id order.
    pub fn compute_static_collision_cost(
        &self,
        static_collision_matrix: &CollisionMatrix,
        robot_collision_matrix: &CollisionMatrix,
        threshold_distance: f64,
        weight_factor: f64,
    ) -> CollisionCostVector {
        let mut costs =
            Vec::with_capacity(static_collision_matrix.len() * robot_collision_matrix.len());
        for (point_id, point) in robot_collision_matrix.iter() {
            for (obstacle_id, obstacle) in static_collision_matrix.iter() {
                if self.reference_frames.get(obstacle_id) == Some(point_id) {
                    costs.push(0.);
                    continue;
                }
                let radius = self.bounding_radii.get(obstacle_id).copied().unwrap_or(0.);
                let distance = f64::max(get_euclidean_distance(point, obstacle) - radius, 0.);
                if distance < threshold_distance {
                    debug!(
                        "{} is {:.3} m away from obstacle {}",
                        point_id, distance, obstacle_id
                    );
                }
                costs.push(logistic_cost(distance, threshold_distance, weight_factor));
            }
        }
        CollisionCostVector::from_vec(costs)
    }

    /// Sums the pair costs of [`compute_static_collision_cost`](`Self::compute_static_collision_cost`)
    /// per robot critical point.
    ///
    /// # Return
    /// One entry per robot point, in id order. The length does not depend on the number of
    /// obstacles.
    pub fn aggregate_per_point(
        pair_costs: &CollisionCostVector,
        robot_points: usize,
    ) -> CollisionCostVector {
        let mut aggregated = CollisionCostVector::zeros(robot_points);
        if robot_points == 0 {
            return aggregated;
        }
        let obstacles = pair_costs.len() / robot_points;
        for point in 0..robot_points {
            aggregated[point] = pair_costs
                .rows(point * obstacles, obstacles)
                .iter()
                .sum::<f64>();
        }
        aggregated
    }

    /// Refreshes the obstacles and computes their cost against the given robot critical points
    /// with the configured parameters, all under the registry lock.
    ///
    /// # Return
    /// The aggregated cost per robot point, see [`aggregate_per_point`](`Self::aggregate_per_point`).
    pub fn update_cost(&mut self, robot_critical_points: &CollisionMatrix) -> CollisionCostVector {
        let registry = self.handle.registry.clone();
        let mut registry = registry.lock();
        self.refresh(&mut registry, robot_critical_points);
        let parameters = &self.config.static_collision;
        self.collision_cost_vector = self.compute_static_collision_cost(
            &self.collision_matrix,
            robot_critical_points,
            parameters.threshold_distance,
            parameters.weight_factor,
        );
        Self::aggregate_per_point(&self.collision_cost_vector, robot_critical_points.len())
    }
}
