// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the joint limits and the functions to check and enforce them.
use crate::config::ControllerConfiguration;
use crate::exception::{create_configuration_exception, ControlResult};
use crate::utils::JointVector;

/// Per-joint position and velocity limits. Immutable once the controller is initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Minimum joint positions in \[rad\].
    pub min_position: JointVector,
    /// Maximum joint positions in \[rad\].
    pub max_position: JointVector,
    /// Minimum joint velocities in \[rad/s\].
    pub min_velocity: JointVector,
    /// Maximum joint velocities in \[rad/s\].
    pub max_velocity: JointVector,
}

impl Limits {
    /// Creates new limits.
    ///
    /// # Errors
    /// * ConfigurationException if the vectors differ in length or a minimum is greater than
    /// its maximum.
    pub fn new(
        min_position: JointVector,
        max_position: JointVector,
        min_velocity: JointVector,
        max_velocity: JointVector,
    ) -> ControlResult<Self> {
        let dof = min_position.len();
        if max_position.len() != dof || min_velocity.len() != dof || max_velocity.len() != dof {
            return Err(create_configuration_exception(
                "all joint limits must have the same length",
            ));
        }
        for i in 0..dof {
            if min_position[i] > max_position[i] || min_velocity[i] > max_velocity[i] {
                return Err(create_configuration_exception(format!(
                    "minimum limit of joint {} is greater than its maximum",
                    i
                )));
            }
        }
        Ok(Limits {
            min_position,
            max_position,
            min_velocity,
            max_velocity,
        })
    }

    /// Creates the limits stored in the configuration.
    pub fn from_configuration(config: &ControllerConfiguration) -> ControlResult<Self> {
        Limits::new(
            JointVector::from_column_slice(&config.min_position_limit),
            JointVector::from_column_slice(&config.max_position_limit),
            JointVector::from_column_slice(&config.min_velocity_limit),
            JointVector::from_column_slice(&config.max_velocity_limit),
        )
    }

    pub fn degree_of_freedom(&self) -> usize {
        self.min_position.len()
    }

    /// Determines whether any joint position is outside of the limits.
    ///
    /// # Arguments
    /// * `position` - Joint positions in \[rad\].
    /// * `tolerance` - Every limit is widened by this value.
    /// # Return
    /// True if any joint is outside of \[min - tolerance, max + tolerance\] or the vector has
    /// the wrong length.
    pub fn check_position_limit_violation(&self, position: &JointVector, tolerance: f64) -> bool {
        check_violation(position, &self.min_position, &self.max_position, tolerance)
    }

    /// Determines whether any joint velocity is outside of the limits.
    ///
    /// See [`check_position_limit_violation`](`Self::check_position_limit_violation`).
    pub fn check_velocity_limit_violation(&self, velocity: &JointVector, tolerance: f64) -> bool {
        check_violation(velocity, &self.min_velocity, &self.max_velocity, tolerance)
    }

    /// Clamps every joint position into its limits.
    ///
    /// Positions which are already within the limits are returned unchanged.
    /// # Panics
    /// * if the vector does not have one entry per joint.
    pub fn enforce_position_in_limits(&self, position: &JointVector) -> JointVector {
        position.sup(&self.min_position).inf(&self.max_position)
    }

    /// Clamps every joint velocity into its limits.
    ///
    /// Velocities which are already within the limits are returned unchanged.
    /// # Panics
    /// * if the vector does not have one entry per joint.
    pub fn enforce_velocity_in_limits(&self, velocity: &JointVector) -> JointVector {
        velocity.sup(&self.min_velocity).inf(&self.max_velocity)
    }

    /// Limits a velocity command such that the position reached after `delta_t` stays within
    /// the position limits and the velocity itself within the velocity limits.
    ///
    /// # Arguments
    /// * `position` - Current joint positions in \[rad\].
    /// * `velocity` - Commanded joint velocities in \[rad/s\].
    /// * `delta_t` - Time until the next command in \[s\]. Must be positive.
    /// # Return
    /// The clamped velocity. Joints whose predicted position stays within the limits keep
    /// their clamped velocity exactly.
    /// # Panics
    /// * if a vector does not have one entry per joint.
    pub fn limit_velocity(
        &self,
        position: &JointVector,
        velocity: &JointVector,
        delta_t: f64,
    ) -> JointVector {
        let mut limited = self.enforce_velocity_in_limits(velocity);
        for i in 0..limited.len() {
            let predicted = position[i] + limited[i] * delta_t;
            if predicted > self.max_position[i] {
                limited[i] = (self.max_position[i] - position[i]) / delta_t;
            } else if predicted < self.min_position[i] {
                limited[i] = (self.min_position[i] - position[i]) / delta_t;
            }
        }
        self.enforce_velocity_in_limits(&limited)
    }
}

fn check_violation(
    values: &JointVector,
    min: &JointVector,
    max: &JointVector,
    tolerance: f64,
) -> bool {
    if values.len() != min.len() {
        return true;
    }
    values
        .iter()
        .zip(min.iter().zip(max.iter()))
        .any(|(value, (min, max))| !(*value >= min - tolerance && *value <= max + tolerance))
}

#[cfg(test)]
mod tests {
    use crate::supervisor::limits::Limits;
    use crate::utils::JointVector;

    fn limits(dof: usize) -> Limits {
        Limits::new(
            JointVector::from_element(dof, -1.5),
            JointVector::from_element(dof, 2.),
            JointVector::from_element(dof, -1.),
            JointVector::from_element(dof, 1.),
        )
        .unwrap()
    }

    fn vector(values: &[f64]) -> JointVector {
        JointVector::from_row_slice(values)
    }

    #[test]
    fn velocity_is_clamped_per_axis() {
        let limits = limits(6);
        let enforced = limits.enforce_velocity_in_limits(&vector(&[2., -2., 0., 0., 0., 0.]));
        assert_eq!(enforced, vector(&[1., -1., 0., 0., 0., 0.]));
    }

    #[test]
    fn feasible_values_are_unchanged() {
        let limits = limits(3);
        let position = vector(&[-1.5, 0.3, 2.]);
        assert_eq!(limits.enforce_position_in_limits(&position), position);
        let velocity = vector(&[0.99, -1., 0.]);
        assert_eq!(limits.enforce_velocity_in_limits(&velocity), velocity);
    }

    #[test]
    fn enforced_position_is_always_within_limits() {
        let limits = limits(2);
        for i in -40..40 {
            for j in -40..40 {
                let position = vector(&[i as f64 * 0.1, j as f64 * 0.13]);
                let enforced = limits.enforce_position_in_limits(&position);
                assert!(!limits.check_position_limit_violation(&enforced, 0.));
            }
        }
    }

    #[test]
    fn violation_respects_tolerance() {
        let limits = limits(2);
        assert!(!limits.check_position_limit_violation(&vector(&[-1.5, 2.]), 0.));
        assert!(limits.check_position_limit_violation(&vector(&[-1.55, 0.]), 0.));
        assert!(!limits.check_position_limit_violation(&vector(&[-1.55, 0.]), 0.1));
        assert!(limits.check_position_limit_violation(&vector(&[0., f64::NAN]), 0.1));
        assert!(limits.check_position_limit_violation(&vector(&[0.]), 0.1));
        assert!(limits.check_velocity_limit_violation(&vector(&[1.2, 0.]), 0.1));
        assert!(!limits.check_velocity_limit_violation(&vector(&[1.05, 0.]), 0.1));
    }

    #[test]
    fn velocity_does_not_leave_position_limits() {
        let limits = limits(2);
        let position = vector(&[1.99, 0.]);
        let limited = limits.limit_velocity(&position, &vector(&[1., 3.]), 0.02);
        assert!((limited[0] - 0.5).abs() < 1e-9);
        assert_eq!(limited[1], 1.);
        let predicted = position + limited * 0.02;
        assert!(!limits.check_position_limit_violation(&predicted, 1e-12));
    }

    #[test]
    fn inconsistent_limits_are_rejected() {
        assert!(Limits::new(
            vector(&[0., 1.]),
            vector(&[1., 0.]),
            vector(&[-1., -1.]),
            vector(&[1., 1.])
        )
        .is_err());
        assert!(Limits::new(
            vector(&[0.]),
            vector(&[1., 0.]),
            vector(&[-1., -1.]),
            vector(&[1., 1.])
        )
        .is_err());
    }
}
