// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the command type published by the controller.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::JointVector;

/// Stores values for joint velocity commands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JointVelocities {
    /// Desired joint velocities in \[rad/s\].
    pub dq: Vec<f64>,
}

impl From<JointVector> for JointVelocities {
    fn from(vector: JointVector) -> Self {
        JointVelocities::new(vector.as_slice().to_vec())
    }
}

impl JointVelocities {
    /// Creates a new JointVelocities instance.
    /// # Arguments
    /// * `joint_velocities` - Desired joint velocities in \[rad/s\].
    pub fn new(joint_velocities: Vec<f64>) -> Self {
        JointVelocities {
            dq: joint_velocities,
        }
    }

    /// Creates a command which stops every joint.
    pub fn zeros(degree_of_freedom: usize) -> Self {
        JointVelocities::new(vec![0.; degree_of_freedom])
    }

    /// Returns true if every joint velocity is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.dq.iter().all(|&x| x == 0.)
    }

    pub fn len(&self) -> usize {
        self.dq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dq.is_empty()
    }

    pub fn as_vector(&self) -> JointVector {
        JointVector::from_column_slice(&self.dq)
    }
}

impl fmt::Display for JointVelocities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, x) in self.dq.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:.4}", x)?;
        }
        write!(f, "]")
    }
}
