// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! contains useful type definitions and conversion functions.
use nalgebra::{DVector, Isometry3, Matrix4, Rotation3, Translation3, Vector3, Vector6};

/// Position and orientation of a frame relative to its parent frame.
pub type Pose = Isometry3<f64>;

/// A dynamically sized vector with one entry per degree of freedom.
pub type JointVector = DVector<f64>;

/// Threshold used to decide whether a matrix is a valid homogeneous transformation.
const ORTHONORMAL_THRESHOLD: f64 = 1e-5;

/// converts a 4x4 homogeneous matrix to a [`Pose`]
///
/// The rotation part is re-orthonormalized, so small numerical errors in the matrix do not
/// propagate into the orientation.
pub fn homogeneous_to_pose(matrix: &Matrix4<f64>) -> Pose {
    let rotation = Rotation3::from_matrix(&matrix.fixed_view::<3, 3>(0, 0).into_owned());
    Isometry3::from_parts(
        Translation3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]),
        rotation.into(),
    )
}

/// Determines whether the given matrix represents a valid homogeneous transformation.
#[allow(clippy::float_cmp)]
pub fn is_homogeneous_transformation(transform: &Matrix4<f64>) -> bool {
    if transform[(3, 0)] != 0.0
        || transform[(3, 1)] != 0.0
        || transform[(3, 2)] != 0.0
        || transform[(3, 3)] != 1.0
    {
        return false;
    }
    if !transform.iter().all(|x| x.is_finite()) {
        return false;
    }
    let rotation = transform.fixed_view::<3, 3>(0, 0);
    for j in 0..3 {
        if f64::abs(rotation.column(j).norm() - 1.) > ORTHONORMAL_THRESHOLD
            || f64::abs(rotation.row(j).norm() - 1.) > ORTHONORMAL_THRESHOLD
        {
            return false;
        }
    }
    true
}

/// Computes the Euclidean distance between the positions of two poses.
///
/// The orientation is ignored. The function is pure and symmetric.
pub fn get_euclidean_distance(pose_a: &Pose, pose_b: &Pose) -> f64 {
    (pose_a.translation.vector - pose_b.translation.vector).norm()
}

/// Computes the Cartesian error between the current and the goal pose.
///
/// # Return
/// Vector with the translational error (goal - current) in the first three entries and the
/// rotational error as scaled axis of `goal * current⁻¹` in the last three entries. Both are
/// expressed in the common parent frame.
pub fn cartesian_error(current: &Pose, goal: &Pose) -> Vector6<f64> {
    let translation: Vector3<f64> = goal.translation.vector - current.translation.vector;
    let rotation = (goal.rotation * current.rotation.inverse()).scaled_axis();
    Vector6::new(
        translation.x,
        translation.y,
        translation.z,
        rotation.x,
        rotation.y,
        rotation.z,
    )
}

/// Returns true if all entries are finite.
pub fn all_finite(values: &JointVector) -> bool {
    values.iter().all(|x| x.is_finite())
}
