// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains exception and Result definitions
use crate::interfaces::TransformError;
use thiserror::Error;

/// Represents all kind of errors which can occur while setting up or running the reactive
/// controller.
///
/// Per-tick faults never stop the control loop. They are reported through the goal
/// feedback/result channel and the loop resumes at the next tick. Only errors returned
/// during initialization are fatal.
#[derive(Error, Debug)]
pub enum ControlException {
    /// TransformUnavailable is returned if the transform between two frames could not be
    /// looked up. It is transient and retried in the next tick.
    #[error("transform from {from:?} to {to:?} unavailable: {source}")]
    TransformUnavailable {
        /// Source frame of the lookup.
        from: String,
        /// Target frame of the lookup.
        to: String,
        /// Reason reported by the transform provider.
        source: TransformError,
    },

    /// LimitViolation is returned if a joint position or velocity is outside the configured
    /// limits and could not be recovered by clamping.
    #[error("{message:?}")]
    LimitViolation { message: String },

    /// ObstacleRegistryError is returned synchronously by the obstacle registry, e.g. when
    /// adding a duplicate id or removing an unknown one.
    #[error("{message:?}")]
    ObstacleRegistryError { message: String },

    /// TrajectoryInfeasible is returned if the trajectory generator could not produce a
    /// feasible velocity command.
    #[error("{message:?}")]
    TrajectoryInfeasible { message: String },

    /// MalformedInput is returned for input with a wrong dimension or non-finite values.
    #[error("{message:?}")]
    MalformedInput { message: String },

    /// KinematicsException is returned if forward kinematics could not be computed.
    #[error("{message:?}")]
    KinematicsException { message: String },

    /// ConfigurationException is returned if the controller configuration is inconsistent.
    #[error("{message:?}")]
    ConfigurationException { message: String },

    /// InitializationException is returned if a collaborator failed to initialize or the
    /// controller was used before it was initialized.
    #[error("{message:?}")]
    InitializationException { message: String },

    /// RealTimeException is returned if the real-time priority cannot be set
    #[error("{message:?}")]
    RealTimeException { message: String },
}

/// creates a MalformedInput exception from anything which can be turned into a String
pub(crate) fn create_malformed_input<S: Into<String>>(message: S) -> ControlException {
    ControlException::MalformedInput {
        message: message.into(),
    }
}

/// creates an ObstacleRegistryError from anything which can be turned into a String
pub(crate) fn create_registry_error<S: Into<String>>(message: S) -> ControlException {
    ControlException::ObstacleRegistryError {
        message: message.into(),
    }
}

/// creates a ConfigurationException from anything which can be turned into a String
pub(crate) fn create_configuration_exception<S: Into<String>>(message: S) -> ControlException {
    ControlException::ConfigurationException {
        message: message.into(),
    }
}

/// Result type which can have ControlException as Error
pub type ControlResult<T> = Result<T, ControlException>;
