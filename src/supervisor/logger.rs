// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the diagnostic log which is attached to the result of an aborted goal.
use std::collections::VecDeque;

use nalgebra::Vector6;

use crate::supervisor::control_types::JointVelocities;
use crate::supervisor::joint_state::JointState;

/// One row of the log contains the joint state of tick n, the Cartesian error computed from
/// it and the command published in tick n.
/// Provided by [`GoalResult`](`crate::supervisor::goal::GoalResult`).
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Joint state the command was computed for.
    pub state: JointState,
    /// Published command, after limit enforcement.
    pub command: JointVelocities,
    /// Cartesian error between the tracking frame and the goal.
    pub cartesian_error: Vector6<f64>,
}

impl Record {
    /// creates a string representation based on the debug formatter
    pub fn log(&self) -> String {
        format!("{:?}", self)
    }
}

pub(crate) struct Logger {
    records: VecDeque<Record>,
    log_size: usize,
}

impl Logger {
    pub fn new(log_size: usize) -> Self {
        Logger {
            records: VecDeque::with_capacity(log_size),
            log_size,
        }
    }

    pub fn log(&mut self, state: &JointState, command: &JointVelocities, error: &Vector6<f64>) {
        if self.log_size == 0 {
            return;
        }
        if self.records.len() == self.log_size {
            self.records.pop_front();
        }
        self.records.push_back(Record {
            state: state.clone(),
            command: command.clone(),
            cartesian_error: *error,
        });
    }

    /// Returns all records, oldest first, and empties the log.
    pub fn flush(&mut self) -> Vec<Record> {
        self.records.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
