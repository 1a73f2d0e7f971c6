// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the joint state type and the latest-wins handoff between the producer of joint
//! states and the control loop.
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::exception::{create_malformed_input, ControlResult};
use crate::utils::{all_finite, JointVector};

/// Measured state of all joints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JointState {
    /// Measured joint positions in \[rad\].
    pub position: JointVector,
    /// Measured joint velocities in \[rad/s\].
    pub velocity: JointVector,
}

impl JointState {
    pub fn new(position: JointVector, velocity: JointVector) -> Self {
        JointState { position, velocity }
    }

    /// Creates a joint state at rest with the given positions.
    pub fn at_rest(position: JointVector) -> Self {
        let velocity = JointVector::zeros(position.len());
        JointState::new(position, velocity)
    }

    pub fn degree_of_freedom(&self) -> usize {
        self.position.len()
    }

    /// Checks that the state has the expected length and only finite values.
    ///
    /// # Errors
    /// * MalformedInput otherwise.
    pub fn validate(&self, degree_of_freedom: usize) -> ControlResult<()> {
        if self.position.len() != degree_of_freedom || self.velocity.len() != degree_of_freedom {
            return Err(create_malformed_input(format!(
                "joint state has {} positions and {} velocities, expected {}",
                self.position.len(),
                self.velocity.len(),
                degree_of_freedom
            )));
        }
        if !all_finite(&self.position) || !all_finite(&self.velocity) {
            return Err(create_malformed_input("joint state contains non-finite values"));
        }
        Ok(())
    }
}

/// A joint state together with the time it was received.
#[derive(Debug, Clone)]
pub struct StampedJointState {
    pub state: JointState,
    pub received: Instant,
}

impl StampedJointState {
    /// Returns the age of the sample at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received)
    }
}

/// Single-writer latest-wins slot for joint states.
///
/// Writing never blocks and never drives any computation. The control loop reads the newest
/// sample once per tick. The handle is cheap to clone.
#[derive(Clone)]
pub struct JointStateFeed {
    latest: Arc<ArcSwapOption<StampedJointState>>,
    degree_of_freedom: usize,
}

impl JointStateFeed {
    pub fn new(degree_of_freedom: usize) -> Self {
        JointStateFeed {
            latest: Arc::new(ArcSwapOption::empty()),
            degree_of_freedom,
        }
    }

    /// Validates the joint state and makes it the newest sample.
    ///
    /// # Errors
    /// * MalformedInput if the state has the wrong length or non-finite values. The previous
    /// sample is kept in that case.
    pub fn publish(&self, state: JointState) -> ControlResult<()> {
        self.publish_at(state, Instant::now())
    }

    /// Like [`publish`](`Self::publish`) with an explicit receive time.
    pub fn publish_at(&self, state: JointState, received: Instant) -> ControlResult<()> {
        state.validate(self.degree_of_freedom)?;
        self.latest
            .store(Some(Arc::new(StampedJointState { state, received })));
        Ok(())
    }

    /// Returns the newest sample, if any arrived yet.
    pub fn latest(&self) -> Option<Arc<StampedJointState>> {
        self.latest.load_full()
    }

    /// Returns the newest sample if it is not older than `timeout` at `now`.
    pub fn fresh(&self, timeout: Duration, now: Instant) -> Option<Arc<StampedJointState>> {
        self.latest().filter(|sample| sample.age(now) <= timeout)
    }

    pub fn degree_of_freedom(&self) -> usize {
        self.degree_of_freedom
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::exception::ControlException;
    use crate::supervisor::joint_state::{JointState, JointStateFeed};
    use crate::utils::JointVector;

    fn state(values: &[f64]) -> JointState {
        JointState::at_rest(JointVector::from_row_slice(values))
    }

    #[test]
    fn latest_sample_wins() {
        let feed = JointStateFeed::new(2);
        assert!(feed.latest().is_none());
        feed.publish(state(&[0.1, 0.2])).unwrap();
        feed.publish(state(&[0.3, 0.4])).unwrap();
        let latest = feed.latest().unwrap();
        assert_eq!(latest.state.position[0], 0.3);
    }

    #[test]
    fn malformed_states_are_rejected() {
        let feed = JointStateFeed::new(2);
        feed.publish(state(&[0.1, 0.2])).unwrap();
        assert!(matches!(
            feed.publish(state(&[0.1, 0.2, 0.3])),
            Err(ControlException::MalformedInput { .. })
        ));
        assert!(feed.publish(state(&[0.1, f64::NAN])).is_err());
        let bad_velocity = JointState::new(
            JointVector::from_row_slice(&[0., 0.]),
            JointVector::from_row_slice(&[f64::INFINITY, 0.]),
        );
        assert!(feed.publish(bad_velocity).is_err());
        assert_eq!(feed.latest().unwrap().state.position[1], 0.2);
    }

    #[test]
    fn stale_samples_are_not_fresh() {
        let feed = JointStateFeed::new(1);
        let start = Instant::now();
        feed.publish_at(state(&[0.]), start).unwrap();
        let timeout = Duration::from_millis(500);
        assert!(feed.fresh(timeout, start + Duration::from_millis(100)).is_some());
        assert!(feed.fresh(timeout, start + Duration::from_millis(600)).is_none());
    }

    #[test]
    fn clones_share_the_slot() {
        let feed = JointStateFeed::new(1);
        let writer = feed.clone();
        std::thread::spawn(move || writer.publish(state(&[1.5])).unwrap())
            .join()
            .unwrap();
        assert_eq!(feed.latest().unwrap().state.position[0], 1.5);
    }
}
