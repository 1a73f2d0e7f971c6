// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the runtime switches of the controller.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Switches which can be flipped from any thread while the control loop runs.
///
/// Changes take effect at the next tick.
#[derive(Debug, Clone)]
pub struct ControlSwitches {
    tracking: Arc<AtomicBool>,
    output_enabled: Arc<AtomicBool>,
}

impl ControlSwitches {
    pub fn new(tracking: bool, output_enabled: bool) -> Self {
        ControlSwitches {
            tracking: Arc::new(AtomicBool::new(tracking)),
            output_enabled: Arc::new(AtomicBool::new(output_enabled)),
        }
    }

    /// Enables or disables continuous tracking of the
    /// [`target_frame`](`crate::config::ControllerConfiguration::target_frame`).
    ///
    /// Tracking only drives the arm while no goal is active.
    pub fn set_tracking(&self, tracking: bool) {
        if self.tracking.swap(tracking, Ordering::AcqRel) != tracking {
            info!("tracking {}", if tracking { "enabled" } else { "disabled" });
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    /// Enables or disables the velocity output. While disabled, every command is still
    /// computed but a zero velocity is published instead.
    pub fn set_output_enabled(&self, enabled: bool) {
        if self.output_enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!("output {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Acquire)
    }
}
