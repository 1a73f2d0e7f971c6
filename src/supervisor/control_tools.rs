// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the functions to run the control loop thread with realtime priority.
use std::path::Path;

use tracing::info;

use crate::config::RealtimeConfig;
use crate::exception::{ControlException, ControlResult};

/// Determines whether the current OS kernel is a realtime kernel.
///
/// On Linux, this checks for the existence of `/sys/kernel/realtime`.
pub fn has_realtime_kernel() -> bool {
    Path::new("/sys/kernel/realtime").exists()
}

/// Sets the current thread to the highest possible scheduler priority.
///
/// # Errors
/// * RealTimeException if realtime priority cannot be set for the current thread.
///
/// If the method returns an Error please check your /etc/security/limits.conf file
/// There should be a line like this:
/// ```text
///marco            -       rtprio          99
/// ```
pub fn set_current_thread_to_highest_scheduler_priority() -> ControlResult<()> {
    unsafe {
        let max_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max_priority == -1 {
            return Err(ControlException::RealTimeException {
                message: "unable to get maximum possible thread priority".to_string(),
            });
        }
        let thread_param = libc::sched_param {
            // one below the maximum, so kernel threads at the maximum still preempt the loop
            sched_priority: max_priority - 1,
        };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &thread_param) != 0 {
            return Err(ControlException::RealTimeException {
                message: "unable to set realtime scheduling".to_string(),
            });
        }
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            return Err(ControlException::RealTimeException {
                message: "unable to lock memory".to_string(),
            });
        }
    }
    Ok(())
}

/// Applies the realtime configuration to the current thread.
///
/// # Errors
/// * RealTimeException if realtime mode is enforced but the kernel does not support it or
/// the priority cannot be set.
pub fn apply_realtime_config(config: RealtimeConfig) -> ControlResult<()> {
    match config {
        RealtimeConfig::Ignore => Ok(()),
        RealtimeConfig::Enforce => {
            if !has_realtime_kernel() {
                return Err(ControlException::RealTimeException {
                    message: "Running kernel does not have realtime capabilities.".to_string(),
                });
            }
            set_current_thread_to_highest_scheduler_priority()?;
            info!("control loop runs with realtime priority");
            Ok(())
        }
    }
}
