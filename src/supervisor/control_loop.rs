// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the fixed period timer thread which drives [`ControlSupervisor::tick`].
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spin_sleep::{SpinSleeper, SpinStrategy};
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::exception::{ControlException, ControlResult};
use crate::supervisor::control_tools::apply_realtime_config;
use crate::supervisor::ControlSupervisor;

/// Accuracy of the spin sleeper in \[ns\].
static SPIN_SLEEP_ACCURACY_NS: u32 = 100_000;

/// Counters of a running control loop.
#[derive(Debug, Default)]
pub struct LoopStatistics {
    ticks: AtomicU64,
    overruns: AtomicU64,
}

impl LoopStatistics {
    /// Number of ticks executed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Number of ticks which took longer than one period.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Runs [`ControlSupervisor::tick`] on its own thread once per configured period.
///
/// Dropping the loop stops the thread; use [`shutdown`](`Self::shutdown`) to get the
/// supervisor back.
pub struct ControlLoop {
    handle: Option<JoinHandle<ControlSupervisor>>,
    running: Arc<AtomicBool>,
    statistics: Arc<LoopStatistics>,
}

impl ControlLoop {
    /// Moves the supervisor onto a new thread and starts ticking.
    ///
    /// The realtime configuration is applied to the new thread before the first tick.
    /// # Errors
    /// * RealTimeException if realtime mode is enforced but cannot be set.
    /// * InitializationException if the supervisor is not initialized or the thread cannot
    /// be spawned.
    pub fn spawn(supervisor: ControlSupervisor) -> ControlResult<Self> {
        if !supervisor.is_initialized() {
            return Err(ControlException::InitializationException {
                message: "control loop started with an uninitialized controller".to_string(),
            });
        }
        let period = supervisor.config().period();
        let realtime_config = supervisor.config().realtime_config;
        let running = Arc::new(AtomicBool::new(true));
        let statistics = Arc::new(LoopStatistics::default());
        let (startup_sender, startup_receiver) = crossbeam_channel::bounded(1);

        let thread_running = running.clone();
        let thread_statistics = statistics.clone();
        let handle = thread::Builder::new()
            .name("control_loop".to_string())
            .spawn(move || {
                let mut supervisor = supervisor;
                let startup = apply_realtime_config(realtime_config);
                let started = startup.is_ok();
                // the receiver waits for exactly this message
                let _ = startup_sender.send(startup);
                if started {
                    run(
                        &mut supervisor,
                        period,
                        realtime_config,
                        &thread_running,
                        &thread_statistics,
                    );
                }
                supervisor
            })
            .map_err(|error| ControlException::InitializationException {
                message: format!("unable to spawn control loop thread: {}", error),
            })?;

        match startup_receiver.recv() {
            Ok(Ok(())) => {
                info!("control loop started with a period of {:?}", period);
                Ok(ControlLoop {
                    handle: Some(handle),
                    running,
                    statistics,
                })
            }
            Ok(Err(error)) => {
                let _ = handle.join();
                Err(error)
            }
            Err(_) => Err(ControlException::InitializationException {
                message: "control loop thread terminated during startup".to_string(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> &LoopStatistics {
        &self.statistics
    }

    /// Stops the loop after the current tick and returns the supervisor.
    ///
    /// A zero velocity is published and the active goal is preempted before the thread exits.
    /// # Errors
    /// * InitializationException if the loop thread panicked.
    pub fn shutdown(mut self) -> ControlResult<ControlSupervisor> {
        self.stop().ok_or_else(|| ControlException::InitializationException {
            message: "control loop thread panicked".to_string(),
        })
    }

    fn stop(&mut self) -> Option<ControlSupervisor> {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(supervisor) => {
                info!(
                    "control loop stopped after {} ticks ({} overruns)",
                    self.statistics.ticks(),
                    self.statistics.overruns()
                );
                Some(supervisor)
            }
            Err(_) => None,
        }
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    supervisor: &mut ControlSupervisor,
    period: Duration,
    realtime_config: RealtimeConfig,
    running: &AtomicBool,
    statistics: &LoopStatistics,
) {
    let strategy = match realtime_config {
        RealtimeConfig::Enforce => SpinStrategy::SpinLoopHint,
        RealtimeConfig::Ignore => SpinStrategy::YieldThread,
    };
    let sleeper = SpinSleeper::new(SPIN_SLEEP_ACCURACY_NS).with_spin_strategy(strategy);
    let mut next_release = Instant::now();
    while running.load(Ordering::Acquire) {
        let start = Instant::now();
        let outcome = supervisor.tick();
        let elapsed = start.elapsed();
        statistics.ticks.fetch_add(1, Ordering::Relaxed);
        if elapsed > period {
            statistics.overruns.fetch_add(1, Ordering::Relaxed);
            warn!("tick took {:?}, longer than the period of {:?}", elapsed, period);
        }
        debug!("tick finished: {:?}", outcome);

        next_release += period;
        let now = Instant::now();
        if now < next_release {
            sleeper.sleep(next_release - now);
        } else {
            next_release = now;
        }
    }
    supervisor.halt();
}
