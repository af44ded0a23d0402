//! Re-runs a sandbox execution until it stops faulting on unmapped memory.

use slog::{Logger, debug, error, warn};

use crate::guard::{Outcome, signal_name};
use crate::lazy_map::map_fault;
use crate::region::{RegionTracker, Tracked};

/// Why the retry loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The execution ran to its trampoline without faulting.
    Completed,
    UnrecoverableFault { signal: i32, addr: usize },
    SandboxFault { addr: usize },
    Timeout,
    /// The retry ceiling was reached while the execution kept faulting.
    RetryExhausted,
    /// The faulting address could not be mapped.
    MappingRejected { addr: usize },
}

impl StopReason {
    /// Whether the pass produced memory worth diffing.
    pub fn is_quiet(&self) -> bool {
        *self == StopReason::Completed
    }
}

/// Result of one [`RetryLoop::run_until_quiet`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietRun {
    pub stop: StopReason,
    /// Number of executions performed.
    pub attempts: u32,
}

enum State {
    Running,
    Mapping { addr: usize },
    Stopped(StopReason),
}

/// The bounded execute / map / execute state machine.
#[derive(Debug, Clone, Copy)]
pub struct RetryLoop {
    max_retries: u32,
}

impl RetryLoop {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Calls `execute` until it completes without a recoverable segfault,
    /// mapping fresh pages filled with `fill` at every faulting address.
    ///
    /// `execute` is expected to arm and disarm the watchdog around the run.
    pub fn run_until_quiet<F>(
        &self,
        mut execute: F,
        fill: u8,
        tracker: &mut RegionTracker,
        logger: &Logger,
    ) -> QuietRun
    where
        F: FnMut() -> Outcome,
    {
        let mut attempts = 0;
        let mut state = State::Running;
        loop {
            state = match state {
                State::Running if attempts >= self.max_retries => {
                    error!(logger, "ERROR: Max retries exceeded, aborting run_until_quiet"; "attempts" => attempts);
                    State::Stopped(StopReason::RetryExhausted)
                }
                State::Running => {
                    attempts += 1;
                    match execute() {
                        Outcome::Completed => State::Stopped(StopReason::Completed),
                        Outcome::RecoverableSegfault { addr } => State::Mapping { addr },
                        Outcome::UnrecoverableFault { signal, addr } => {
                            warn!(logger, "non-recoverable fault, exiting loop";
                                "signal" => signal_name(signal), "addr" => format!("{addr:#x}"));
                            State::Stopped(StopReason::UnrecoverableFault { signal, addr })
                        }
                        Outcome::SandboxFault { addr } => {
                            warn!(logger, "fault inside the sandbox, exiting loop"; "addr" => format!("{addr:#x}"));
                            State::Stopped(StopReason::SandboxFault { addr })
                        }
                        Outcome::Timeout => {
                            warn!(logger, "watchdog fired, exiting loop");
                            State::Stopped(StopReason::Timeout)
                        }
                    }
                }
                State::Mapping { addr } => match map_fault(addr, fill, tracker, logger) {
                    Ok(Tracked::Duplicate) => {
                        warn!(logger, "fault inside an already mapped region"; "addr" => format!("{addr:#x}"));
                        State::Running
                    }
                    Ok(_) => State::Running,
                    Err(err) => {
                        warn!(logger, "cannot map faulting address"; "error" => %err);
                        State::Stopped(StopReason::MappingRejected { addr })
                    }
                },
                State::Stopped(stop) => {
                    debug!(logger, "run_until_quiet finished"; "stop" => ?stop, "attempts" => attempts);
                    return QuietRun { stop, attempts };
                }
            };
        }
    }
}
