//! Runs fuzz cases: inject, execute, discover the memory footprint, diff it
//! under two fill bytes, report.

use std::collections::HashSet;

use anyhow::{Context, Result};
use slog::{Logger, debug, info, o, warn};

use crate::config::HarnessConfig;
use crate::constants::{FIRST_PASS_FILL, SECOND_PASS_FILL};
use crate::diff::{DiffEngine, MemDiff};
use crate::guard::{Guard, Outcome, signal_name};
use crate::region::{MappedRegion, RegionTracker};
use crate::retry::{RetryLoop, StopReason};
use crate::sandbox::{FuzzCase, Sandbox, SandboxEntry};
use crate::session::BatchRunner;
use crate::watchdog::Watchdog;

/// Findings of one fill-byte pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub fill: u8,
    pub stop: StopReason,
    pub attempts: u32,
    pub regions: Vec<MappedRegion>,
    /// Empty unless the pass ran until quiet.
    pub diffs: Vec<MemDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseReport {
    pub index: usize,
    pub word: u32,
    /// Outcome of the initial probing execution.
    pub first_outcome: Outcome,
    /// Zero, one (second pass abandoned) or two passes.
    pub passes: Vec<PassReport>,
}

impl CaseReport {
    /// Addresses that differ from the fill byte in both passes: bytes the
    /// instruction wrote itself rather than stale memory contents.
    pub fn ghost_writes(&self) -> Vec<usize> {
        let [first, second] = self.passes.as_slice() else {
            return Vec::new();
        };
        let second: HashSet<usize> = second.diffs.iter().map(|d| d.address).collect();
        first.diffs.iter().map(|d| d.address).filter(|addr| second.contains(addr)).collect()
    }

    pub fn diff_count(&self) -> usize {
        self.passes.iter().map(|p| p.diffs.len()).sum()
    }
}

/// Owns everything a case touches: the sandbox, the lazily mapped regions,
/// the diff list and the watchdog. One driver per thread.
pub struct CaseDriver<E> {
    guard: Guard,
    watchdog: Watchdog,
    sandbox: Sandbox,
    tracker: RegionTracker,
    diff: DiffEngine,
    retry: RetryLoop,
    entry: E,
    logger: Logger,
}

impl<E: SandboxEntry> CaseDriver<E> {
    pub fn new(entry: E, config: &HarnessConfig, logger: Logger) -> Result<Self> {
        let tracker = RegionTracker::with_capacity(config.max_regions).context("allocating the region table")?;
        Ok(Self {
            guard: Guard::install()?,
            watchdog: Watchdog::new(config.timeout)?,
            sandbox: Sandbox::new()?,
            tracker,
            diff: DiffEngine::new(),
            retry: RetryLoop::new(config.max_retries),
            entry,
            logger,
        })
    }

    pub fn entry(&self) -> &E {
        &self.entry
    }

    pub fn entry_mut(&mut self) -> &mut E {
        &mut self.entry
    }

    pub fn tracker(&self) -> &RegionTracker {
        &self.tracker
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn run_case(&mut self, index: usize, word: u32) -> CaseReport {
        let logger = self.logger.new(o!("case" => index));
        info!(logger, "=== Running fuzz case ==="; "word" => format!("{word:#010x}"));
        let case = FuzzCase::new(word);

        self.sandbox.inject(&case, &logger);
        self.tracker.unmap_all(&logger);

        let first_outcome = execute(&self.guard, &self.watchdog, &self.sandbox, &mut self.entry);
        let mut report = CaseReport {
            index,
            word,
            first_outcome,
            passes: Vec::new(),
        };
        match first_outcome {
            Outcome::RecoverableSegfault { addr } => {
                debug!(logger, "segfault outside the sandbox, discovering footprint"; "addr" => format!("{addr:#x}"));
            }
            Outcome::Completed => {
                debug!(logger, "completed without faults");
                return report;
            }
            Outcome::UnrecoverableFault { signal, addr } => {
                warn!(logger, "non-recoverable fault, case abandoned";
                    "signal" => signal_name(signal), "addr" => format!("{addr:#x}"));
                return report;
            }
            Outcome::SandboxFault { addr } => {
                warn!(logger, "fault inside the sandbox, case abandoned"; "addr" => format!("{addr:#x}"));
                return report;
            }
            Outcome::Timeout => {
                warn!(logger, "watchdog fired, case abandoned");
                return report;
            }
        }

        for fill in [FIRST_PASS_FILL, SECOND_PASS_FILL] {
            let pass = self.run_pass(&case, fill, &logger);
            let quiet = pass.stop.is_quiet();
            report.passes.push(pass);
            if !quiet {
                warn!(logger, "pass did not run until quiet, case abandoned"; "fill" => format!("{fill:#04x}"));
                return report;
            }
        }

        self.entry.report_registers(&logger);
        let ghosts = report.ghost_writes();
        if !ghosts.is_empty() {
            info!(logger, "bytes written in both passes"; "count" => ghosts.len());
        }
        report
    }

    /// Runs every word of `words` as one case, in order.
    pub fn run_cases(&mut self, words: &[u32]) -> Vec<CaseReport> {
        words.iter().enumerate().map(|(i, &word)| self.run_case(i, word)).collect()
    }

    fn run_pass(&mut self, case: &FuzzCase, fill: u8, logger: &Logger) -> PassReport {
        // Earlier executions may have written anywhere, the sandbox included.
        self.sandbox.inject(case, logger);
        self.tracker.fill_all(fill);

        let (guard, watchdog, sandbox, entry) = (&self.guard, &self.watchdog, &self.sandbox, &mut self.entry);
        let run = self
            .retry
            .run_until_quiet(|| execute(guard, watchdog, sandbox, entry), fill, &mut self.tracker, logger);

        let diffs = if run.stop.is_quiet() {
            self.diff.scan_and_report(&self.guard, &self.tracker, fill, logger).to_vec()
        } else {
            Vec::new()
        };
        PassReport {
            fill,
            stop: run.stop,
            attempts: run.attempts,
            regions: self.tracker.regions().to_vec(),
            diffs,
        }
    }
}

/// One guarded execution of the injected code under the watchdog.
fn execute<E: SandboxEntry>(guard: &Guard, watchdog: &Watchdog, sandbox: &Sandbox, entry: &mut E) -> Outcome {
    let point = entry.prepare(sandbox);
    // SAFETY: the entry routine is built for guarded execution; everything it
    // may touch outside the sandbox is lazily mapped scratch memory.
    unsafe { guard.run_timed(watchdog, sandbox.range(), point.routine, point.arg) }
}

impl<E: SandboxEntry> BatchRunner for CaseDriver<E> {
    fn run_batch(&mut self, words: &[u32]) {
        self.run_cases(words);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(fill: u8, addrs: &[usize]) -> PassReport {
        PassReport {
            fill,
            stop: StopReason::Completed,
            attempts: 2,
            regions: Vec::new(),
            diffs: addrs
                .iter()
                .map(|&address| MemDiff { address, expected: fill, observed: 0x5A })
                .collect(),
        }
    }

    #[test]
    fn ghost_writes_need_both_passes() {
        let mut report = CaseReport {
            index: 0,
            word: 0x1002_8027,
            first_outcome: Outcome::RecoverableSegfault { addr: 0x1000 },
            passes: vec![pass(0x00, &[0x1000, 0x1001, 0x1002])],
        };
        assert!(report.ghost_writes().is_empty());

        report.passes.push(pass(0xFF, &[0x1001, 0x1002, 0x2000]));
        assert_eq!(report.ghost_writes(), vec![0x1001, 0x1002]);
        assert_eq!(report.diff_count(), 6);
    }
}
