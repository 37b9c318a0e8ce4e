//! One-call driver for a test payload.

use super::backend::VmBackend;
use super::config::HarnessConfig;
use super::instance::{RunOutcome, VmInstance};
use super::{HostError, Result};
use crate::layout::TestResult;

/// Tally of the results a test produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub broken: u32,
    pub warnings: u32,
    pub skipped: u32,
}

impl TestSummary {
    /// Counts one result. `TINFO` is not counted.
    pub fn record(&mut self, result: TestResult) {
        match result {
            TestResult::Pass => self.passed += 1,
            TestResult::Fail => self.failed += 1,
            TestResult::Broken => self.broken += 1,
            TestResult::Warn => self.warnings += 1,
            TestResult::Conf => self.skipped += 1,
            TestResult::Info => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The overall outcome. A test that reported nothing is broken.
    pub fn outcome(&self) -> TestResult {
        if self.broken > 0 || self.is_empty() {
            TestResult::Broken
        } else if self.failed > 0 {
            TestResult::Fail
        } else if self.warnings > 0 {
            TestResult::Warn
        } else if self.passed == 0 {
            TestResult::Conf
        } else {
            TestResult::Pass
        }
    }
}

/// Checks `config`, runs `payload` in a fresh VM from `backend` and tallies
/// every result the guest posted.
///
/// Harness errors are logged and counted as `TBROK`, or as `TCONF` when a
/// prerequisite is missing.
pub fn run_payload<B: VmBackend>(
    config: &HarnessConfig,
    backend: impl FnOnce() -> Result<B>,
    ram_size: usize,
    payload: &[u8],
) -> TestSummary {
    let mut summary = TestSummary::default();
    if let Err(err) = run_checked(config, backend, ram_size, payload, &mut summary) {
        match err.outcome() {
            TestResult::Conf => warn!("{}", err),
            _ => error!("{}", err),
        }
        // A guest TBROK was already counted from its report.
        if !matches!(err, HostError::GuestBroken(_)) {
            summary.record(err.outcome());
        }
    }
    if summary.is_empty() {
        error!("Test did not report any results");
    }
    summary
}

fn run_checked<B: VmBackend>(
    config: &HarnessConfig,
    backend: impl FnOnce() -> Result<B>,
    ram_size: usize,
    payload: &[u8],
    summary: &mut TestSummary,
) -> Result {
    config.check()?;
    let _restore = config.apply()?;
    let mut vm = VmInstance::create(backend()?, ram_size, payload)?;
    let res = vm.run(None);
    for report in vm.reports() {
        if let Some(outcome) = report.outcome() {
            summary.record(outcome);
        }
    }
    if let Ok(RunOutcome::Finished(report)) = &res {
        debug!("guest exited at {}:{}", report.file.as_deref().unwrap_or("?"), report.line);
    }
    vm.destroy()?;
    res.map(drop)
}
