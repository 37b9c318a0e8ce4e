//! The VM instance: lifecycle, run loop and the host end of the Result Record.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::Level;
use memory_addr::align_down;

use super::backend::{VmBackend, VmExit};
use super::bootstrap;
use super::memory::{GuardedMapping, GuestMemory, RegionFlags};
use super::{HostError, Result};
use crate::layout::*;

/// Slot of the guest RAM region.
const RAM_SLOT: usize = 0;
/// Slot of the Result Record page.
const RESULT_SLOT: usize = 1;
/// Longest file name read back from the guest.
const MAX_FILE_NAME: usize = 256;
/// Sleep between polls of [`HostChannel::wait_for_signal`].
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle of a [`VmInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    MemoryInstalled,
    Running,
    /// Stopped at a checkpoint or on an expected run error; can run again.
    Halted,
    Exited,
    Destroyed,
}

/// One result the guest posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Raw result code, one of the [`TestResult`] codes or [`RESULT_EXIT`].
    pub result: i32,
    pub line: i32,
    pub file: Option<String>,
    pub message: String,
}

impl Report {
    pub fn outcome(&self) -> Option<TestResult> {
        TestResult::from_code(self.result)
    }

    pub fn is_exit(&self) -> bool {
        self.result == RESULT_EXIT
    }

    fn log_level(&self) -> Level {
        match self.outcome() {
            Some(TestResult::Fail | TestResult::Broken) => Level::Error,
            Some(TestResult::Warn | TestResult::Conf) => Level::Warn,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.file.as_deref().unwrap_or("<unknown>");
        match self.outcome() {
            Some(outcome) => write!(f, "{}:{}: {}: {}", file, self.line, outcome, self.message),
            None => write!(f, "{}:{}: {:#x}: {}", file, self.line, self.result, self.message),
        }
    }
}

/// How [`VmInstance::run`] ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest exited; carries the final record.
    Finished(Report),
    /// The run primitive failed with the expected errno.
    Stopped(i32),
}

/// Result of [`HostChannel::wait_for_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
    /// The guest signaled, with its correlation value.
    Signaled(u64),
    /// The guest finished without signaling.
    Finished,
    TimedOut,
}

struct Shared {
    page: Arc<GuardedMapping>,
    finished: AtomicBool,
}

/// Host view of the Result Record that can be used from another thread
/// while the instance runs.
#[derive(Clone)]
pub struct HostChannel(Arc<Shared>);

impl HostChannel {
    fn new(page: Arc<GuardedMapping>) -> Self {
        Self(Arc::new(Shared {
            page,
            finished: AtomicBool::new(false),
        }))
    }

    pub fn record(&self) -> &ResultRecord {
        // SAFETY: the page is a whole, page-aligned mapping kept alive by `self`.
        unsafe { ResultRecord::from_addr(self.0.page.as_ptr() as usize) }
    }

    /// Returns `true` once the guest exited or the run ended in an error.
    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire) || self.record().result() == RESULT_EXIT
    }

    fn set_finished(&self, finished: bool) {
        self.0.finished.store(finished, Ordering::Release);
    }

    /// Waits until the guest signals.
    ///
    /// `timeout_ms == 0` polls once and a negative timeout waits forever. A
    /// finished guest ends the wait even if the timeout has not expired.
    pub fn wait_for_signal(&self, timeout_ms: i64) -> SignalStatus {
        let deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            if self.is_finished() {
                return SignalStatus::Finished;
            }
            let record = self.record();
            if record.result() == RESULT_SYNC {
                return SignalStatus::Signaled(record.file_addr());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return SignalStatus::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Releases a guest blocked in `wait_host`.
    pub fn clear_signal(&self) {
        let record = self.record();
        if record.result() == RESULT_SYNC {
            record.clear();
        }
    }
}

impl fmt::Debug for HostChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostChannel")
            .field("result", &self.record().result())
            .field("finished", &self.0.finished.load(Ordering::Relaxed))
            .finish()
    }
}

/// A single-vCPU machine running one test payload.
pub struct VmInstance<B: VmBackend> {
    backend: B,
    memory: GuestMemory,
    channel: HostChannel,
    state: InstanceState,
    ram_size: usize,
    reports: Vec<Report>,
}

impl<B: VmBackend> VmInstance<B> {
    /// Installs guest RAM and the Result Record page, writes the boot
    /// structures and `payload`, and loads the initial vCPU state.
    ///
    /// `ram_size` is clamped below [`RAM_CEILING`], which keeps the pages KVM
    /// reserves for its identity map and TSS out of guest RAM.
    pub fn create(backend: B, ram_size: usize, payload: &[u8]) -> Result<Self> {
        let ram_size = align_down(ram_size.min(RAM_CEILING as usize), PAGE_SIZE);
        if ram_size < MIN_RAM_SIZE {
            return Err(HostError::InvalidRamSize(ram_size));
        }

        let mut memory = GuestMemory::new();
        let page = memory
            .alloc_region(RESULT_SLOT, RESULT_BASEADDR, RESULT_SIZE, RegionFlags::empty())?
            .mapping()
            .clone();
        let mut instance = Self {
            backend,
            memory,
            channel: HostChannel::new(page),
            state: InstanceState::Created,
            ram_size,
            reports: Vec::new(),
        };
        instance.install(RESULT_SLOT)?;
        instance.alloc_region(RAM_SLOT, 0, ram_size, RegionFlags::empty())?;
        instance.state = InstanceState::MemoryInstalled;

        let boot = bootstrap::build(&mut instance.memory, ram_size, payload)?;
        instance.backend.setup_vcpu(&boot)?;
        instance.channel.record().clear();
        info!(
            "VM created: {:#x} bytes of RAM, {:#x} byte payload",
            ram_size,
            payload.len()
        );
        Ok(instance)
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn ram_size(&self) -> usize {
        self.ram_size
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Checkpoints processed so far, in order.
    pub fn reports(&self) -> &[Report] {
        &self.reports
    }

    /// A handle to the Result Record for use from another thread.
    pub fn channel(&self) -> HostChannel {
        self.channel.clone()
    }

    /// Maps an extra guest region, see [`GuestMemory::alloc_region`].
    pub fn alloc_region(&mut self, slot: usize, guest_addr: u64, size: usize, flags: RegionFlags) -> Result<*mut u8> {
        if self.state == InstanceState::Destroyed {
            return Err(HostError::InvalidState(self.state));
        }
        let host = self.memory.alloc_region(slot, guest_addr, size, flags)?.host_addr();
        self.install(slot)?;
        Ok(host)
    }

    fn install(&mut self, slot: usize) -> Result {
        let Some(region) = self.memory.region(slot) else {
            return Err(HostError::SlotOutOfRange(slot));
        };
        // SAFETY: the mapping lives in `self.memory` until `destroy` removes
        // the slot from the backend first.
        let res = unsafe {
            self.backend.set_user_memory_region(
                region.slot(),
                region.guest_base(),
                region.size() as u64,
                region.host_addr() as u64,
                region.flags(),
            )
        };
        if res.is_err() {
            self.memory.remove(slot);
        }
        res
    }

    /// Runs the guest until it exits.
    ///
    /// Checkpoints are logged and collected in [`reports`](Self::reports),
    /// then the guest is resumed. If the run primitive fails with
    /// `expected_errno` the run stops with [`RunOutcome::Stopped`] and can be
    /// continued by another call.
    pub fn run(&mut self, expected_errno: Option<i32>) -> Result<RunOutcome> {
        let first = match self.state {
            InstanceState::MemoryInstalled => true,
            InstanceState::Halted => false,
            state => return Err(HostError::InvalidState(state)),
        };
        self.state = InstanceState::Running;
        self.channel.set_finished(false);
        let res = self.run_loop(first, expected_errno);
        match &res {
            Ok(RunOutcome::Stopped(_)) => self.state = InstanceState::Halted,
            _ => {
                self.state = InstanceState::Exited;
                self.channel.set_finished(true);
            }
        }
        res
    }

    fn run_loop(&mut self, first: bool, expected_errno: Option<i32>) -> Result<RunOutcome> {
        let record = self.channel.record();
        if first {
            record.clear();
        }
        loop {
            let exit = match self.backend.run() {
                Ok(exit) => exit,
                Err(err) => match err.errno() {
                    Some(errno) if Some(errno) == expected_errno => {
                        debug!("run stopped with expected errno {}", errno);
                        return Ok(RunOutcome::Stopped(errno));
                    }
                    // Interrupted runs are retried without touching the record:
                    // the guest may be waiting on a signal.
                    Some(libc::EINTR | libc::EAGAIN) => continue,
                    _ => return Err(err),
                },
            };
            if exit != VmExit::Halt {
                let rip = self.backend.rip()?;
                return Err(HostError::UnexpectedExit {
                    exit: exit.to_string(),
                    rip,
                });
            }

            let report = self.read_report();
            match report.result {
                RESULT_EXIT => return Ok(RunOutcome::Finished(report)),
                RESULT_NONE => return Err(HostError::NoResult),
                code if TestResult::from_code(code).is_none() => return Err(HostError::InvalidResult(code)),
                _ => {}
            }

            log!(report.log_level(), "{}", report);
            self.reports.push(report.clone());
            if report.outcome() == Some(TestResult::Broken) {
                return Err(HostError::GuestBroken(report));
            }
            record.clear();
        }
    }

    fn read_report(&self) -> Report {
        let record = self.channel.record();
        let result = record.result();
        let file = match record.file_addr() {
            0 => None,
            addr => self.memory.read_c_string(addr, MAX_FILE_NAME),
        };
        // SAFETY: the vCPU is stopped, nothing writes the message.
        let message = String::from_utf8_lossy(unsafe { record.message() }).into_owned();
        Report {
            result,
            line: record.line(),
            file,
            message,
        }
    }

    /// See [`HostChannel::wait_for_signal`].
    pub fn wait_for_signal(&self, timeout_ms: i64) -> SignalStatus {
        self.channel.wait_for_signal(timeout_ms)
    }

    /// See [`HostChannel::clear_signal`].
    pub fn clear_signal(&self) {
        self.channel.clear_signal()
    }

    /// Releases the vCPU, then every memory region, then the machine.
    pub fn destroy(&mut self) -> Result {
        if self.state == InstanceState::Destroyed {
            return Ok(());
        }
        if self.state == InstanceState::Running {
            return Err(HostError::InvalidState(self.state));
        }
        self.backend.release_vcpu()?;
        for slot in 0..MAX_REGIONS {
            let Some(region) = self.memory.region(slot) else {
                continue;
            };
            // SAFETY: a zero-sized region releases the slot.
            unsafe {
                self.backend
                    .set_user_memory_region(region.slot(), region.guest_base(), 0, region.host_addr() as u64, region.flags())?;
            }
            self.memory.remove(slot);
        }
        self.backend.release_vm()?;
        self.channel.set_finished(true);
        self.state = InstanceState::Destroyed;
        debug!("VM destroyed");
        Ok(())
    }
}

impl<B: VmBackend> Drop for VmInstance<B> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!("failed to destroy VM: {}", err);
        }
    }
}
