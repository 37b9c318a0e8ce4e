//! A [`VmBackend`] that runs closures instead of a vCPU.
//!
//! Every `run` pops the next step and hands it a [`ScriptedGuest`], which sees
//! the installed regions through their host mappings and can post to the
//! Result Record the way a payload would. With no steps left the guest halts
//! without posting anything.

use std::collections::VecDeque;

use crate::guest::ResultChannel;
use crate::host::{BootState, HostError, RegionFlags, Result, VmBackend, VmExit};
use crate::layout::{PAYLOAD_BASE, RESULT_BASEADDR, ResultRecord};

type Step = Box<dyn FnOnce(&ScriptedGuest) -> Result<VmExit> + Send>;

#[derive(Debug, Clone, Copy)]
struct Region {
    slot: u32,
    guest_addr: u64,
    size: u64,
    host_addr: u64,
}

/// Guest memory as a scripted step sees it.
pub struct ScriptedGuest {
    regions: Vec<Region>,
}

impl ScriptedGuest {
    pub fn host_addr(&self, guest_addr: u64) -> Option<u64> {
        self.regions
            .iter()
            .find(|r| (r.guest_addr..r.guest_addr + r.size).contains(&guest_addr))
            .map(|r| r.host_addr + (guest_addr - r.guest_addr))
    }

    pub fn record(&self) -> &ResultRecord {
        let addr = self.host_addr(RESULT_BASEADDR).expect("result page not installed");
        // SAFETY: the instance keeps the page mapped while the backend runs.
        unsafe { ResultRecord::from_addr(addr as usize) }
    }

    pub fn channel(&self) -> ResultChannel<'_> {
        ResultChannel::new(self.record())
    }

    pub fn write(&self, guest_addr: u64, bytes: &[u8]) {
        let addr = self.host_addr(guest_addr).expect("unbacked guest address");
        // SAFETY: the test keeps writes inside one region.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    }

    pub fn read(&self, guest_addr: u64, len: usize) -> Vec<u8> {
        let addr = self.host_addr(guest_addr).expect("unbacked guest address");
        // SAFETY: as in `write`.
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }
}

#[derive(Default)]
pub struct ScriptedBackend {
    regions: Vec<Region>,
    steps: VecDeque<Step>,
    pub boot: Option<BootState>,
    pub runs: usize,
    pub rip: u64,
    /// Teardown calls in the order they were made.
    pub released: Vec<String>,
    vcpu_closed: bool,
    vm_closed: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            rip: PAYLOAD_BASE,
            ..Default::default()
        }
    }

    pub fn step(mut self, f: impl FnOnce(&ScriptedGuest) -> Result<VmExit> + Send + 'static) -> Self {
        self.steps.push_back(Box::new(f));
        self
    }

    pub fn slots(&self) -> Vec<u32> {
        self.regions.iter().map(|r| r.slot).collect()
    }
}

impl VmBackend for ScriptedBackend {
    unsafe fn set_user_memory_region(
        &mut self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
        _flags: RegionFlags,
    ) -> Result {
        if self.vm_closed {
            return Err(HostError::Released("VM"));
        }
        self.regions.retain(|r| r.slot != slot);
        if size == 0 {
            self.released.push(format!("slot {slot}"));
        } else {
            self.regions.push(Region {
                slot,
                guest_addr,
                size,
                host_addr,
            });
        }
        Ok(())
    }

    fn setup_vcpu(&mut self, boot: &BootState) -> Result {
        self.boot = Some(*boot);
        Ok(())
    }

    fn run(&mut self) -> Result<VmExit> {
        if self.vcpu_closed {
            return Err(HostError::Released("vCPU"));
        }
        self.runs += 1;
        let guest = ScriptedGuest {
            regions: self.regions.clone(),
        };
        match self.steps.pop_front() {
            Some(step) => step(&guest),
            None => Ok(VmExit::Halt),
        }
    }

    fn rip(&mut self) -> Result<u64> {
        Ok(self.rip)
    }

    fn release_vcpu(&mut self) -> Result {
        self.vcpu_closed = true;
        self.released.push("vcpu".into());
        Ok(())
    }

    fn release_vm(&mut self) -> Result {
        self.vcpu_closed = true;
        self.vm_closed = true;
        self.released.push("vm".into());
        Ok(())
    }
}
