//! AMD-SVM nested guests.
//!
//! The test payload acts as the hypervisor: it enables SVM, builds a VMCB from
//! its own CPU state and runs a function as a nested guest until it halts.

mod definitions; // intercept ids and #VMEXIT codes
mod percpu; // EFER.SVME and the host save area
mod vcpu;
mod vmcb;

pub use self::definitions::{SVM_INTERCEPT_MAX, SvmExitCode, SvmIntercept};
pub use self::percpu::{SvmPerCpuState, has_hardware_support};
pub use self::vcpu::SvmVcpu;
pub use self::vmcb::{SegmentState, SvmExitInfo, VmLoadSaveStates, VmcbSegment, VmcbStruct};

use crate::error::{HarnessError, Result};
use crate::guest::GuestRuntime;
use crate::x86::{CpuOps, NestedGuestMain};

impl<'a, C: CpuOps> GuestRuntime<'a, C> {
    /// Enables SVM on the guest CPU.
    pub fn svm_enable(&mut self) -> Result {
        self.svm.enable(&self.cpu, &mut self.heap)
    }

    /// Creates a nested vCPU running `guest_main`, enabling SVM first if
    /// needed.
    pub fn svm_create_vcpu(&mut self, guest_main: NestedGuestMain, alloc_stack: bool) -> Result<SvmVcpu<'a>> {
        self.svm_enable()?;
        SvmVcpu::create(&self.cpu, &mut self.heap, guest_main as usize as u64, alloc_stack)
    }

    /// Runs `vcpu` until its next #VMEXIT.
    pub fn svm_vmrun(&mut self, vcpu: &mut SvmVcpu<'a>) -> Result<SvmExitInfo> {
        let host_vmcb = self
            .svm
            .host_vmcb()
            .ok_or(HarnessError::Unsupported("SVM is not enabled"))?;
        vcpu.run(&self.cpu, host_vmcb)
    }
}
