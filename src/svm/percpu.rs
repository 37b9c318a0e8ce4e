//! AMD-SVM enable logic.
//!
//! Reference: AMD64 APM vol. 2, section 15.4 "Enabling SVM".
//!
//!  1. check CPUID for SVM support
//!  2. make sure the BIOS did not lock SVM off (`VM_CR.SVMDIS`)
//!  3. set `EFER.SVME`
//!  4. register a host state-save area in `VM_HSAVE_PA`

use bit_field::BitField;

use super::vmcb::VmcbStruct;
use crate::error::{HarnessError, Result};
use crate::guest::BumpHeap;
use crate::x86::{CpuOps, EferFlags, Msr, cpu_features};
use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// `VM_CR.SVMDIS`: SVM is disabled and EFER.SVME cannot be set.
const VM_CR_SVMDIS: usize = 4;

/// Returns `true` if the CPU advertises SVM.
pub fn has_hardware_support(cpu: &impl CpuOps) -> bool {
    cpu_features(cpu)
        .get_extended_processor_and_feature_identifiers()
        .is_some_and(|ext| ext.has_svm())
}

/// SVM state of the guest CPU: the host save area and the block the outer
/// context's VMLOAD/VMSAVE state is parked in across a nested run.
pub struct SvmPerCpuState<'a> {
    hsave_page: Option<&'a mut [u8]>,
    host_vmcb: Option<&'a mut VmcbStruct>,
}

impl<'a> SvmPerCpuState<'a> {
    pub const fn new() -> Self {
        Self {
            hsave_page: None,
            host_vmcb: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.host_vmcb.is_some()
    }

    /// Enables SVM on `cpu`. Does nothing if already enabled.
    pub fn enable(&mut self, cpu: &impl CpuOps, heap: &mut BumpHeap<'a>) -> Result {
        if self.is_enabled() {
            return Ok(());
        }
        if !has_hardware_support(cpu) {
            return Err(HarnessError::Unsupported("CPU does not support SVM"));
        }
        if Msr::VM_CR.read(cpu).get_bit(VM_CR_SVMDIS) {
            return Err(HarnessError::Unsupported("SVM is supported but disabled"));
        }

        let hsave_page = heap.alloc_page()?;
        // SAFETY: a zeroed VMCB is valid.
        let host_vmcb = unsafe { heap.alloc_struct::<VmcbStruct>(PAGE_SIZE)? };

        let mut efer = EferFlags::from_bits_truncate(Msr::IA32_EFER.read(cpu));
        efer.insert(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE);
        unsafe {
            Msr::IA32_EFER.write(cpu, efer.bits());
            Msr::VM_HSAVE_PA.write(cpu, hsave_page.as_ptr() as u64);
        }

        info!("SVM enabled (HSAVE @ {:#x}).", hsave_page.as_ptr() as usize);
        self.hsave_page = Some(hsave_page);
        self.host_vmcb = Some(host_vmcb);
        Ok(())
    }

    pub fn hsave_addr(&self) -> Option<u64> {
        self.hsave_page.as_ref().map(|page| page.as_ptr() as u64)
    }

    /// The block holding the outer context's VMLOAD/VMSAVE state.
    pub fn host_vmcb(&self) -> Option<&VmcbStruct> {
        self.host_vmcb.as_deref()
    }
}

impl Default for SvmPerCpuState<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{MockCpu, TestArena};

    #[test]
    fn test_svm_enable() {
        let cpu = MockCpu::new_amd();
        let mut arena = TestArena::new(4);
        let mut heap = arena.heap();
        let mut state = SvmPerCpuState::new();
        assert!(!state.is_enabled());

        state.enable(&cpu, &mut heap).unwrap();
        assert!(state.is_enabled());
        let efer = EferFlags::from_bits_truncate(cpu.msr(Msr::IA32_EFER));
        assert!(efer.contains(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE));
        assert_eq!(Some(cpu.msr(Msr::VM_HSAVE_PA)), state.hsave_addr());
        assert_eq!(state.hsave_addr().unwrap() % PAGE_SIZE as u64, 0);

        let cursor = heap.cursor();
        state.enable(&cpu, &mut heap).unwrap();
        assert_eq!(heap.cursor(), cursor);
    }

    #[test]
    fn test_svm_unsupported() {
        let cpu = MockCpu::new_intel();
        let mut arena = TestArena::new(4);
        let mut heap = arena.heap();
        let err = SvmPerCpuState::new().enable(&cpu, &mut heap).unwrap_err();
        assert_eq!(err, HarnessError::Unsupported("CPU does not support SVM"));
        assert_eq!(err.outcome(), crate::TestResult::Conf);
    }

    #[test]
    fn test_svm_locked_off() {
        let cpu = MockCpu::new_amd();
        cpu.set_msr(Msr::VM_CR, 1 << VM_CR_SVMDIS);
        let mut arena = TestArena::new(4);
        let mut heap = arena.heap();
        assert_eq!(
            SvmPerCpuState::new().enable(&cpu, &mut heap),
            Err(HarnessError::Unsupported("SVM is supported but disabled"))
        );
        assert_eq!(cpu.msr(Msr::IA32_EFER) & (1 << 12), 0);
    }
}
