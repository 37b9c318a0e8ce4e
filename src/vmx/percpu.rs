use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use super::structs::{FeatureControl, FeatureControlFlags, VmxBasic, VmxRegion};
use super::vmcs::instruction_failed;
use crate::error::{HarnessError, Result};
use crate::guest::BumpHeap;
use crate::x86::{CpuOps, Cr4Flags, Msr, cpu_features};

/// Returns `true` if the CPU advertises VMX.
pub fn has_hardware_support(cpu: &impl CpuOps) -> bool {
    cpu_features(cpu)
        .get_feature_info()
        .is_some_and(|info| info.has_vmx())
}

/// VMX state of the guest CPU.
///
/// VMX root operation is entered and left at most once per transition: the
/// on/off state is cached and the VMXON region is allocated only once.
#[derive(Debug)]
pub struct VmxPerCpuState<'a> {
    /// The VMCS revision identifier, read when VMX is first enabled.
    pub(crate) vmcs_revision_id: u32,
    vmxon_region: Option<VmxRegion<'a>>,
    on: bool,
}

impl<'a> VmxPerCpuState<'a> {
    pub const fn new() -> Self {
        Self {
            vmcs_revision_id: 0,
            vmxon_region: None,
            on: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.on
    }

    /// Enters (`on`) or leaves VMX root operation. Does nothing if the CPU is
    /// already in the requested state.
    pub fn enable(&mut self, cpu: &impl CpuOps, heap: &mut BumpHeap<'a>, on: bool) -> Result {
        if on == self.on {
            return Ok(());
        }
        if on { self.hardware_enable(cpu, heap) } else { self.hardware_disable(cpu) }
    }

    fn hardware_enable(&mut self, cpu: &impl CpuOps, heap: &mut BumpHeap<'a>) -> Result {
        if !has_hardware_support(cpu) {
            return Err(HarnessError::Unsupported("CPU does not support VMX"));
        }

        // Enable VMXON, if required.
        let ctrl = FeatureControl::read(cpu);
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            unsafe {
                FeatureControl::write(
                    cpu,
                    ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
                )
            }
        } else if !vmxon_outside {
            return Err(HarnessError::Unsupported("VMX is disabled by BIOS"));
        }

        let cr4 = cpu.read_cr4() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();

        // Check control registers are in a VMX-friendly state. (SDM Vol. 3C, Appendix A.7, A.8)
        macro_rules! cr_is_valid {
            ($value: expr, $crx: ident) => {{
                use Msr::*;
                let value = $value;
                paste::paste! {
                    let fixed0 = [<IA32_VMX_ $crx _FIXED0>].read(cpu);
                    let fixed1 = [<IA32_VMX_ $crx _FIXED1>].read(cpu);
                }
                (!value & fixed0) == 0 && (value & !fixed1) == 0
            }};
        }
        if !cr_is_valid!(cpu.read_cr0(), CR0) {
            return Err(HarnessError::Unsupported("CR0 is not valid in VMX operation"));
        }
        if !cr_is_valid!(cr4, CR4) {
            return Err(HarnessError::Unsupported("CR4 is not valid in VMX operation"));
        }

        // Get VMCS revision identifier in IA32_VMX_BASIC MSR.
        let vmx_basic = VmxBasic::read(cpu);
        if vmx_basic.region_size as usize > PAGE_SIZE {
            return Err(HarnessError::Unsupported("VMX region does not fit a page"));
        }
        self.vmcs_revision_id = vmx_basic.revision_id;
        let region = match &self.vmxon_region {
            Some(region) => region.addr(),
            None => {
                let region = VmxRegion::new(heap, self.vmcs_revision_id)?;
                let addr = region.addr();
                self.vmxon_region = Some(region);
                addr
            }
        };

        unsafe {
            // Enable VMX using the VMXE bit.
            cpu.write_cr4(cr4);
            // Execute VMXON.
            cpu.vmxon(region)
                .map_err(|err| instruction_failed(cpu, "VMXON", region, err))?;
        }
        info!("succeeded to turn on VMX (VMXON region @ {:#x}).", region);

        self.on = true;
        Ok(())
    }

    fn hardware_disable(&mut self, cpu: &impl CpuOps) -> Result {
        unsafe {
            // Execute VMXOFF.
            cpu.vmxoff()
                .map_err(|err| instruction_failed(cpu, "VMXOFF", 0, err))?;
            // Remove VMXE bit in CR4.
            cpu.write_cr4(cpu.read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
        };
        info!("succeeded to turn off VMX.");

        self.on = false;
        Ok(())
    }
}

impl Default for VmxPerCpuState<'_> {
    fn default() -> Self {
        Self::new()
    }
}
