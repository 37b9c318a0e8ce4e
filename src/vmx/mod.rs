//! Intel VMX nested guests.
//!
//! The payload enters VMX root operation, builds a VMCS from its own CPU state
//! and runs a function as a nested guest until it halts. The raw VMCS
//! accessors are exported too, so payloads can poke at individual fields.

mod definitions;
mod percpu;
mod structs;
mod vcpu;
mod vmcs;

pub use self::definitions::{VMX_EXIT_ENTRY_FAILURE, VmxExitReason, instruction_error_str};
pub use self::percpu::{VmxPerCpuState, has_hardware_support};
pub use self::structs::{FeatureControl, FeatureControlFlags, VmxBasic, VmxRegion};
pub use self::vcpu::VmxVcpu;
pub use self::vmcs::{
    VmcsControl32, VmcsControlNW, VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmcsHost16,
    VmcsHost32, VmcsHost64, VmcsHostNW, VmcsReadOnly32, VmcsReadOnlyNW, VmxExitInfo, controls,
    is_64bit_field, read_field, write_field,
};

use crate::error::{HarnessError, Result};
use crate::guest::GuestRuntime;
use crate::x86::{CpuOps, NestedGuestMain};

impl<'a, C: CpuOps> GuestRuntime<'a, C> {
    /// Enters (`on`) or leaves VMX root operation.
    pub fn vmx_enable(&mut self, on: bool) -> Result {
        self.vmx.enable(&self.cpu, &mut self.heap, on)
    }

    /// Allocates a VMCS stamped with the CPU's revision identifier.
    pub fn vmx_alloc_control_structure(&mut self) -> Result<VmxRegion<'a>> {
        if !has_hardware_support(&self.cpu) {
            return Err(HarnessError::Unsupported("CPU does not support VMX"));
        }
        VmxRegion::new(&mut self.heap, VmxBasic::read(&self.cpu).revision_id)
    }

    /// Makes `vmcs` the current VMCS.
    pub fn vmx_make_current(&self, vmcs: &VmxRegion<'_>) -> Result {
        vmcs::make_current(&self.cpu, vmcs.addr())
    }

    /// Returns the address of the current VMCS, `u64::MAX` if there is none.
    pub fn vmx_read_current_pointer(&self) -> Result<u64> {
        vmcs::read_current_pointer(&self.cpu)
    }

    pub fn vmx_clear(&self, vmcs: &VmxRegion<'_>) -> Result {
        vmcs::clear(&self.cpu, vmcs.addr())
    }

    /// Reads a field of the current VMCS.
    pub fn vmx_read_field(&self, field: u32) -> Result<u64> {
        read_field(&self.cpu, field)
    }

    /// Writes a field of the current VMCS.
    pub fn vmx_write_field(&self, field: u32, value: u64) -> Result {
        write_field(&self.cpu, field, value)
    }

    /// Creates a nested vCPU running `guest_main`, entering VMX root
    /// operation first if needed.
    pub fn vmx_create_vcpu(&mut self, guest_main: NestedGuestMain, alloc_stack: bool) -> Result<VmxVcpu<'a>> {
        self.vmx_enable(true)?;
        VmxVcpu::create(
            &self.cpu,
            &mut self.heap,
            self.vmx.vmcs_revision_id,
            guest_main as usize as u64,
            alloc_stack,
        )
    }

    /// Makes the VMCS of `vcpu` current and refreshes its host state.
    pub fn vmx_activate(&self, vcpu: &VmxVcpu<'a>) -> Result {
        vcpu.activate(&self.cpu)
    }

    /// Runs `vcpu` until its next VM exit.
    pub fn vmx_vmrun(&self, vcpu: &mut VmxVcpu<'a>) -> Result<VmxExitInfo> {
        if !self.vmx.is_enabled() {
            return Err(HarnessError::Unsupported("VMX is not enabled"));
        }
        vcpu.run(&self.cpu)
    }
}
