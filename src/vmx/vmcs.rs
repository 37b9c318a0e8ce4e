//! VMCS field encodings and accessors (SDM Vol. 3C, appendix B).
//!
//! All accesses go to the current VMCS through [`CpuOps`]. On 32-bit hosts a
//! 64-bit field is read and written as its low and high halves.

use bit_field::BitField;
use x86::vmx::VmFail;

use super::definitions::{VMX_EXIT_ENTRY_FAILURE, VmxExitReason, instruction_error_str};
use crate::error::{HarnessError, Result};
use crate::x86::{CpuOps, Msr};

macro_rules! vmcs_fields {
    ($(#[$attr:meta])* $name:ident : $ty:ty { $($field:ident = $encoding:literal,)+ }) => {
        numeric_enum_macro::numeric_enum! {
            #[repr(u32)]
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            #[allow(non_camel_case_types)]
            $(#[$attr])*
            pub enum $name {
                $($field = $encoding,)+
            }
        }

        impl $name {
            pub fn read(self, cpu: &impl CpuOps) -> Result<$ty> {
                read_field(cpu, self as u32).map(|value| value as $ty)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($($name:ident : $ty:ty),+ $(,)?) => {
        $(
            impl $name {
                pub fn write(self, cpu: &impl CpuOps, value: $ty) -> Result {
                    write_field(cpu, self as u32, value as u64)
                }
            }
        )+
    };
}

vmcs_fields! {
    /// 32-bit control fields.
    VmcsControl32: u32 {
        PINBASED_EXEC_CONTROLS = 0x4000,
        PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
        EXCEPTION_BITMAP = 0x4004,
        PAGE_FAULT_ERR_CODE_MASK = 0x4006,
        PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
        CR3_TARGET_COUNT = 0x400a,
        VMEXIT_CONTROLS = 0x400c,
        VMEXIT_MSR_STORE_COUNT = 0x400e,
        VMEXIT_MSR_LOAD_COUNT = 0x4010,
        VMENTRY_CONTROLS = 0x4012,
        VMENTRY_MSR_LOAD_COUNT = 0x4014,
        VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
        VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
        VMENTRY_INSTRUCTION_LEN = 0x401a,
        SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
    }
}

vmcs_fields! {
    /// Natural-width control fields.
    VmcsControlNW: u64 {
        CR0_GUEST_HOST_MASK = 0x6000,
        CR4_GUEST_HOST_MASK = 0x6002,
        CR0_READ_SHADOW = 0x6004,
        CR4_READ_SHADOW = 0x6006,
    }
}

vmcs_fields! {
    /// 16-bit guest-state fields.
    VmcsGuest16: u16 {
        ES_SELECTOR = 0x800,
        CS_SELECTOR = 0x802,
        SS_SELECTOR = 0x804,
        DS_SELECTOR = 0x806,
        FS_SELECTOR = 0x808,
        GS_SELECTOR = 0x80a,
        LDTR_SELECTOR = 0x80c,
        TR_SELECTOR = 0x80e,
    }
}

vmcs_fields! {
    /// 32-bit guest-state fields.
    VmcsGuest32: u32 {
        ES_LIMIT = 0x4800,
        CS_LIMIT = 0x4802,
        SS_LIMIT = 0x4804,
        DS_LIMIT = 0x4806,
        FS_LIMIT = 0x4808,
        GS_LIMIT = 0x480a,
        LDTR_LIMIT = 0x480c,
        TR_LIMIT = 0x480e,
        GDTR_LIMIT = 0x4810,
        IDTR_LIMIT = 0x4812,
        ES_ACCESS_RIGHTS = 0x4814,
        CS_ACCESS_RIGHTS = 0x4816,
        SS_ACCESS_RIGHTS = 0x4818,
        DS_ACCESS_RIGHTS = 0x481a,
        FS_ACCESS_RIGHTS = 0x481c,
        GS_ACCESS_RIGHTS = 0x481e,
        LDTR_ACCESS_RIGHTS = 0x4820,
        TR_ACCESS_RIGHTS = 0x4822,
        INTERRUPTIBILITY_STATE = 0x4824,
        ACTIVITY_STATE = 0x4826,
        SMBASE = 0x4828,
        IA32_SYSENTER_CS = 0x482a,
        VMX_PREEMPTION_TIMER_VALUE = 0x482e,
    }
}

vmcs_fields! {
    /// 64-bit guest-state fields.
    VmcsGuest64: u64 {
        LINK_PTR = 0x2800,
        IA32_DEBUGCTL = 0x2802,
        IA32_PAT = 0x2804,
        IA32_EFER = 0x2806,
    }
}

vmcs_fields! {
    /// Natural-width guest-state fields.
    VmcsGuestNW: u64 {
        CR0 = 0x6800,
        CR3 = 0x6802,
        CR4 = 0x6804,
        ES_BASE = 0x6806,
        CS_BASE = 0x6808,
        SS_BASE = 0x680a,
        DS_BASE = 0x680c,
        FS_BASE = 0x680e,
        GS_BASE = 0x6810,
        LDTR_BASE = 0x6812,
        TR_BASE = 0x6814,
        GDTR_BASE = 0x6816,
        IDTR_BASE = 0x6818,
        DR7 = 0x681a,
        RSP = 0x681c,
        RIP = 0x681e,
        RFLAGS = 0x6820,
        PENDING_DBG_EXCEPTIONS = 0x6822,
        IA32_SYSENTER_ESP = 0x6824,
        IA32_SYSENTER_EIP = 0x6826,
    }
}

vmcs_fields! {
    /// 16-bit host-state fields.
    VmcsHost16: u16 {
        ES_SELECTOR = 0xc00,
        CS_SELECTOR = 0xc02,
        SS_SELECTOR = 0xc04,
        DS_SELECTOR = 0xc06,
        FS_SELECTOR = 0xc08,
        GS_SELECTOR = 0xc0a,
        TR_SELECTOR = 0xc0c,
    }
}

vmcs_fields! {
    /// 32-bit host-state fields.
    VmcsHost32: u32 {
        IA32_SYSENTER_CS = 0x4c00,
    }
}

vmcs_fields! {
    /// 64-bit host-state fields.
    VmcsHost64: u64 {
        IA32_PAT = 0x2c00,
        IA32_EFER = 0x2c02,
    }
}

vmcs_fields! {
    /// Natural-width host-state fields.
    VmcsHostNW: u64 {
        CR0 = 0x6c00,
        CR3 = 0x6c02,
        CR4 = 0x6c04,
        FS_BASE = 0x6c06,
        GS_BASE = 0x6c08,
        TR_BASE = 0x6c0a,
        GDTR_BASE = 0x6c0c,
        IDTR_BASE = 0x6c0e,
        IA32_SYSENTER_ESP = 0x6c10,
        IA32_SYSENTER_EIP = 0x6c12,
        RSP = 0x6c14,
        RIP = 0x6c16,
    }
}

vmcs_fields! {
    /// 32-bit read-only data fields.
    VmcsReadOnly32: u32 {
        VM_INSTRUCTION_ERROR = 0x4400,
        EXIT_REASON = 0x4402,
        VMEXIT_INTERRUPTION_INFO = 0x4404,
        VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
        IDT_VECTORING_INFO = 0x4408,
        IDT_VECTORING_ERR_CODE = 0x440a,
        VMEXIT_INSTRUCTION_LEN = 0x440c,
        VMEXIT_INSTRUCTION_INFO = 0x440e,
    }
}

vmcs_fields! {
    /// Natural-width read-only data fields.
    VmcsReadOnlyNW: u64 {
        EXIT_QUALIFICATION = 0x6400,
        GUEST_LINEAR_ADDR = 0x640a,
    }
}

vmcs_write! {
    VmcsControl32: u32,
    VmcsControlNW: u64,
    VmcsGuest16: u16,
    VmcsGuest32: u32,
    VmcsGuest64: u64,
    VmcsGuestNW: u64,
    VmcsHost16: u16,
    VmcsHost32: u32,
    VmcsHost64: u64,
    VmcsHostNW: u64,
}

/// Returns `true` for the full (not high-half) encoding of a 64-bit field.
pub const fn is_64bit_field(field: u32) -> bool {
    (field >> 13) & 3 == 1 && field & 1 == 0
}

const fn split_access(field: u32) -> bool {
    cfg!(not(target_pointer_width = "64")) && is_64bit_field(field)
}

/// Turns a VMX instruction failure into an error naming the instruction and
/// its target.
pub(super) fn instruction_failed(cpu: &impl CpuOps, instruction: &'static str, target: u64, err: VmFail) -> HarnessError {
    let reason = match err {
        VmFail::VmFailValid => cpu
            .vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32)
            .map_or("Unknown error", instruction_error_str),
        VmFail::VmFailInvalid => "Invalid VMCS pointer",
    };
    HarnessError::VmxInstructionFailed {
        instruction,
        target,
        reason,
    }
}

fn vmread(cpu: &impl CpuOps, field: u32) -> Result<u64> {
    cpu.vmread(field)
        .map_err(|err| instruction_failed(cpu, "VMREAD", field as u64, err))
}

fn vmwrite(cpu: &impl CpuOps, field: u32, value: u64) -> Result {
    // SAFETY: the harness never points host-state fields anywhere the
    // trampoline does not expect.
    unsafe { cpu.vmwrite(field, value) }.map_err(|err| instruction_failed(cpu, "VMWRITE", field as u64, err))
}

/// Reads field `field` of the current VMCS.
pub fn read_field(cpu: &impl CpuOps, field: u32) -> Result<u64> {
    if split_access(field) {
        let low = vmread(cpu, field)?;
        let high = vmread(cpu, field + 1)?;
        Ok(low.get_bits(0..32) | (high << 32))
    } else {
        vmread(cpu, field)
    }
}

/// Writes field `field` of the current VMCS.
pub fn write_field(cpu: &impl CpuOps, field: u32, value: u64) -> Result {
    if split_access(field) {
        vmwrite(cpu, field, value.get_bits(0..32))?;
        vmwrite(cpu, field + 1, value.get_bits(32..64))
    } else {
        vmwrite(cpu, field, value)
    }
}

/// Makes the VMCS at `vmcs` current.
pub fn make_current(cpu: &impl CpuOps, vmcs: u64) -> Result {
    unsafe { cpu.vmptrld(vmcs) }.map_err(|err| instruction_failed(cpu, "VMPTRLD", vmcs, err))
}

/// Returns the current-VMCS pointer, `u64::MAX` if none.
pub fn read_current_pointer(cpu: &impl CpuOps) -> Result<u64> {
    cpu.vmptrst()
        .map_err(|err| instruction_failed(cpu, "VMPTRST", 0, err))
}

/// Clears the VMCS at `vmcs`, making it launchable again.
pub fn clear(cpu: &impl CpuOps, vmcs: u64) -> Result {
    unsafe { cpu.vmclear(vmcs) }.map_err(|err| instruction_failed(cpu, "VMCLEAR", vmcs, err))
}

/// Writes `set` into a control field, adjusted to what capability MSR `cap`
/// allows: bits clear in its low half are forced on, bits clear in its high
/// half are forced off.
///
/// Returns the value written.
pub fn set_control(cpu: &impl CpuOps, control: VmcsControl32, cap: Msr, set: u32) -> Result<u32> {
    let cap_value = cap.read(cpu);
    let allowed0 = cap_value.get_bits(0..32) as u32;
    let allowed1 = cap_value.get_bits(32..64) as u32;
    let value = (set | allowed0) & allowed1;
    if value & set != set {
        warn!(
            "{:?}: CPU does not allow bits {:#x} ({:?})",
            control,
            set & !value,
            cap
        );
    }
    control.write(cpu, value)?;
    Ok(value)
}

/// VM-exit information of the current VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    /// Set if the exit reports a failed VM entry.
    pub entry_failure: bool,
    /// Decoded basic exit reason, or the raw value if unnamed.
    pub exit_reason: core::result::Result<VmxExitReason, u32>,
    pub exit_qualification: u64,
    pub exit_instruction_length: u32,
    pub guest_rip: u64,
}

impl VmxExitInfo {
    pub fn read(cpu: &impl CpuOps) -> Result<Self> {
        let full_reason = VmcsReadOnly32::EXIT_REASON.read(cpu)?;
        Ok(Self {
            entry_failure: full_reason & VMX_EXIT_ENTRY_FAILURE != 0,
            exit_reason: full_reason.get_bits(0..16).try_into(),
            exit_qualification: VmcsReadOnlyNW::EXIT_QUALIFICATION.read(cpu)?,
            exit_instruction_length: VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read(cpu)?,
            guest_rip: VmcsGuestNW::RIP.read(cpu)?,
        })
    }
}

/// Exit controls, entry controls and processor-based controls the harness
/// sets (SDM Vol. 3C, chapter 25).
pub mod controls {
    pub use x86::vmx::vmcs::control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls};
}
