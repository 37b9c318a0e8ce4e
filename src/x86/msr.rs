use super::CpuOps;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Model-specific registers the harness touches.
pub enum Msr {
    IA32_FEATURE_CONTROL = 0x3a,

    IA32_SYSENTER_CS = 0x174,
    IA32_SYSENTER_ESP = 0x175,
    IA32_SYSENTER_EIP = 0x176,

    IA32_PAT = 0x277,

    IA32_VMX_BASIC = 0x480,
    IA32_VMX_PINBASED_CTLS = 0x481,
    IA32_VMX_PROCBASED_CTLS = 0x482,
    IA32_VMX_EXIT_CTLS = 0x483,
    IA32_VMX_ENTRY_CTLS = 0x484,
    IA32_VMX_MISC = 0x485,
    IA32_VMX_CR0_FIXED0 = 0x486,
    IA32_VMX_CR0_FIXED1 = 0x487,
    IA32_VMX_CR4_FIXED0 = 0x488,
    IA32_VMX_CR4_FIXED1 = 0x489,
    IA32_VMX_PROCBASED_CTLS2 = 0x48b,
    IA32_VMX_TRUE_PINBASED_CTLS = 0x48d,
    IA32_VMX_TRUE_PROCBASED_CTLS = 0x48e,
    IA32_VMX_TRUE_EXIT_CTLS = 0x48f,
    IA32_VMX_TRUE_ENTRY_CTLS = 0x490,

    IA32_EFER = 0xc000_0080,
    IA32_STAR = 0xc000_0081,
    IA32_LSTAR = 0xc000_0082,
    IA32_CSTAR = 0xc000_0083,
    IA32_FMASK = 0xc000_0084,

    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
    IA32_KERNEL_GSBASE = 0xc000_0102,

    /// AMD SVM control; bit 4 (SVMDIS) set means SVM is locked off.
    VM_CR = 0xc001_0114,
    /// Physical address of the host state-save area used by VMRUN.
    VM_HSAVE_PA = 0xc001_0117,
}
}

impl Msr {
    /// Reads this MSR through `cpu`. Unchecked: the MSR must exist.
    #[inline(always)]
    pub fn read(self, cpu: &impl CpuOps) -> u64 {
        cpu.read_msr(self)
    }

    /// Writes this MSR through `cpu`.
    ///
    /// # Safety
    ///
    /// The caller must ensure the write does not violate memory safety, e.g.
    /// by pointing a base register at unmapped memory.
    #[inline(always)]
    pub unsafe fn write(self, cpu: &impl CpuOps, value: u64) {
        unsafe { cpu.write_msr(self, value) }
    }
}
