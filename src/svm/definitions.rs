//! SVM intercept identifiers and #VMEXIT codes (AMD APM vol. 2, appendix C).

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Bit positions in the 160-bit intercept bitmap at the start of the VMCB.
///
/// Bits 0..96 cover CR/DR accesses and exceptions, bit 96 onwards the
/// instruction intercept vectors.
pub enum SvmIntercept {
    INTR = 96,
    NMI = 97,
    SMI = 98,
    INIT = 99,
    VINTR = 100,
    CR0_SEL_WRITE = 101,
    IDTR_READ = 102,
    GDTR_READ = 103,
    LDTR_READ = 104,
    TR_READ = 105,
    IDTR_WRITE = 106,
    GDTR_WRITE = 107,
    LDTR_WRITE = 108,
    TR_WRITE = 109,
    RDTSC = 110,
    RDPMC = 111,
    PUSHF = 112,
    POPF = 113,
    CPUID = 114,
    RSM = 115,
    IRET = 116,
    SWINT = 117,
    INVD = 118,
    PAUSE = 119,
    HLT = 120,
    INVLPG = 121,
    INVLPGA = 122,
    IOIO_PROT = 123,
    MSR_PROT = 124,
    TASK_SWITCH = 125,
    FERR_FREEZE = 126,
    SHUTDOWN = 127,
    VMRUN = 128,
    VMMCALL = 129,
    VMLOAD = 130,
    VMSAVE = 131,
    STGI = 132,
    CLGI = 133,
    SKINIT = 134,
    RDTSCP = 135,
    ICEBP = 136,
    WBINVD = 137,
    MONITOR = 138,
    MWAIT = 139,
    MWAIT_CONDITIONAL = 140,
    XSETBV = 141,
    RDPRU = 142,
    EFER_WRITE_TRAP = 143,
}
}

/// Number of intercept bits in the VMCB bitmap.
pub const SVM_INTERCEPT_MAX: u32 = 160;
/// Size of the intercept bitmap in bytes.
pub const SVM_INTERCEPT_BYTES: usize = (SVM_INTERCEPT_MAX / 8) as usize;

impl SvmIntercept {
    pub const fn id(self) -> u32 {
        self as u32
    }
}

numeric_enum_macro::numeric_enum! {
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// #VMEXIT codes the harness distinguishes.
pub enum SvmExitCode {
    EXCP_DE = 0x40,
    EXCP_UD = 0x46,
    EXCP_GP = 0x4d,
    EXCP_PF = 0x4e,
    INTR = 0x60,
    NMI = 0x61,
    CPUID = 0x72,
    HLT = 0x78,
    IOIO = 0x7b,
    MSR = 0x7c,
    SHUTDOWN = 0x7f,
    VMRUN = 0x80,
    VMMCALL = 0x81,
    VMLOAD = 0x82,
    VMSAVE = 0x83,
    STGI = 0x84,
    CLGI = 0x85,
    NPF = 0x400,
    /// The VMCB failed the consistency checks: the guest never ran.
    INVALID = 0xffff_ffff_ffff_ffff,
}
}
