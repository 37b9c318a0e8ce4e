//! The instruction interface.
//!
//! Every privileged instruction the harness executes goes through [`CpuOps`].
//! [`NativeCpu`] runs the real instructions; tests substitute an in-memory
//! model. All accessors are unchecked: callers verify feature support first.

use raw_cpuid::{CpuId, CpuIdReader, CpuIdResult};
use x86::vmx::VmFail;

use super::{GeneralRegisters, Msr};

/// Contents of a descriptor-table register (GDTR/IDTR).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TablePointer {
    pub limit: u16,
    pub base: u64,
}

/// Current values of all segment selector registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentSelectors {
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub ldtr: u16,
}

/// Narrow interface over the privileged instructions used by the harness.
pub trait CpuOps {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;

    fn read_msr(&self, msr: Msr) -> u64;
    /// # Safety
    ///
    /// Writing an MSR can change memory-safety-relevant CPU state.
    unsafe fn write_msr(&self, msr: Msr, value: u64);

    fn read_cr0(&self) -> u64;
    fn read_cr2(&self) -> u64;
    fn read_cr3(&self) -> u64;
    fn read_cr4(&self) -> u64;
    /// # Safety
    ///
    /// The new value must keep the current execution environment valid.
    unsafe fn write_cr0(&self, value: u64);
    /// # Safety
    ///
    /// See [`CpuOps::write_cr0`].
    unsafe fn write_cr4(&self, value: u64);

    fn segment_selectors(&self) -> SegmentSelectors;
    fn gdtr(&self) -> TablePointer;
    fn idtr(&self) -> TablePointer;

    /// # Safety
    ///
    /// Flushing a TLB entry is always sound; it is unsafe only because
    /// callers typically just edited live page tables.
    unsafe fn invlpg(&self, addr: u64);
    /// Executes one `hlt`, returning when the CPU is resumed.
    fn halt(&self);
    /// Halts and never returns.
    fn halt_forever(&self) -> !;

    /// Runs the nested SVM guest of `vmcb` until its next #VMEXIT.
    ///
    /// The outer context's VMLOAD/VMSAVE state is preserved in `host_vmcb`.
    /// All GPRs except RAX and RSP are exchanged through `regs`.
    ///
    /// # Safety
    ///
    /// Both blocks must be valid, page-aligned and identity-mapped, and SVM
    /// must be enabled.
    unsafe fn svm_vmrun(&self, vmcb: u64, host_vmcb: u64, regs: &mut GeneralRegisters);

    /// # Safety
    ///
    /// `region` must be an initialized VMXON region.
    unsafe fn vmxon(&self, region: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// Leaves VMX operation; no VMCS may be in use afterwards.
    unsafe fn vmxoff(&self) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// `vmcs` must point to a VMCS region.
    unsafe fn vmclear(&self, vmcs: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// `vmcs` must point to a VMCS region with a matching revision ID.
    unsafe fn vmptrld(&self, vmcs: u64) -> Result<(), VmFail>;
    fn vmptrst(&self) -> Result<u64, VmFail>;
    fn vmread(&self, field: u32) -> Result<u64, VmFail>;
    /// # Safety
    ///
    /// VMCS host-state fields control where the CPU resumes after a VM exit.
    unsafe fn vmwrite(&self, field: u32, value: u64) -> Result<(), VmFail>;
    /// Enters the current VMCS with VMLAUNCH (or VMRESUME if `resume`) and
    /// returns after the next VM exit.
    ///
    /// # Safety
    ///
    /// The current VMCS must be fully initialized.
    unsafe fn vmx_enter(&self, regs: &mut GeneralRegisters, resume: bool) -> Result<(), VmFail>;
}

/// Function a nested guest runs. Its return value is left in the nested
/// guest's RAX.
pub type NestedGuestMain = extern "C" fn() -> u64;

/// Feature queries for `cpu` through `raw-cpuid`.
pub fn cpu_features<C: CpuOps>(cpu: &C) -> CpuId<impl CpuIdReader + '_> {
    CpuId::with_cpuid_reader(move |leaf, subleaf| cpu.cpuid(leaf, subleaf))
}

#[cfg(target_arch = "x86_64")]
pub use self::native::{NativeCpu, nested_guest_entry_addr};

#[cfg(target_arch = "x86_64")]
mod native {
    use core::arch::{asm, global_asm};

    use raw_cpuid::CpuIdResult;
    use x86::bits64::vmx;
    use x86::dtables::{self, DescriptorTablePointer};
    use x86::vmx::VmFail;

    use super::{CpuOps, SegmentSelectors, TablePointer};
    use crate::x86::{GeneralRegisters, Msr};

    unsafe extern "C" {
        fn nested_guest_entry();
        fn nested_svm_vmrun(vmcb: u64, regs: *mut GeneralRegisters, host_vmcb: u64);
        fn nested_vmx_enter(regs: *mut GeneralRegisters, resume: u64) -> u64;
    }

    /// Address of the code a nested guest starts at: it calls the function in
    /// RAX and halts with its return value still in RAX.
    pub fn nested_guest_entry_addr() -> u64 {
        nested_guest_entry as *const () as u64
    }

    /// The CPU the code is running on.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NativeCpu;

    macro_rules! read_cr {
        ($name:ident, $cr:literal) => {
            fn $name(&self) -> u64 {
                let value: u64;
                unsafe {
                    asm!(concat!("mov {}, ", $cr), out(reg) value, options(nomem, nostack, preserves_flags));
                }
                value
            }
        };
    }

    macro_rules! write_cr {
        ($name:ident, $cr:literal) => {
            unsafe fn $name(&self, value: u64) {
                unsafe {
                    asm!(concat!("mov ", $cr, ", {}"), in(reg) value, options(nostack, preserves_flags));
                }
            }
        };
    }

    impl CpuOps for NativeCpu {
        fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
            raw_cpuid::cpuid!(leaf, subleaf)
        }

        fn read_msr(&self, msr: Msr) -> u64 {
            unsafe { x86::msr::rdmsr(msr as u32) }
        }

        unsafe fn write_msr(&self, msr: Msr, value: u64) {
            unsafe { x86::msr::wrmsr(msr as u32, value) }
        }

        read_cr!(read_cr0, "cr0");
        read_cr!(read_cr2, "cr2");
        read_cr!(read_cr3, "cr3");
        read_cr!(read_cr4, "cr4");
        write_cr!(write_cr0, "cr0");
        write_cr!(write_cr4, "cr4");

        fn segment_selectors(&self) -> SegmentSelectors {
            use x86::segmentation::{cs, ds, es, fs, gs, ss};

            let ldtr: u16;
            let tr: u16;
            unsafe {
                asm!(
                    "sldt {0:x}",
                    "str {1:x}",
                    out(reg) ldtr,
                    out(reg) tr,
                    options(nomem, nostack, preserves_flags),
                );
            }
            SegmentSelectors {
                es: es().bits(),
                cs: cs().bits(),
                ss: ss().bits(),
                ds: ds().bits(),
                fs: fs().bits(),
                gs: gs().bits(),
                tr,
                ldtr,
            }
        }

        fn gdtr(&self) -> TablePointer {
            let mut ptr = DescriptorTablePointer::<u64>::default();
            unsafe { dtables::sgdt(&mut ptr) };
            TablePointer {
                limit: ptr.limit,
                base: ptr.base as u64,
            }
        }

        fn idtr(&self) -> TablePointer {
            let mut ptr = DescriptorTablePointer::<u64>::default();
            unsafe { dtables::sidt(&mut ptr) };
            TablePointer {
                limit: ptr.limit,
                base: ptr.base as u64,
            }
        }

        unsafe fn invlpg(&self, addr: u64) {
            unsafe { x86::tlb::flush(addr as usize) }
        }

        fn halt(&self) {
            unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) }
        }

        fn halt_forever(&self) -> ! {
            loop {
                self.halt();
            }
        }

        unsafe fn svm_vmrun(&self, vmcb: u64, host_vmcb: u64, regs: &mut GeneralRegisters) {
            unsafe { nested_svm_vmrun(vmcb, regs, host_vmcb) }
        }

        unsafe fn vmxon(&self, region: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmxon(region) }
        }

        unsafe fn vmxoff(&self) -> Result<(), VmFail> {
            unsafe { vmx::vmxoff() }
        }

        unsafe fn vmclear(&self, vmcs: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmclear(vmcs) }
        }

        unsafe fn vmptrld(&self, vmcs: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmptrld(vmcs) }
        }

        fn vmptrst(&self) -> Result<u64, VmFail> {
            unsafe { vmx::vmptrst() }
        }

        fn vmread(&self, field: u32) -> Result<u64, VmFail> {
            unsafe { vmx::vmread(field) }
        }

        unsafe fn vmwrite(&self, field: u32, value: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmwrite(field, value) }
        }

        unsafe fn vmx_enter(&self, regs: &mut GeneralRegisters, resume: bool) -> Result<(), VmFail> {
            match unsafe { nested_vmx_enter(regs, resume as u64) } {
                0 => Ok(()),
                1 => Err(VmFail::VmFailInvalid),
                _ => Err(VmFail::VmFailValid),
            }
        }
    }

    // Nested guest entry: call the function in RAX, then halt. HLT is always
    // intercepted, so the halt is the nested guest's exit.
    global_asm!(
        ".pushsection .text.nested_guest_entry, \"ax\"",
        ".global nested_guest_entry",
        "nested_guest_entry:",
        "    call rax",
        ".Lnested_guest_halt:",
        "    hlt",
        "    jmp .Lnested_guest_halt",
        ".popsection",
    );

    // nested_svm_vmrun(vmcb: rdi, regs: rsi, host_vmcb: rdx)
    //
    // VMSAVE the outer hidden state into host_vmcb, VMLOAD the nested guest's,
    // VMRUN, then the reverse. Guest GPRs other than RAX/RSP go through regs.
    global_asm!(
        ".pushsection .text.nested_svm_vmrun, \"ax\"",
        ".global nested_svm_vmrun",
        "nested_svm_vmrun:",
        "    push rbx",
        "    push rbp",
        "    push r12",
        "    push r13",
        "    push r14",
        "    push r15",
        "    push rsi",
        "    push rdx",
        "    push rdi",
        "    mov rax, rdx",
        "    vmsave rax",
        "    mov rax, [rsp]",
        "    vmload rax",
        "    clgi",
        "    mov rbx, [rsi + 0x18]",
        "    mov rcx, [rsi + 0x08]",
        "    mov rdx, [rsi + 0x10]",
        "    mov rbp, [rsi + 0x28]",
        "    mov rdi, [rsi + 0x38]",
        "    mov r8, [rsi + 0x40]",
        "    mov r9, [rsi + 0x48]",
        "    mov r10, [rsi + 0x50]",
        "    mov r11, [rsi + 0x58]",
        "    mov r12, [rsi + 0x60]",
        "    mov r13, [rsi + 0x68]",
        "    mov r14, [rsi + 0x70]",
        "    mov r15, [rsi + 0x78]",
        "    mov rsi, [rsi + 0x30]",
        "    mov rax, [rsp]",
        "    vmrun rax",
        "    push rsi",
        "    mov rsi, [rsp + 0x18]",
        "    mov [rsi + 0x18], rbx",
        "    mov [rsi + 0x08], rcx",
        "    mov [rsi + 0x10], rdx",
        "    mov [rsi + 0x28], rbp",
        "    mov [rsi + 0x38], rdi",
        "    mov [rsi + 0x40], r8",
        "    mov [rsi + 0x48], r9",
        "    mov [rsi + 0x50], r10",
        "    mov [rsi + 0x58], r11",
        "    mov [rsi + 0x60], r12",
        "    mov [rsi + 0x68], r13",
        "    mov [rsi + 0x70], r14",
        "    mov [rsi + 0x78], r15",
        "    pop rax",
        "    mov [rsi + 0x30], rax",
        "    mov rax, [rsp]",
        "    vmsave rax",
        "    mov rax, [rsp + 0x08]",
        "    vmload rax",
        "    stgi",
        "    add rsp, 0x18",
        "    pop r15",
        "    pop r14",
        "    pop r13",
        "    pop r12",
        "    pop rbp",
        "    pop rbx",
        "    ret",
        ".popsection",
    );

    // nested_vmx_enter(regs: rdi, resume: rsi) -> 0 on VM exit,
    // 1 on VMfailInvalid, 2 on VMfailValid.
    //
    // HOST_RSP/HOST_RIP are pointed at this frame so the VM exit lands on
    // .Lnested_vmx_exit with the regs pointer on top of the stack.
    global_asm!(
        ".pushsection .text.nested_vmx_enter, \"ax\"",
        ".global nested_vmx_enter",
        "nested_vmx_enter:",
        "    push rbx",
        "    push rbp",
        "    push r12",
        "    push r13",
        "    push r14",
        "    push r15",
        "    push rdi",
        "    mov rdx, 0x6c14",
        "    vmwrite rdx, rsp",
        "    lea rax, [rip + .Lnested_vmx_exit]",
        "    mov rdx, 0x6c16",
        "    vmwrite rdx, rax",
        "    cmp rsi, 0",
        "    mov rax, [rdi + 0x00]",
        "    mov rcx, [rdi + 0x08]",
        "    mov rdx, [rdi + 0x10]",
        "    mov rbx, [rdi + 0x18]",
        "    mov rbp, [rdi + 0x28]",
        "    mov rsi, [rdi + 0x30]",
        "    mov r8, [rdi + 0x40]",
        "    mov r9, [rdi + 0x48]",
        "    mov r10, [rdi + 0x50]",
        "    mov r11, [rdi + 0x58]",
        "    mov r12, [rdi + 0x60]",
        "    mov r13, [rdi + 0x68]",
        "    mov r14, [rdi + 0x70]",
        "    mov r15, [rdi + 0x78]",
        "    mov rdi, [rdi + 0x38]",
        "    jne .Lnested_vmx_resume",
        "    vmlaunch",
        "    jmp .Lnested_vmx_failed",
        ".Lnested_vmx_resume:",
        "    vmresume",
        ".Lnested_vmx_failed:",
        "    mov eax, 1",
        "    jc .Lnested_vmx_return",
        "    mov eax, 2",
        ".Lnested_vmx_return:",
        "    add rsp, 8",
        "    pop r15",
        "    pop r14",
        "    pop r13",
        "    pop r12",
        "    pop rbp",
        "    pop rbx",
        "    ret",
        ".Lnested_vmx_exit:",
        "    push rdi",
        "    mov rdi, [rsp + 8]",
        "    mov [rdi + 0x00], rax",
        "    mov [rdi + 0x08], rcx",
        "    mov [rdi + 0x10], rdx",
        "    mov [rdi + 0x18], rbx",
        "    mov [rdi + 0x28], rbp",
        "    mov [rdi + 0x30], rsi",
        "    mov [rdi + 0x40], r8",
        "    mov [rdi + 0x48], r9",
        "    mov [rdi + 0x50], r10",
        "    mov [rdi + 0x58], r11",
        "    mov [rdi + 0x60], r12",
        "    mov [rdi + 0x68], r13",
        "    mov [rdi + 0x70], r14",
        "    mov [rdi + 0x78], r15",
        "    pop rax",
        "    mov [rdi + 0x38], rax",
        "    add rsp, 8",
        "    pop r15",
        "    pop r14",
        "    pop r13",
        "    pop r12",
        "    pop rbp",
        "    pop rbx",
        "    xor eax, eax",
        "    ret",
        ".popsection",
    );
}
