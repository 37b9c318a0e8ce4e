use tock_registers::interfaces::{Readable, Writeable};

use super::definitions::{SvmExitCode, SvmIntercept};
use super::vmcb::{SvmExitInfo, VmcbSegment, VmcbStruct};
use crate::error::{HarnessError, Result};
use crate::guest::{BumpHeap, nested_stack};
use crate::x86::{CpuOps, DescriptorMode, DescriptorTable, GeneralRegisters, Msr, nested_guest_entry_addr};
use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// Interrupts enabled, plus the always-one bit 1.
const NESTED_RFLAGS: u64 = 0x202;
/// Address space ID of nested guests. ASID 0 belongs to the host.
const NESTED_ASID: u32 = 1;

/// A nested SVM guest: its control block and the GPRs exchanged with it.
pub struct SvmVcpu<'a> {
    vmcb: &'a mut VmcbStruct,
    /// Guest GPRs. RAX is mirrored into the VMCB around each run.
    pub regs: GeneralRegisters,
}

impl<'a> SvmVcpu<'a> {
    /// Builds a nested guest that runs `guest_main` on a copy of the current
    /// CPU state.
    ///
    /// With `alloc_stack` the guest gets its own stack and stack segment;
    /// otherwise it inherits SS and starts with RSP 0.
    pub fn create(cpu: &impl CpuOps, heap: &mut BumpHeap<'a>, guest_main: u64, alloc_stack: bool) -> Result<Self> {
        // SAFETY: the GDTR points at the live GDT, which nothing else holds
        // a reference to while the vCPU is built.
        let mut gdt = unsafe { DescriptorTable::from_pointer(cpu.gdtr(), DescriptorMode::NATIVE) };
        let (ss, rsp) = nested_stack(cpu, heap, &mut gdt, alloc_stack)?;

        // SAFETY: a zeroed VMCB is valid.
        let vmcb = unsafe { heap.alloc_struct::<VmcbStruct>(PAGE_SIZE)? };
        init_guest_vmcb(cpu, &gdt, vmcb, ss, rsp)?;

        let regs = GeneralRegisters {
            rax: guest_main,
            ..Default::default()
        };
        debug!("created SVM vCPU, VMCB @ {:#x}", vmcb.addr());
        Ok(Self { vmcb, regs })
    }

    pub fn vmcb(&self) -> &VmcbStruct {
        self.vmcb
    }

    /// Sets or clears one intercept of this vCPU.
    pub fn set_intercept(&mut self, id: u32, enabled: bool) -> Result {
        self.vmcb.control.set_intercept(id, enabled)
    }

    /// Runs the nested guest until its next #VMEXIT.
    ///
    /// `host_vmcb` receives the outer context's VMLOAD/VMSAVE state for the
    /// duration of the run.
    pub fn run(&mut self, cpu: &impl CpuOps, host_vmcb: &VmcbStruct) -> Result<SvmExitInfo> {
        self.vmcb.state.rax.set(self.regs.rax);
        // SAFETY: both blocks are page-aligned, identity-mapped heap pages
        // and SVM is enabled (`host_vmcb` only exists once it is).
        unsafe { cpu.svm_vmrun(self.vmcb.addr(), host_vmcb.addr(), &mut self.regs) };
        self.regs.rax = self.vmcb.state.rax.get();

        let info = self.vmcb.exit_info();
        trace!("SVM #VMEXIT {:x?} at {:#x}", info.exit_code, info.guest_rip);
        if info.exit_code == Ok(SvmExitCode::INVALID) {
            return Err(HarnessError::NestedEntryFailed {
                reason: self.vmcb.control.exit_code.get(),
                qualification: info.exit_info_1,
            });
        }
        Ok(info)
    }
}

fn copy_segment(gdt: &DescriptorTable, field: &VmcbSegment, selector: u16) -> Result {
    let index = (selector >> 3) as usize;
    let desc = gdt.descriptor(index)?;
    field.load_descriptor((index << 3) as u16, &desc);
    Ok(())
}

/// Fills the state-save area from the running CPU and points RIP at the
/// nested entry trampoline.
fn init_guest_vmcb(cpu: &impl CpuOps, gdt: &DescriptorTable, vmcb: &VmcbStruct, ss: u16, rsp: u64) -> Result {
    let control = &vmcb.control;
    control.set_intercept(SvmIntercept::VMRUN.id(), true)?;
    control.set_intercept(SvmIntercept::HLT.id(), true)?;
    control.guest_asid.set(NESTED_ASID);

    let state = &vmcb.state;
    let sel = cpu.segment_selectors();
    copy_segment(gdt, &state.es, sel.es)?;
    copy_segment(gdt, &state.cs, sel.cs)?;
    copy_segment(gdt, &state.ss, ss)?;
    copy_segment(gdt, &state.ds, sel.ds)?;
    copy_segment(gdt, &state.fs, sel.fs)?;
    copy_segment(gdt, &state.gs, sel.gs)?;

    let gdtr = cpu.gdtr();
    let idtr = cpu.idtr();
    state.gdtr.set_table(gdtr.base, gdtr.limit);
    state.idtr.set_table(idtr.base, idtr.limit);

    state.efer.set(Msr::IA32_EFER.read(cpu));
    state.cr0.set(cpu.read_cr0());
    state.cr3.set(cpu.read_cr3());
    state.cr4.set(cpu.read_cr4());
    state.g_pat.set(Msr::IA32_PAT.read(cpu));

    state.rip.set(nested_guest_entry_addr());
    state.rsp.set(rsp);
    state.rflags.set(NESTED_RFLAGS);
    Ok(())
}
