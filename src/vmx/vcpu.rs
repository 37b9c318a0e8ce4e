use super::structs::{VmxBasic, VmxRegion};
use super::vmcs::controls::{EntryControls, ExitControls, PinbasedControls, PrimaryControls};
use super::vmcs::{
    self, VmcsControl32, VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmcsHost16, VmcsHost32,
    VmcsHost64, VmcsHostNW, VmcsReadOnly32, VmxExitInfo, instruction_failed,
};
use crate::error::{HarnessError, Result};
use crate::guest::{BumpHeap, nested_stack};
use crate::x86::{
    CpuOps, DescriptorMode, DescriptorTable, EferFlags, GeneralRegisters, Msr, SYSTEM_TYPE_TSS_BUSY,
    nested_guest_entry_addr,
};

/// Interrupts enabled, plus the always-one bit 1.
const NESTED_RFLAGS: u64 = 0x202;
/// Access-rights value of an unusable segment register.
const VMX_AR_UNUSABLE: u32 = 1 << 16;

/// A nested VMX guest: its VMCS, launch state and the GPRs exchanged with it.
///
/// The first [`VmxVcpu::run`] uses VMLAUNCH, later ones VMRESUME.
#[derive(Debug)]
pub struct VmxVcpu<'a> {
    vmcs: VmxRegion<'a>,
    launched: bool,
    /// Guest GPRs other than RSP.
    pub regs: GeneralRegisters,
}

impl<'a> VmxVcpu<'a> {
    /// Builds a nested guest that runs `guest_main` on a copy of the current
    /// CPU state. VMX must be on.
    ///
    /// With `alloc_stack` the guest gets its own stack and stack segment;
    /// otherwise it inherits SS and starts with RSP 0.
    pub fn create(
        cpu: &impl CpuOps,
        heap: &mut BumpHeap<'a>,
        revision_id: u32,
        guest_main: u64,
        alloc_stack: bool,
    ) -> Result<Self> {
        // SAFETY: the GDTR points at the live GDT, which nothing else holds
        // a reference to while the vCPU is built.
        let mut gdt = unsafe { DescriptorTable::from_pointer(cpu.gdtr(), DescriptorMode::NATIVE) };
        let (ss, rsp) = nested_stack(cpu, heap, &mut gdt, alloc_stack)?;

        let vcpu = Self {
            vmcs: VmxRegion::new(heap, revision_id)?,
            launched: false,
            regs: GeneralRegisters {
                rax: guest_main,
                ..Default::default()
            },
        };
        vcpu.init_nested_vcpu(cpu, &gdt, ss, rsp)?;
        debug!("created VMX vCPU, VMCS @ {:#x}", vcpu.vmcs.addr());
        Ok(vcpu)
    }

    pub fn vmcs(&self) -> &VmxRegion<'a> {
        &self.vmcs
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    /// Initializes the VMCS from the running CPU. The VMCS that was current
    /// before the call is current again afterwards.
    fn init_nested_vcpu(&self, cpu: &impl CpuOps, gdt: &DescriptorTable, ss: u16, rsp: u64) -> Result {
        let prev = vmcs::read_current_pointer(cpu)?;
        vmcs::clear(cpu, self.vmcs.addr())?;
        vmcs::make_current(cpu, self.vmcs.addr())?;

        let res = self.setup_vmcs_control(cpu).and_then(|_| self.setup_vmcs_guest(cpu, gdt, ss, rsp));
        if prev != u64::MAX {
            vmcs::make_current(cpu, prev)?;
        }
        res
    }

    fn setup_vmcs_control(&self, cpu: &impl CpuOps) -> Result {
        // The TRUE capability MSRs also report which default-1 controls may be
        // cleared.
        let (pin_msr, proc_msr, exit_msr, entry_msr) = if VmxBasic::read(cpu).vmx_flex_controls {
            (
                Msr::IA32_VMX_TRUE_PINBASED_CTLS,
                Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
                Msr::IA32_VMX_TRUE_EXIT_CTLS,
                Msr::IA32_VMX_TRUE_ENTRY_CTLS,
            )
        } else {
            (
                Msr::IA32_VMX_PINBASED_CTLS,
                Msr::IA32_VMX_PROCBASED_CTLS,
                Msr::IA32_VMX_EXIT_CTLS,
                Msr::IA32_VMX_ENTRY_CTLS,
            )
        };

        vmcs::set_control(cpu, VmcsControl32::PINBASED_EXEC_CONTROLS, pin_msr, PinbasedControls::empty().bits())?;

        let procbased = vmcs::set_control(
            cpu,
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            proc_msr,
            PrimaryControls::HLT_EXITING.bits(),
        )?;
        if procbased & PrimaryControls::HLT_EXITING.bits() == 0 {
            return Err(HarnessError::Unsupported("CPU does not allow HLT exiting"));
        }

        // Switch IA32_PAT/IA32_EFER on entry and exit; stay in 64-bit mode on
        // both sides if the outer context is.
        let mut exit = ExitControls::SAVE_IA32_PAT
            | ExitControls::LOAD_IA32_PAT
            | ExitControls::SAVE_IA32_EFER
            | ExitControls::LOAD_IA32_EFER;
        let mut entry = EntryControls::LOAD_IA32_PAT | EntryControls::LOAD_IA32_EFER;
        if EferFlags::from_bits_truncate(Msr::IA32_EFER.read(cpu)).contains(EferFlags::LONG_MODE_ACTIVE) {
            exit |= ExitControls::HOST_ADDRESS_SPACE_SIZE;
            entry |= EntryControls::IA32E_MODE_GUEST;
        }
        vmcs::set_control(cpu, VmcsControl32::VMEXIT_CONTROLS, exit_msr, exit.bits())?;
        vmcs::set_control(cpu, VmcsControl32::VMENTRY_CONTROLS, entry_msr, entry.bits())?;

        VmcsControl32::EXCEPTION_BITMAP.write(cpu, 0)?;
        VmcsControl32::VMEXIT_MSR_STORE_COUNT.write(cpu, 0)?;
        VmcsControl32::VMEXIT_MSR_LOAD_COUNT.write(cpu, 0)?;
        VmcsControl32::VMENTRY_MSR_LOAD_COUNT.write(cpu, 0)?;
        VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write(cpu, 0)?;
        Ok(())
    }

    fn setup_vmcs_guest(&self, cpu: &impl CpuOps, gdt: &DescriptorTable, ss: u16, rsp: u64) -> Result {
        macro_rules! set_guest_segment {
            ($selector: expr, $reg: ident) => {
                set_guest_segment!($selector, $reg, |ar: u32| ar)
            };
            ($selector: expr, $reg: ident, $fixup: expr) => {{
                let selector: u16 = $selector;
                let desc = gdt.descriptor((selector >> 3) as usize)?;
                let access_rights = if selector & !0x7 == 0 || !desc.is_present() {
                    VMX_AR_UNUSABLE
                } else {
                    $fixup(desc.flags.vmx_access_rights())
                };
                paste::paste! {
                    VmcsGuest16::[<$reg _SELECTOR>].write(cpu, selector)?;
                    VmcsGuestNW::[<$reg _BASE>].write(cpu, desc.base)?;
                    VmcsGuest32::[<$reg _LIMIT>].write(cpu, desc.limit)?;
                    VmcsGuest32::[<$reg _ACCESS_RIGHTS>].write(cpu, access_rights)?;
                }
            }};
        }

        let sel = cpu.segment_selectors();
        set_guest_segment!(sel.es, ES);
        set_guest_segment!(sel.cs, CS);
        set_guest_segment!(ss, SS);
        set_guest_segment!(sel.ds, DS);
        set_guest_segment!(sel.fs, FS);
        set_guest_segment!(sel.gs, GS);
        // VM entry requires a busy TSS even if the GDT copy was never loaded
        // with LTR.
        set_guest_segment!(sel.tr, TR, |ar: u32| (ar & !0xf) | SYSTEM_TYPE_TSS_BUSY as u32);
        set_guest_segment!(sel.ldtr, LDTR);

        // In 64-bit mode the FS/GS bases live in MSRs, not in the GDT.
        VmcsGuestNW::FS_BASE.write(cpu, Msr::IA32_FS_BASE.read(cpu))?;
        VmcsGuestNW::GS_BASE.write(cpu, Msr::IA32_GS_BASE.read(cpu))?;

        let gdtr = cpu.gdtr();
        let idtr = cpu.idtr();
        VmcsGuestNW::GDTR_BASE.write(cpu, gdtr.base)?;
        VmcsGuest32::GDTR_LIMIT.write(cpu, gdtr.limit as u32)?;
        VmcsGuestNW::IDTR_BASE.write(cpu, idtr.base)?;
        VmcsGuest32::IDTR_LIMIT.write(cpu, idtr.limit as u32)?;

        // Control registers with the bits VMX operation fixes forced.
        let cr0 = (cpu.read_cr0() | Msr::IA32_VMX_CR0_FIXED0.read(cpu)) & Msr::IA32_VMX_CR0_FIXED1.read(cpu);
        let cr4 = (cpu.read_cr4() | Msr::IA32_VMX_CR4_FIXED0.read(cpu)) & Msr::IA32_VMX_CR4_FIXED1.read(cpu);
        VmcsGuestNW::CR0.write(cpu, cr0)?;
        VmcsGuestNW::CR3.write(cpu, cpu.read_cr3())?;
        VmcsGuestNW::CR4.write(cpu, cr4)?;

        VmcsGuestNW::RSP.write(cpu, rsp)?;
        VmcsGuestNW::RIP.write(cpu, nested_guest_entry_addr())?;
        VmcsGuestNW::RFLAGS.write(cpu, NESTED_RFLAGS)?;
        VmcsGuestNW::DR7.write(cpu, 0x400)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write(cpu, 0)?;

        VmcsGuest32::IA32_SYSENTER_CS.write(cpu, Msr::IA32_SYSENTER_CS.read(cpu) as u32)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write(cpu, Msr::IA32_SYSENTER_ESP.read(cpu))?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write(cpu, Msr::IA32_SYSENTER_EIP.read(cpu))?;

        VmcsGuest32::ACTIVITY_STATE.write(cpu, 0)?;
        VmcsGuest32::INTERRUPTIBILITY_STATE.write(cpu, 0)?;

        VmcsGuest64::LINK_PTR.write(cpu, u64::MAX)?; // SDM Vol. 3C, Section 24.4.2
        VmcsGuest64::IA32_DEBUGCTL.write(cpu, 0)?;
        VmcsGuest64::IA32_PAT.write(cpu, Msr::IA32_PAT.read(cpu))?;
        VmcsGuest64::IA32_EFER.write(cpu, Msr::IA32_EFER.read(cpu))?;
        Ok(())
    }

    /// Makes this VMCS current and points its host-state fields at the
    /// running context. Host RSP and RIP are filled in by the entry
    /// trampoline.
    pub fn activate(&self, cpu: &impl CpuOps) -> Result {
        vmcs::make_current(cpu, self.vmcs.addr())?;

        // Host selectors must have RPL and TI clear.
        let sel = cpu.segment_selectors();
        VmcsHost16::ES_SELECTOR.write(cpu, sel.es & !0x7)?;
        VmcsHost16::CS_SELECTOR.write(cpu, sel.cs & !0x7)?;
        VmcsHost16::SS_SELECTOR.write(cpu, sel.ss & !0x7)?;
        VmcsHost16::DS_SELECTOR.write(cpu, sel.ds & !0x7)?;
        VmcsHost16::FS_SELECTOR.write(cpu, sel.fs & !0x7)?;
        VmcsHost16::GS_SELECTOR.write(cpu, sel.gs & !0x7)?;
        VmcsHost16::TR_SELECTOR.write(cpu, sel.tr & !0x7)?;

        VmcsHostNW::CR0.write(cpu, cpu.read_cr0())?;
        VmcsHostNW::CR3.write(cpu, cpu.read_cr3())?;
        VmcsHostNW::CR4.write(cpu, cpu.read_cr4())?;

        let gdtr = cpu.gdtr();
        // SAFETY: the GDT is only read here.
        let gdt = unsafe { DescriptorTable::from_pointer(gdtr, DescriptorMode::NATIVE) };
        let tr_base = gdt.descriptor((sel.tr >> 3) as usize)?.base;
        VmcsHostNW::FS_BASE.write(cpu, Msr::IA32_FS_BASE.read(cpu))?;
        VmcsHostNW::GS_BASE.write(cpu, Msr::IA32_GS_BASE.read(cpu))?;
        VmcsHostNW::TR_BASE.write(cpu, tr_base)?;
        VmcsHostNW::GDTR_BASE.write(cpu, gdtr.base)?;
        VmcsHostNW::IDTR_BASE.write(cpu, cpu.idtr().base)?;

        VmcsHost32::IA32_SYSENTER_CS.write(cpu, Msr::IA32_SYSENTER_CS.read(cpu) as u32)?;
        VmcsHostNW::IA32_SYSENTER_ESP.write(cpu, Msr::IA32_SYSENTER_ESP.read(cpu))?;
        VmcsHostNW::IA32_SYSENTER_EIP.write(cpu, Msr::IA32_SYSENTER_EIP.read(cpu))?;
        VmcsHost64::IA32_PAT.write(cpu, Msr::IA32_PAT.read(cpu))?;
        VmcsHost64::IA32_EFER.write(cpu, Msr::IA32_EFER.read(cpu))?;
        Ok(())
    }

    /// Runs the nested guest until its next VM exit.
    pub fn run(&mut self, cpu: &impl CpuOps) -> Result<VmxExitInfo> {
        self.activate(cpu)?;

        let instruction = if self.launched { "VMRESUME" } else { "VMLAUNCH" };
        // SAFETY: the VMCS was initialized by `init_nested_vcpu` and its host
        // state by `activate`.
        unsafe { cpu.vmx_enter(&mut self.regs, self.launched) }
            .map_err(|err| instruction_failed(cpu, instruction, self.vmcs.addr(), err))?;

        let info = VmxExitInfo::read(cpu)?;
        trace!("VMX VM exit {:?} at {:#x}", info.exit_reason, info.guest_rip);
        if info.entry_failure {
            return Err(HarnessError::NestedEntryFailed {
                reason: VmcsReadOnly32::EXIT_REASON.read(cpu)? as u64,
                qualification: info.exit_qualification,
            });
        }
        self.launched = true;
        Ok(info)
    }
}
