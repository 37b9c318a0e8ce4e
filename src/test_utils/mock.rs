//! In-memory CPU model for unit tests.
//!
//! `MockCpu` keeps MSRs, control registers, CPUID leaves and a real GDT in
//! memory, and emulates just enough of SVM and VMX to run a nested guest
//! function synchronously.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use raw_cpuid::CpuIdResult;
use x86::vmx::VmFail;

use crate::guest::BumpHeap;
use crate::layout::{CODE64_SELECTOR, DATA_SELECTOR, GDT_ENTRIES, TSS_ADDR, TSS_SELECTOR};
use crate::x86::{
    CpuOps, DescriptorMode, DescriptorTable, GeneralRegisters, Msr, SegmentFlags, SegmentSelectors,
    TablePointer, nested_guest_entry_addr,
};

const CR0_DEFAULT: u64 = 0x8005_0033;
const CR3_DEFAULT: u64 = 0x5000;
/// PAE | PGE | OSFXSR.
const CR4_DEFAULT: u64 = 0x2a0;
/// SCE | LME | LMA | NXE.
const EFER_DEFAULT: u64 = 0xd01;
const EFER_SVME: u64 = 1 << 12;
const CR4_VMXE: u64 = 1 << 13;
const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;

pub const MOCK_VMCS_REVISION: u32 = 0x12;
pub const IDT_LIMIT: u16 = 0xfff;

const VMCS_INSTRUCTION_ERROR: u32 = 0x4400;
const VMCS_EXIT_REASON: u32 = 0x4402;
const VMCS_EXIT_INSTRUCTION_LEN: u32 = 0x440c;
const VMCS_EXIT_QUALIFICATION: u32 = 0x6400;
const VMCS_GUEST_RIP: u32 = 0x681e;
const VMX_EXIT_HLT: u64 = 12;
const VMX_ENTRY_FAILURE: u64 = 1 << 31;

/// Panic payload of [`MockCpu::halt_forever`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltedForever;

/// Runs `f`, which must end in a permanent halt, and returns the halt.
pub fn catch_halt<R>(f: impl FnOnce() -> R) -> HaltedForever {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("expected the CPU to halt forever"),
        Err(payload) => match payload.downcast::<HaltedForever>() {
            Ok(halted) => *halted,
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[repr(C, align(4096))]
#[derive(Clone)]
struct Page([u8; 4096]);

/// Page-aligned memory standing in for the guest heap arena.
pub struct TestArena {
    pages: Vec<Page>,
}

impl TestArena {
    pub fn new(pages: usize) -> Self {
        Self {
            pages: vec![Page([0; 4096]); pages],
        }
    }

    pub fn heap(&mut self) -> BumpHeap<'_> {
        let len = self.pages.len() * 4096;
        // SAFETY: the pages are one contiguous allocation borrowed mutably for
        // the lifetime of the heap.
        let bytes = unsafe { core::slice::from_raw_parts_mut(self.pages.as_mut_ptr().cast::<u8>(), len) };
        BumpHeap::new(bytes)
    }
}

/// An operation the nested SVM guest performs before calling its main
/// function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedOp {
    Vmload(u64),
    Vmsave(u64),
}

#[derive(Debug, Default)]
struct MockVmcs {
    launched: bool,
    fields: HashMap<u32, u64>,
}

/// In-memory implementation of [`CpuOps`].
pub struct MockCpu {
    cpuid: HashMap<u32, CpuIdResult>,
    msrs: RefCell<HashMap<u32, u64>>,
    cr0: Cell<u64>,
    cr2: Cell<u64>,
    cr3: Cell<u64>,
    cr4: Cell<u64>,
    selectors: Cell<SegmentSelectors>,
    gdt: Box<[Cell<u64>; GDT_ENTRIES]>,
    idt: Box<[Cell<u64>; 512]>,
    halts: Cell<usize>,
    on_halt: RefCell<Option<Box<dyn FnMut()>>>,
    invlpgs: RefCell<Vec<u64>>,

    // SVM
    hidden: RefCell<crate_svm::HiddenState>,
    nested_ops: RefCell<Vec<NestedOp>>,
    vmruns: Cell<usize>,

    // VMX
    vmxon_region: Cell<Option<u64>>,
    vmcs: RefCell<HashMap<u64, MockVmcs>>,
    current_vmcs: Cell<Option<u64>>,
    entry_failure: Cell<Option<(u64, u64)>>,
}

#[cfg(feature = "svm")]
mod crate_svm {
    pub type HiddenState = crate::svm::VmLoadSaveStates;
}

#[cfg(not(feature = "svm"))]
mod crate_svm {
    pub type HiddenState = ();
}

fn leaf(eax: u32, ebx: u32, ecx: u32, edx: u32) -> CpuIdResult {
    CpuIdResult { eax, ebx, ecx, edx }
}

impl MockCpu {
    /// A long-mode CPU with neither SVM nor VMX.
    pub fn new() -> Self {
        let mut entries = [0u64; GDT_ENTRIES];
        let mut gdt = DescriptorTable::new(&mut entries, DescriptorMode::NATIVE);
        let init = [
            (CODE64_SELECTOR, 0, 0xfffff, SegmentFlags::CODE64),
            (DATA_SELECTOR, 0, 0xfffff, SegmentFlags::DATA),
            (TSS_SELECTOR, TSS_ADDR, 0x67, SegmentFlags::TSS64),
        ];
        for (selector, base, limit, flags) in init {
            gdt.set_descriptor((selector >> 3) as usize, base, limit, flags)
                .unwrap();
        }

        let mut msrs = HashMap::new();
        msrs.insert(Msr::IA32_EFER as u32, EFER_DEFAULT);
        msrs.insert(Msr::IA32_PAT as u32, PAT_DEFAULT);

        let mut cpuid = HashMap::new();
        cpuid.insert(0, leaf(0xd, 0, 0, 0));
        cpuid.insert(1, leaf(0x000a_0655, 0, 0, 0));
        cpuid.insert(0x8000_0000, leaf(0x8000_0008, 0, 0, 0));
        cpuid.insert(0x8000_0001, leaf(0, 0, 0, 1 << 29));

        Self {
            cpuid,
            msrs: RefCell::new(msrs),
            cr0: Cell::new(CR0_DEFAULT),
            cr2: Cell::new(0),
            cr3: Cell::new(CR3_DEFAULT),
            cr4: Cell::new(CR4_DEFAULT),
            selectors: Cell::new(SegmentSelectors {
                es: DATA_SELECTOR,
                cs: CODE64_SELECTOR,
                ss: DATA_SELECTOR,
                ds: DATA_SELECTOR,
                fs: DATA_SELECTOR,
                gs: DATA_SELECTOR,
                tr: TSS_SELECTOR,
                ldtr: 0,
            }),
            gdt: Box::new(entries.map(Cell::new)),
            idt: Box::new([const { Cell::new(0) }; 512]),
            halts: Cell::new(0),
            on_halt: RefCell::new(None),
            invlpgs: RefCell::new(Vec::new()),
            hidden: RefCell::new(Default::default()),
            nested_ops: RefCell::new(Vec::new()),
            vmruns: Cell::new(0),
            vmxon_region: Cell::new(None),
            vmcs: RefCell::new(HashMap::new()),
            current_vmcs: Cell::new(None),
            entry_failure: Cell::new(None),
        }
    }

    /// An AMD CPU advertising SVM.
    pub fn new_amd() -> Self {
        let mut cpu = Self::new();
        // "AuthenticAMD"
        cpu.cpuid.insert(0, leaf(0xd, 0x6874_7541, 0x444d_4163, 0x6974_6e65));
        cpu.cpuid.insert(0x8000_0001, leaf(0, 0, 1 << 2, 1 << 29));
        cpu
    }

    /// An Intel CPU advertising VMX, with TRUE control MSRs.
    pub fn new_intel() -> Self {
        let mut cpu = Self::new();
        // "GenuineIntel"
        cpu.cpuid.insert(0, leaf(0xd, 0x756e_6547, 0x6c65_746e, 0x4965_6e69));
        cpu.cpuid.insert(1, leaf(0x000a_0655, 0, 1 << 5, 0));
        for (msr, value) in [
            // Revision, 4 KiB regions, write-back, I/O exit info, TRUE controls.
            (
                Msr::IA32_VMX_BASIC,
                MOCK_VMCS_REVISION as u64 | (0x1000u64 << 32) | (6u64 << 50) | (1u64 << 54) | (1u64 << 55),
            ),
            (Msr::IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (Msr::IA32_VMX_EXIT_CTLS, 0x00ff_ffff_0003_6dff),
            (Msr::IA32_VMX_ENTRY_CTLS, 0x0000_f3ff_0000_11ff),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, 0x00ff_ffff_0003_6dfb),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0000_f3ff_0000_11fb),
            (Msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (Msr::IA32_VMX_CR4_FIXED1, 0x0037_67ff),
        ] {
            cpu.set_msr(msr, value);
        }
        cpu
    }

    pub fn msr(&self, msr: Msr) -> u64 {
        self.msrs.borrow().get(&(msr as u32)).copied().unwrap_or(0)
    }

    pub fn set_msr(&self, msr: Msr, value: u64) {
        self.msrs.borrow_mut().insert(msr as u32, value);
    }

    pub fn set_cr2(&self, value: u64) {
        self.cr2.set(value);
    }

    pub fn set_selectors(&self, selectors: SegmentSelectors) {
        self.selectors.set(selectors);
    }

    pub fn gdt_entry(&self, index: usize) -> u64 {
        self.gdt[index].get()
    }

    /// Number of `hlt` executions that returned.
    pub fn halt_count(&self) -> usize {
        self.halts.get()
    }

    /// Runs `hook` on every `hlt` that returns, as the host would while the
    /// guest is stopped.
    pub fn on_halt(&self, hook: impl FnMut() + 'static) {
        *self.on_halt.borrow_mut() = Some(Box::new(hook));
    }

    pub fn invlpg_log(&self) -> Vec<u64> {
        self.invlpgs.borrow().clone()
    }

    /// Queues operations the next nested SVM guest performs before its main
    /// function runs.
    pub fn script_nested(&self, ops: &[NestedOp]) {
        self.nested_ops.borrow_mut().extend_from_slice(ops);
    }

    pub fn vmrun_count(&self) -> usize {
        self.vmruns.get()
    }

    /// Makes the next VM entry fail with `reason` (bit 31 is added).
    pub fn fail_next_entry(&self, reason: u64, qualification: u64) {
        self.entry_failure.set(Some((reason, qualification)));
    }

    pub fn vmx_is_on(&self) -> bool {
        self.vmxon_region.get().is_some()
    }

    /// Reads a field of the VMCS at `vmcs`, current or not.
    pub fn vmcs_field(&self, vmcs: u64, field: u32) -> Option<u64> {
        self.vmcs.borrow().get(&vmcs)?.fields.get(&field).copied()
    }

    pub fn vmcs_launched(&self, vmcs: u64) -> bool {
        self.vmcs.borrow().get(&vmcs).is_some_and(|v| v.launched)
    }

    /// Reports VMfailValid with `error` if a VMCS is current, VMfailInvalid
    /// otherwise.
    fn fail_valid(&self, error: u64) -> Result<(), VmFail> {
        let Some(current) = self.current_vmcs.get() else {
            return Err(VmFail::VmFailInvalid);
        };
        self.vmcs
            .borrow_mut()
            .entry(current)
            .or_default()
            .fields
            .insert(VMCS_INSTRUCTION_ERROR, error);
        Err(VmFail::VmFailValid)
    }

    fn require_vmx_on(&self, instruction: &str) {
        if self.vmxon_region.get().is_none() {
            panic!("#UD: {instruction} outside VMX operation");
        }
    }

    fn set_current_field(&self, field: u32, value: u64) {
        if let Some(current) = self.current_vmcs.get() {
            self.vmcs
                .borrow_mut()
                .entry(current)
                .or_default()
                .fields
                .insert(field, value);
        }
    }
}

impl Default for MockCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the `call rax` that starts the nested entry trampoline; the
/// nested guest halts right after it.
const NESTED_CALL_LEN: u64 = 2;

/// Runs the nested guest from `rip` until its halt, the way the entry
/// trampoline does, and returns the RIP of the halt.
///
/// Only a guest starting at the trampoline calls its main function (in
/// `rax`); one resumed at the halt halts again at once.
fn run_nested_guest(rip: u64, rax: &mut u64) -> u64 {
    let entry = nested_guest_entry_addr();
    if rip == entry {
        assert_ne!(*rax, 0, "nested guest has no main function");
        // SAFETY: tests only pass addresses of `extern "C" fn() -> u64` items.
        let main: extern "C" fn() -> u64 = unsafe { core::mem::transmute(*rax as usize) };
        *rax = main();
    }
    entry + NESTED_CALL_LEN
}

impl CpuOps for MockCpu {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuIdResult {
        self.cpuid.get(&leaf).copied().unwrap_or(CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        })
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        self.msr(msr)
    }

    unsafe fn write_msr(&self, msr: Msr, value: u64) {
        if msr == Msr::IA32_EFER && value & EFER_SVME != 0 && self.cpuid(0x8000_0001, 0).ecx & (1 << 2) == 0 {
            panic!("#GP: EFER.SVME on a CPU without SVM");
        }
        if msr == Msr::IA32_FEATURE_CONTROL && self.msr(msr) & 1 != 0 {
            panic!("#GP: write to locked IA32_FEATURE_CONTROL");
        }
        self.set_msr(msr, value);
    }

    fn read_cr0(&self) -> u64 {
        self.cr0.get()
    }

    fn read_cr2(&self) -> u64 {
        self.cr2.get()
    }

    fn read_cr3(&self) -> u64 {
        self.cr3.get()
    }

    fn read_cr4(&self) -> u64 {
        self.cr4.get()
    }

    unsafe fn write_cr0(&self, value: u64) {
        self.cr0.set(value);
    }

    unsafe fn write_cr4(&self, value: u64) {
        self.cr4.set(value);
    }

    fn segment_selectors(&self) -> SegmentSelectors {
        self.selectors.get()
    }

    fn gdtr(&self) -> TablePointer {
        TablePointer {
            base: self.gdt.as_ptr() as u64,
            limit: (GDT_ENTRIES * 8 - 1) as u16,
        }
    }

    fn idtr(&self) -> TablePointer {
        TablePointer {
            base: self.idt.as_ptr() as u64,
            limit: IDT_LIMIT,
        }
    }

    unsafe fn invlpg(&self, addr: u64) {
        self.invlpgs.borrow_mut().push(addr);
    }

    fn halt(&self) {
        self.halts.set(self.halts.get() + 1);
        let hook = self.on_halt.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook();
            *self.on_halt.borrow_mut() = Some(hook);
        }
    }

    fn halt_forever(&self) -> ! {
        panic::panic_any(HaltedForever)
    }

    #[cfg(feature = "svm")]
    unsafe fn svm_vmrun(&self, vmcb: u64, host_vmcb: u64, _regs: &mut GeneralRegisters) {
        use tock_registers::interfaces::{Readable, Writeable};

        use crate::svm::{SvmExitCode, SvmIntercept, VmLoadSaveStates, VmcbStruct};

        if self.msr(Msr::IA32_EFER) & EFER_SVME == 0 {
            panic!("#UD: VMRUN with EFER.SVME clear");
        }
        // SAFETY: the callers pass addresses of live VMCBs.
        let (guest, host) = unsafe { (&*(vmcb as *const VmcbStruct), &*(host_vmcb as *const VmcbStruct)) };
        let intercepted = |id: SvmIntercept| matches!(guest.control.intercept(id.id()), Ok(true));
        self.vmruns.set(self.vmruns.get() + 1);

        // VMSAVE host, VMLOAD guest.
        self.hidden.borrow().apply(&host.state);
        *self.hidden.borrow_mut() = VmLoadSaveStates::capture(&guest.state);

        let exit_code = if !intercepted(SvmIntercept::VMRUN) {
            SvmExitCode::INVALID
        } else {
            let ops: Vec<NestedOp> = self.nested_ops.borrow_mut().drain(..).collect();
            let mut exit = None;
            for op in ops {
                match op {
                    NestedOp::Vmload(_) if intercepted(SvmIntercept::VMLOAD) => {
                        exit = Some(SvmExitCode::VMLOAD);
                        break;
                    }
                    NestedOp::Vmsave(_) if intercepted(SvmIntercept::VMSAVE) => {
                        exit = Some(SvmExitCode::VMSAVE);
                        break;
                    }
                    NestedOp::Vmload(addr) => {
                        let block = unsafe { &*(addr as *const VmcbStruct) };
                        *self.hidden.borrow_mut() = VmLoadSaveStates::capture(&block.state);
                    }
                    NestedOp::Vmsave(addr) => {
                        let block = unsafe { &*(addr as *const VmcbStruct) };
                        self.hidden.borrow().apply(&block.state);
                    }
                }
            }
            exit.unwrap_or_else(|| {
                assert!(intercepted(SvmIntercept::HLT), "nested guest halted without HLT intercept");
                let mut rax = guest.state.rax.get();
                let halt_rip = run_nested_guest(guest.state.rip.get(), &mut rax);
                guest.state.rax.set(rax);
                guest.state.rip.set(halt_rip);
                guest.control.next_rip.set(halt_rip + 1);
                SvmExitCode::HLT
            })
        };
        guest.control.exit_code.set(exit_code as u64);
        guest.control.exit_info_1.set(0);
        guest.control.exit_info_2.set(0);

        // VMSAVE guest, VMLOAD host.
        self.hidden.borrow().apply(&guest.state);
        *self.hidden.borrow_mut() = VmLoadSaveStates::capture(&host.state);
    }

    #[cfg(not(feature = "svm"))]
    unsafe fn svm_vmrun(&self, _vmcb: u64, _host_vmcb: u64, _regs: &mut GeneralRegisters) {
        panic!("#UD: VMRUN");
    }

    unsafe fn vmxon(&self, region: u64) -> Result<(), VmFail> {
        if self.cr4.get() & CR4_VMXE == 0 {
            panic!("#UD: VMXON with CR4.VMXE clear");
        }
        if self.msr(Msr::IA32_FEATURE_CONTROL) & 0b101 != 0b101 {
            panic!("#GP: VMXON blocked by IA32_FEATURE_CONTROL");
        }
        if self.vmxon_region.get().is_some() {
            return self.fail_valid(15);
        }
        // SAFETY: `region` is a live page handed out by the test heap.
        let revision = unsafe { (region as *const u32).read() };
        if region & 0xfff != 0 || revision & 0x7fff_ffff != MOCK_VMCS_REVISION {
            return Err(VmFail::VmFailInvalid);
        }
        self.vmxon_region.set(Some(region));
        Ok(())
    }

    unsafe fn vmxoff(&self) -> Result<(), VmFail> {
        self.require_vmx_on("VMXOFF");
        self.vmxon_region.set(None);
        self.current_vmcs.set(None);
        Ok(())
    }

    unsafe fn vmclear(&self, vmcs: u64) -> Result<(), VmFail> {
        self.require_vmx_on("VMCLEAR");
        if vmcs & 0xfff != 0 {
            return self.fail_valid(2);
        }
        if Some(vmcs) == self.vmxon_region.get() {
            return self.fail_valid(3);
        }
        self.vmcs.borrow_mut().entry(vmcs).or_default().launched = false;
        if self.current_vmcs.get() == Some(vmcs) {
            self.current_vmcs.set(None);
        }
        Ok(())
    }

    unsafe fn vmptrld(&self, vmcs: u64) -> Result<(), VmFail> {
        self.require_vmx_on("VMPTRLD");
        if vmcs & 0xfff != 0 {
            return self.fail_valid(9);
        }
        if Some(vmcs) == self.vmxon_region.get() {
            return self.fail_valid(10);
        }
        // SAFETY: `vmcs` is a live page handed out by the test heap.
        let revision = unsafe { (vmcs as *const u32).read() };
        if revision & 0x7fff_ffff != MOCK_VMCS_REVISION {
            return self.fail_valid(11);
        }
        self.vmcs.borrow_mut().entry(vmcs).or_default();
        self.current_vmcs.set(Some(vmcs));
        Ok(())
    }

    fn vmptrst(&self) -> Result<u64, VmFail> {
        self.require_vmx_on("VMPTRST");
        Ok(self.current_vmcs.get().unwrap_or(u64::MAX))
    }

    fn vmread(&self, field: u32) -> Result<u64, VmFail> {
        self.require_vmx_on("VMREAD");
        let current = self.current_vmcs.get().ok_or(VmFail::VmFailInvalid)?;
        Ok(self.vmcs_field(current, field).unwrap_or(0))
    }

    unsafe fn vmwrite(&self, field: u32, value: u64) -> Result<(), VmFail> {
        self.require_vmx_on("VMWRITE");
        if self.current_vmcs.get().is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        // Exit-information fields are read-only.
        if (field >> 10) & 3 == 1 {
            return self.fail_valid(13);
        }
        self.set_current_field(field, value);
        Ok(())
    }

    unsafe fn vmx_enter(&self, regs: &mut GeneralRegisters, resume: bool) -> Result<(), VmFail> {
        self.require_vmx_on(if resume { "VMRESUME" } else { "VMLAUNCH" });
        let current = self.current_vmcs.get().ok_or(VmFail::VmFailInvalid)?;
        let launched = self.vmcs_launched(current);
        if !resume && launched {
            return self.fail_valid(4);
        }
        if resume && !launched {
            return self.fail_valid(5);
        }

        if let Some((reason, qualification)) = self.entry_failure.take() {
            self.set_current_field(VMCS_EXIT_REASON, reason | VMX_ENTRY_FAILURE);
            self.set_current_field(VMCS_EXIT_QUALIFICATION, qualification);
            return Ok(());
        }

        let rip = self.vmcs_field(current, VMCS_GUEST_RIP).unwrap_or(0);
        let halt_rip = run_nested_guest(rip, &mut regs.rax);
        self.set_current_field(VMCS_GUEST_RIP, halt_rip);
        self.set_current_field(VMCS_EXIT_REASON, VMX_EXIT_HLT);
        self.set_current_field(VMCS_EXIT_QUALIFICATION, 0);
        self.set_current_field(VMCS_EXIT_INSTRUCTION_LEN, 1);
        if let Some(vmcs) = self.vmcs.borrow_mut().get_mut(&current) {
            vmcs.launched = true;
        }
        Ok(())
    }
}

#[cfg(feature = "svm")]
impl MockCpu {
    /// The VMLOAD/VMSAVE state currently loaded in the CPU.
    pub fn hidden_state(&self) -> crate::svm::VmLoadSaveStates {
        *self.hidden.borrow()
    }

    pub fn set_hidden_state(&self, state: crate::svm::VmLoadSaveStates) {
        *self.hidden.borrow_mut() = state;
    }
}
