use std::fmt;

use kvm_bindings::{KVM_MAX_CPUID_ENTRIES, kvm_fpu, kvm_regs, kvm_segment, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

use super::bootstrap::{BootSegment, BootState};
use super::memory::RegionFlags;
use super::{HostError, Result};
use crate::layout::{KVM_IDENTITY_MAP_ADDR, KVM_TSS_ADDR};
use crate::x86::SegmentFlags;
use crate::x86::descriptor::SYSTEM_TYPE_TSS_BUSY;

/// Why the vCPU returned to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    Halt,
    Shutdown,
    Io { port: u16, write: bool },
    Mmio { addr: u64, write: bool },
    /// Any exit the harness does not model, by its debug name.
    Other(String),
}

impl fmt::Display for VmExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halt => f.write_str("HLT"),
            Self::Shutdown => f.write_str("SHUTDOWN"),
            Self::Io { port, write } => write!(f, "IO {} port {:#x}", if *write { "write" } else { "read" }, port),
            Self::Mmio { addr, write } => write!(f, "MMIO {} {:#x}", if *write { "write" } else { "read" }, addr),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// The hypervisor operations a [`VmInstance`](super::VmInstance) needs: one
/// machine with one vCPU.
pub trait VmBackend {
    /// Installs (or, with `size == 0`, removes) a guest-physical region.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must stay mapped until the slot is
    /// removed or the backend is dropped.
    unsafe fn set_user_memory_region(
        &mut self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
        flags: RegionFlags,
    ) -> Result;

    /// Loads the initial register state.
    fn setup_vcpu(&mut self, boot: &BootState) -> Result;

    /// Runs the vCPU until its next exit.
    fn run(&mut self) -> Result<VmExit>;

    /// Current guest RIP.
    fn rip(&mut self) -> Result<u64>;

    /// Closes the vCPU. Later `run`/`rip` calls fail.
    fn release_vcpu(&mut self) -> Result;

    /// Closes the machine, and the vCPU if it is still open. Regions should
    /// be removed first.
    fn release_vm(&mut self) -> Result;
}

/// [`VmBackend`] on top of `/dev/kvm`.
pub struct KvmBackend {
    kvm: Kvm,
    vm: Option<VmFd>,
    vcpu: Option<VcpuFd>,
}

impl KvmBackend {
    /// Creates a VM with one vCPU that sees every CPUID feature KVM supports,
    /// SVM and VMX included when nested virtualization is on.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(|err| match err.errno() {
            libc::ENOENT | libc::ENODEV | libc::EACCES => {
                HostError::Unsupported(format!("/dev/kvm is not available: {err}"))
            }
            _ => HostError::kvm("open /dev/kvm")(err),
        })?;
        let vm = kvm.create_vm().map_err(HostError::kvm("KVM_CREATE_VM"))?;
        vm.set_identity_map_address(KVM_IDENTITY_MAP_ADDR)
            .map_err(HostError::kvm("KVM_SET_IDENTITY_MAP_ADDR"))?;
        vm.set_tss_address(KVM_TSS_ADDR as usize)
            .map_err(HostError::kvm("KVM_SET_TSS_ADDR"))?;
        let vcpu = vm.create_vcpu(0).map_err(HostError::kvm("KVM_CREATE_VCPU"))?;

        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(HostError::kvm("KVM_GET_SUPPORTED_CPUID"))?;
        vcpu.set_cpuid2(&cpuid).map_err(HostError::kvm("KVM_SET_CPUID2"))?;
        info!("created KVM VM (API version {})", kvm.get_api_version());

        Ok(Self {
            kvm,
            vm: Some(vm),
            vcpu: Some(vcpu),
        })
    }

    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    fn vm(&self) -> Result<&VmFd> {
        self.vm.as_ref().ok_or(HostError::Released("VM"))
    }

    fn vcpu(&mut self) -> Result<&mut VcpuFd> {
        self.vcpu.as_mut().ok_or(HostError::Released("vCPU"))
    }
}

fn kvm_segment(seg: &BootSegment) -> kvm_segment {
    let flags = seg.flags;
    let present = flags.contains(SegmentFlags::PRESENT);
    kvm_segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: flags.segment_type(),
        present: present as u8,
        dpl: flags.dpl(),
        db: flags.contains(SegmentFlags::SIZE_32) as u8,
        s: flags.contains(SegmentFlags::USER_SEGMENT) as u8,
        l: flags.contains(SegmentFlags::LONG_MODE) as u8,
        g: flags.contains(SegmentFlags::PAGE_LIMIT) as u8,
        avl: flags.contains(SegmentFlags::AVAILABLE) as u8,
        unusable: !present as u8,
        padding: 0,
    }
}

impl VmBackend for KvmBackend {
    unsafe fn set_user_memory_region(
        &mut self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        host_addr: u64,
        flags: RegionFlags,
    ) -> Result {
        let region = kvm_userspace_memory_region {
            slot,
            flags: flags.bits(),
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // SAFETY: the caller keeps the host range mapped.
        unsafe { self.vm()?.set_user_memory_region(region) }.map_err(HostError::kvm("KVM_SET_USER_MEMORY_REGION"))
    }

    fn setup_vcpu(&mut self, boot: &BootState) -> Result {
        let vcpu = self.vcpu()?;
        let mut sregs = vcpu.get_sregs().map_err(HostError::kvm("KVM_GET_SREGS"))?;
        sregs.cs = kvm_segment(&boot.cs);
        let data = kvm_segment(&boot.data);
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;
        // VM entry wants a busy TSS in TR. The GDT copy stays available until
        // the boot code runs LTR.
        sregs.tr = kvm_segment(&boot.tr);
        sregs.tr.type_ = SYSTEM_TYPE_TSS_BUSY as u8;
        sregs.gdt.base = boot.gdt.base;
        sregs.gdt.limit = boot.gdt.limit;
        sregs.idt.base = boot.idt.base;
        sregs.idt.limit = boot.idt.limit;
        sregs.cr0 = boot.cr0;
        sregs.cr3 = boot.cr3;
        sregs.cr4 = boot.cr4;
        sregs.efer = boot.efer;
        vcpu.set_sregs(&sregs).map_err(HostError::kvm("KVM_SET_SREGS"))?;

        let regs = kvm_regs {
            rip: boot.rip,
            rsp: boot.rsp,
            rflags: boot.rflags,
            ..Default::default()
        };
        vcpu.set_regs(&regs).map_err(HostError::kvm("KVM_SET_REGS"))?;

        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        vcpu.set_fpu(&fpu).map_err(HostError::kvm("KVM_SET_FPU"))
    }

    fn run(&mut self) -> Result<VmExit> {
        let exit = match self.vcpu()?.run().map_err(HostError::kvm("KVM_RUN"))? {
            VcpuExit::Hlt => VmExit::Halt,
            VcpuExit::Shutdown => VmExit::Shutdown,
            VcpuExit::IoIn(port, _) => VmExit::Io { port, write: false },
            VcpuExit::IoOut(port, _) => VmExit::Io { port, write: true },
            VcpuExit::MmioRead(addr, _) => VmExit::Mmio { addr, write: false },
            VcpuExit::MmioWrite(addr, _) => VmExit::Mmio { addr, write: true },
            other => VmExit::Other(format!("{other:?}")),
        };
        trace!("KVM exit: {}", exit);
        Ok(exit)
    }

    fn rip(&mut self) -> Result<u64> {
        let regs = self.vcpu()?.get_regs().map_err(HostError::kvm("KVM_GET_REGS"))?;
        Ok(regs.rip)
    }

    fn release_vcpu(&mut self) -> Result {
        drop(self.vcpu.take());
        Ok(())
    }

    fn release_vm(&mut self) -> Result {
        drop(self.vcpu.take());
        if self.vm.take().is_some() {
            debug!("KVM VM closed");
        }
        Ok(())
    }
}
