use bit_field::BitField;
use bitflags::bitflags;

use crate::error::Result;
use crate::guest::BumpHeap;
use crate::x86::{CpuOps, Msr};

/// A VMXON region or VMCS: one zeroed page stamped with the VMCS revision
/// identifier.
#[derive(Debug)]
pub struct VmxRegion<'a> {
    page: &'a mut [u8],
}

impl<'a> VmxRegion<'a> {
    pub fn new(heap: &mut BumpHeap<'a>, revision_id: u32) -> Result<Self> {
        let page = heap.alloc_page()?;
        // Bit 31 clear: an ordinary VMCS, not a shadow VMCS.
        page[..4].copy_from_slice(&(revision_id & 0x7fff_ffff).to_le_bytes());
        Ok(Self { page })
    }

    pub fn revision_id(&self) -> u32 {
        u32::from_le_bytes([self.page[0], self.page[1], self.page[2], self.page[3]])
    }

    /// Physical (identity-mapped) address of the region.
    pub fn addr(&self) -> u64 {
        self.page.as_ptr() as u64
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of INS and OUTS.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0, i.e. the
    /// `IA32_VMX_TRUE_*_CTLS` MSRs are the ones to consult.
    pub vmx_flex_controls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn read(cpu: &impl CpuOps) -> Self {
        let msr = Msr::IA32_VMX_BASIC.read(cpu);
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. writes to this
       /// bit will result in GP(0).
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
   }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 23.7)
pub struct FeatureControl;

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read(cpu: &impl CpuOps) -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read(cpu))
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved bits.
    ///
    /// # Safety
    ///
    /// The MSR must not be locked yet.
    pub unsafe fn write(cpu: &impl CpuOps, flags: FeatureControlFlags) {
        let old_value = Msr::IA32_FEATURE_CONTROL.read(cpu);
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Msr::IA32_FEATURE_CONTROL.write(cpu, new_value) };
    }
}
