//! x86 architectural state: descriptors, page tables, MSRs, interrupts and the
//! instruction interface everything else goes through.

mod cpu;
pub mod descriptor;
pub mod interrupt;
mod msr;
pub mod paging;
mod regs;

pub use cpu::{CpuOps, NestedGuestMain, SegmentSelectors, TablePointer, cpu_features};
#[cfg(target_arch = "x86_64")]
pub use cpu::{NativeCpu, nested_guest_entry_addr};
pub use descriptor::{DescriptorMode, DescriptorTable, SYSTEM_TYPE_TSS_BUSY, SegmentDescriptor, SegmentFlags};
pub use interrupt::{InterruptFrame, IdtGate, interrupt_name};
pub use msr::Msr;
pub use paging::{PageTableEntry, PageTableFlags, PageTableMemory};
pub use regs::GeneralRegisters;

pub use x86_64::registers::control::{Cr0Flags, Cr4Flags};
pub use x86_64::registers::model_specific::EferFlags;
