//! Segment descriptors and descriptor tables.
//!
//! Flags are kept in the 12-bit packed form used by the VMCB segment
//! attribute field: the access byte in bits 0..8, followed by AVL, L, D/B and
//! G in bits 8..12.

use bit_field::BitField;
use bitflags::bitflags;

use crate::error::{HarnessError, Result};

use super::TablePointer;

bitflags! {
    /// Segment descriptor flags in packed 12-bit form.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u16 {
        const ACCESSED = 1 << 0;
        /// Readable code or writable data.
        const READ_WRITE = 1 << 1;
        /// Conforming code or expand-down data.
        const DIRECTION = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Code/data segment (`S` bit). Clear for system descriptors.
        const USER_SEGMENT = 1 << 4;
        const DPL_RING_3 = 3 << 5;
        const PRESENT = 1 << 7;
        const AVAILABLE = 1 << 8;
        const LONG_MODE = 1 << 9;
        const SIZE_32 = 1 << 10;
        /// Limit is counted in 4 KiB pages.
        const PAGE_LIMIT = 1 << 11;

        /// 64-bit code segment.
        const CODE64 = Self::PRESENT.bits() | Self::USER_SEGMENT.bits()
            | Self::EXECUTABLE.bits() | Self::READ_WRITE.bits() | Self::ACCESSED.bits()
            | Self::LONG_MODE.bits() | Self::PAGE_LIMIT.bits();
        /// 32-bit code segment.
        const CODE32 = Self::PRESENT.bits() | Self::USER_SEGMENT.bits()
            | Self::EXECUTABLE.bits() | Self::READ_WRITE.bits() | Self::ACCESSED.bits()
            | Self::SIZE_32.bits() | Self::PAGE_LIMIT.bits();
        /// Flat 32-bit data segment.
        const DATA = Self::PRESENT.bits() | Self::USER_SEGMENT.bits()
            | Self::READ_WRITE.bits() | Self::ACCESSED.bits()
            | Self::SIZE_32.bits() | Self::PAGE_LIMIT.bits();
        /// Expand-down 32-bit stack segment. VM entry rejects a usable SS
        /// without the accessed bit.
        const STACK = Self::PRESENT.bits() | Self::USER_SEGMENT.bits()
            | Self::READ_WRITE.bits() | Self::DIRECTION.bits() | Self::ACCESSED.bits()
            | Self::SIZE_32.bits() | Self::PAGE_LIMIT.bits();
        /// Available 64-bit TSS.
        const TSS64 = Self::PRESENT.bits() | SYSTEM_TYPE_TSS_AVAILABLE;
    }
}

/// System descriptor type of an available 32/64-bit TSS.
pub const SYSTEM_TYPE_TSS_AVAILABLE: u16 = 0x9;
/// System descriptor type of a busy 32/64-bit TSS.
pub const SYSTEM_TYPE_TSS_BUSY: u16 = 0xb;
/// System descriptor type of an LDT.
pub const SYSTEM_TYPE_LDT: u16 = 0x2;

const MAX_LIMIT: u32 = (1 << 20) - 1;

impl SegmentFlags {
    /// Descriptor type field (bits 0..4 of the access byte).
    pub fn segment_type(self) -> u8 {
        (self.bits() & 0xf) as u8
    }

    pub fn dpl(self) -> u8 {
        ((self.bits() >> 5) & 0x3) as u8
    }

    pub fn is_system(self) -> bool {
        !self.contains(Self::USER_SEGMENT)
    }

    /// Converts to the VMX access-rights layout, where AVL/L/D/B/G sit in bits
    /// 12..16 instead of 8..12.
    pub fn vmx_access_rights(self) -> u32 {
        let bits = self.bits() as u32;
        (bits & 0xff) | ((bits & 0xf00) << 4)
    }
}

/// Processor mode a descriptor table is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorMode {
    /// All descriptors are 8 bytes and bases are 32-bit.
    Legacy,
    /// System descriptors take 16 bytes and carry a 64-bit base.
    Long,
}

impl DescriptorMode {
    #[cfg(target_pointer_width = "64")]
    pub const NATIVE: Self = Self::Long;
    #[cfg(not(target_pointer_width = "64"))]
    pub const NATIVE: Self = Self::Legacy;

    /// Returns `true` if a descriptor with `flags` takes two table slots.
    pub fn is_wide(self, flags: SegmentFlags) -> bool {
        self == Self::Long && flags.is_system()
    }
}

/// A decoded segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    /// Byte-granular limit. Page-granular limits are widened when decoding.
    pub limit: u32,
    pub flags: SegmentFlags,
}

impl SegmentDescriptor {
    /// Encodes a descriptor. `limit` is the raw 20-bit field value.
    ///
    /// Returns the descriptor words and the number of table slots used.
    pub fn encode(base: u64, limit: u32, flags: SegmentFlags, mode: DescriptorMode) -> Result<([u64; 2], usize)> {
        if limit > MAX_LIMIT {
            return Err(HarnessError::SegmentLimitOutOfRange(limit));
        }

        let wide = mode.is_wide(flags);
        if !wide && base > u32::MAX as u64 {
            return Err(HarnessError::SegmentBaseOutOfRange(base));
        }

        let mut low = 0u64;
        low.set_bits(0..16, (limit & 0xffff) as u64);
        low.set_bits(16..40, base.get_bits(0..24));
        low.set_bits(40..48, (flags.bits() & 0xff) as u64);
        low.set_bits(48..52, (limit >> 16) as u64);
        low.set_bits(52..56, ((flags.bits() >> 8) & 0xf) as u64);
        low.set_bits(56..64, base.get_bits(24..32));

        if wide {
            Ok(([low, base >> 32], 2))
        } else {
            Ok(([low, 0], 1))
        }
    }

    /// Decodes the first descriptor word, plus the upper word for 16-byte
    /// system descriptors.
    pub fn decode(low: u64, high: Option<u64>) -> Self {
        let access = low.get_bits(40..48) as u16;
        let upper = low.get_bits(52..56) as u16;
        let flags = SegmentFlags::from_bits_retain(access | (upper << 8));

        let mut limit = (low.get_bits(0..16) | (low.get_bits(48..52) << 16)) as u32;
        if flags.contains(SegmentFlags::PAGE_LIMIT) {
            limit = (limit << 12) | 0xfff;
        }

        let mut base = low.get_bits(16..40) | (low.get_bits(56..64) << 24);
        if let Some(high) = high {
            base |= high.get_bits(0..32) << 32;
        }

        Self { base, limit, flags }
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(SegmentFlags::PRESENT)
    }
}

fn entry_present(entry: u64) -> bool {
    entry.get_bit(47)
}

fn entry_flags(entry: u64) -> SegmentFlags {
    SegmentFlags::from_bits_retain(entry.get_bits(40..48) as u16 | ((entry.get_bits(52..56) as u16) << 8))
}

/// A descriptor table (GDT or LDT) over borrowed memory.
pub struct DescriptorTable<'a> {
    entries: &'a mut [u64],
    mode: DescriptorMode,
}

impl<'a> DescriptorTable<'a> {
    pub fn new(entries: &'a mut [u64], mode: DescriptorMode) -> Self {
        Self { entries, mode }
    }

    /// Views the table a descriptor-table register points at.
    ///
    /// # Safety
    ///
    /// `ptr.base` must be the address of a mapped table of `ptr.limit + 1`
    /// bytes, not aliased by any other live reference for `'a`.
    pub unsafe fn from_pointer(ptr: TablePointer, mode: DescriptorMode) -> Self {
        let len = (ptr.limit as usize + 1) / 8;
        let entries = unsafe { core::slice::from_raw_parts_mut(ptr.base as *mut u64, len) };
        Self { entries, mode }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mode(&self) -> DescriptorMode {
        self.mode
    }

    /// Base address of the table.
    pub fn base(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    /// Value of the descriptor-table register covering the whole table.
    pub fn pointer(&self) -> TablePointer {
        TablePointer {
            base: self.base(),
            limit: (self.entries.len() * 8 - 1) as u16,
        }
    }

    pub fn raw(&self, index: usize) -> Option<u64> {
        self.entries.get(index).copied()
    }

    pub fn is_present(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|&e| entry_present(e))
    }

    /// Writes a descriptor at `index`. 16-byte descriptors also take `index + 1`.
    pub fn set_descriptor(&mut self, index: usize, base: u64, limit: u32, flags: SegmentFlags) -> Result {
        let (words, slots) = SegmentDescriptor::encode(base, limit, flags, self.mode)?;
        if index + slots > self.entries.len() {
            return Err(HarnessError::DescriptorIndexOutOfRange(index));
        }
        self.entries[index..index + slots].copy_from_slice(&words[..slots]);
        Ok(())
    }

    /// Decodes the descriptor at `index`.
    pub fn descriptor(&self, index: usize) -> Result<SegmentDescriptor> {
        let low = self.raw(index).ok_or(HarnessError::DescriptorIndexOutOfRange(index))?;
        if self.mode.is_wide(entry_flags(low)) {
            let high = self.raw(index + 1).ok_or(HarnessError::DescriptorIndexOutOfRange(index))?;
            Ok(SegmentDescriptor::decode(low, Some(high)))
        } else {
            Ok(SegmentDescriptor::decode(low, None))
        }
    }

    /// Returns the first slot not marked present, skipping the null descriptor
    /// and the upper halves of 16-byte descriptors.
    pub fn find_free_descriptor(&self) -> Result<usize> {
        let mut index = 1;
        while index < self.entries.len() {
            let entry = self.entries[index];
            if !entry_present(entry) {
                return Ok(index);
            }
            index += if self.mode.is_wide(entry_flags(entry)) { 2 } else { 1 };
        }
        Err(HarnessError::DescriptorTableFull)
    }

    /// Adds an expand-down stack segment whose valid offsets start at
    /// `stack_base`, returning its table index.
    pub fn create_stack_descriptor(&mut self, stack_base: u64) -> Result<usize> {
        let index = self.find_free_descriptor()?;
        let limit = stack_base.wrapping_sub(1) >> 12;
        let limit = u32::try_from(limit).map_err(|_| HarnessError::SegmentBaseOutOfRange(stack_base))?;
        self.set_descriptor(index, 0, limit, SegmentFlags::STACK)?;
        debug!("stack descriptor {} covers {:#x}..", index, stack_base);
        Ok(index)
    }
}
