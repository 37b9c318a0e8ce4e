//! PAE/long-mode page-table entries and 4-level page walks.

use core::fmt;

use bit_field::BitField;
use bitflags::bitflags;

use crate::error::{HarnessError, Result};

bitflags! {
    /// Page-table entry flags shared by all four paging levels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageTableFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// 2 MiB/1 GiB page in a PD/PDPT entry.
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// A page-table entry with a 40-bit frame number in bits 12..52.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const FRAME_BITS: core::ops::Range<usize> = 12..52;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn new(addr: u64, flags: PageTableFlags) -> Self {
        let mut entry = Self(flags.bits());
        entry.set_frame_number(addr >> 12);
        entry
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    pub fn set_flags(&mut self, flags: PageTableFlags) {
        let frame = self.frame_number();
        self.0 = flags.bits();
        self.set_frame_number(frame);
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn is_huge(self) -> bool {
        self.flags().contains(PageTableFlags::HUGE_PAGE)
    }

    pub fn frame_number(self) -> u64 {
        self.0.get_bits(Self::FRAME_BITS)
    }

    pub fn set_frame_number(&mut self, frame: u64) {
        self.0.set_bits(Self::FRAME_BITS, frame.get_bits(0..40));
    }

    /// Physical address of the frame or next-level table.
    pub fn addr(self) -> u64 {
        self.frame_number() << 12
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// Physical memory holding page tables.
pub trait PageTableMemory {
    fn read_entry(&self, paddr: u64) -> Option<PageTableEntry>;
    fn write_entry(&mut self, paddr: u64, entry: PageTableEntry) -> Option<()>;
}

/// Byte slices are treated as physical memory starting at address 0.
impl PageTableMemory for [u8] {
    fn read_entry(&self, paddr: u64) -> Option<PageTableEntry> {
        let start = usize::try_from(paddr).ok()?;
        let bytes = self.get(start..start.checked_add(8)?)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Some(PageTableEntry::from_raw(u64::from_le_bytes(raw)))
    }

    fn write_entry(&mut self, paddr: u64, entry: PageTableEntry) -> Option<()> {
        let start = usize::try_from(paddr).ok()?;
        let bytes = self.get_mut(start..start.checked_add(8)?)?;
        bytes.copy_from_slice(&entry.raw().to_le_bytes());
        Some(())
    }
}

/// Page tables reached through an identity mapping, as inside the guest.
pub struct IdentityMemory(());

impl IdentityMemory {
    /// # Safety
    ///
    /// Every physical address handed to the accessors must be identity-mapped
    /// and hold page-table memory.
    pub const unsafe fn new() -> Self {
        Self(())
    }
}

impl PageTableMemory for IdentityMemory {
    fn read_entry(&self, paddr: u64) -> Option<PageTableEntry> {
        Some(PageTableEntry::from_raw(unsafe {
            core::ptr::read_volatile(paddr as *const u64)
        }))
    }

    fn write_entry(&mut self, paddr: u64, entry: PageTableEntry) -> Option<()> {
        unsafe { core::ptr::write_volatile(paddr as *mut u64, entry.raw()) };
        Some(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K = 0x1000,
    Size2M = 0x20_0000,
    Size1G = 0x4000_0000,
}

/// Result of a successful page walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the leaf entry.
    pub entry_addr: u64,
    pub entry: PageTableEntry,
    pub size: PageSize,
    pub paddr: u64,
}

/// Translates `vaddr` through the 4-level tables rooted at `cr3`.
pub fn walk<M: PageTableMemory + ?Sized>(mem: &M, cr3: u64, vaddr: u64) -> Option<Translation> {
    let mut table = PageTableEntry::from_raw(cr3).addr();
    for (level, shift) in [39usize, 30, 21, 12].into_iter().enumerate() {
        let index = vaddr.get_bits(shift..shift + 9);
        let entry_addr = table + index * 8;
        let entry = mem.read_entry(entry_addr)?;
        if !entry.is_present() {
            return None;
        }

        let size = match level {
            1 if entry.is_huge() => Some(PageSize::Size1G),
            2 if entry.is_huge() => Some(PageSize::Size2M),
            3 => Some(PageSize::Size4K),
            _ => None,
        };
        if let Some(size) = size {
            let offset = vaddr & (size as u64 - 1);
            return Some(Translation {
                entry_addr,
                entry,
                size,
                paddr: (entry.addr() & !(size as u64 - 1)) + offset,
            });
        }
        table = entry.addr();
    }
    None
}

/// Applies `f` to the leaf entry mapping `vaddr` and returns the old entry.
///
/// The caller is responsible for flushing the TLB entry afterwards.
pub fn update_leaf<M: PageTableMemory + ?Sized>(
    mem: &mut M,
    cr3: u64,
    vaddr: u64,
    f: impl FnOnce(&mut PageTableEntry),
) -> Result<PageTableEntry> {
    let translation = walk(mem, cr3, vaddr).ok_or(HarnessError::PageNotMapped(vaddr))?;
    let mut entry = translation.entry;
    f(&mut entry);
    mem.write_entry(translation.entry_addr, entry)
        .ok_or(HarnessError::PageNotMapped(translation.entry_addr))?;
    Ok(translation.entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_rw() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE
    }

    /// PML4 at 0x1000, PDPT at 0x2000, PD at 0x3000, PT at 0x4000.
    /// 0x0000..0x20_0000 through the PT, 0x20_0000.. as one 2 MiB page.
    fn build_tables() -> Vec<u8> {
        let mut mem = vec![0u8; 0x5000];
        let m = mem.as_mut_slice();
        m.write_entry(0x1000, PageTableEntry::new(0x2000, flags_rw())).unwrap();
        m.write_entry(0x2000, PageTableEntry::new(0x3000, flags_rw())).unwrap();
        m.write_entry(0x3000, PageTableEntry::new(0x4000, flags_rw())).unwrap();
        m.write_entry(0x3008, PageTableEntry::new(0x20_0000, flags_rw() | PageTableFlags::HUGE_PAGE))
            .unwrap();
        for i in 1..512u64 {
            m.write_entry(0x4000 + i * 8, PageTableEntry::new(i << 12, flags_rw())).unwrap();
        }
        mem
    }

    #[test]
    fn test_entry_fields() {
        let mut entry = PageTableEntry::new(0x000f_ffff_ffff_f000, flags_rw() | PageTableFlags::NO_EXECUTE);
        assert_eq!(entry.frame_number(), 0xff_ffff_ffff);
        assert_eq!(entry.addr(), 0x000f_ffff_ffff_f000);
        assert!(entry.flags().contains(PageTableFlags::NO_EXECUTE));

        entry.set_flags(PageTableFlags::PRESENT);
        assert_eq!(entry.addr(), 0x000f_ffff_ffff_f000);
        assert!(!entry.flags().contains(PageTableFlags::WRITABLE));
        assert_eq!(entry.raw(), 0x000f_ffff_ffff_f001);
    }

    #[test]
    fn test_walk_4k_and_2m() {
        let mem = build_tables();
        let t = walk(mem.as_slice(), 0x1000, 0x3456).unwrap();
        assert_eq!(t.size, PageSize::Size4K);
        assert_eq!(t.paddr, 0x3456);
        assert_eq!(t.entry_addr, 0x4000 + 3 * 8);

        let t = walk(mem.as_slice(), 0x1000, 0x23_4567).unwrap();
        assert_eq!(t.size, PageSize::Size2M);
        assert_eq!(t.paddr, 0x23_4567);

        assert!(walk(mem.as_slice(), 0x1000, 0x10).is_none());
        assert!(walk(mem.as_slice(), 0x1000, 0x4000_0000).is_none());
    }

    #[test]
    fn test_update_leaf_read_only() {
        let mut mem = build_tables();
        let old = update_leaf(mem.as_mut_slice(), 0x1000, 0x5000, |e| {
            e.set_flags(e.flags() - PageTableFlags::WRITABLE)
        })
        .unwrap();
        assert!(old.flags().contains(PageTableFlags::WRITABLE));

        let t = walk(mem.as_slice(), 0x1000, 0x5000).unwrap();
        assert!(!t.entry.flags().contains(PageTableFlags::WRITABLE));
        assert_eq!(t.entry.addr(), 0x5000);

        assert_eq!(
            update_leaf(mem.as_mut_slice(), 0x1000, 0x0, |_| {}),
            Err(HarnessError::PageNotMapped(0))
        );
    }
}
