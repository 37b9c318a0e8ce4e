//! Guest-physical memory backed by guarded anonymous host mappings.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use bitflags::bitflags;
use memory_addr::{align_down, align_up};

use super::{HostError, Result};
use crate::layout::{MAX_REGIONS, PAGE_SIZE};
use crate::x86::{PageTableEntry, PageTableMemory};

bitflags! {
    /// Flags of a guest memory region, with KVM's `KVM_MEM_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const LOG_DIRTY_PAGES = 1 << 0;
        const READONLY = 1 << 1;
    }
}

/// Anonymous read/write host memory with an inaccessible page on each side.
#[derive(Debug)]
pub struct GuardedMapping {
    base: NonNull<u8>,
    total: usize,
}

// SAFETY: the mapping is plain memory owned by this value; accesses go through
// raw pointers under the guest/host publish protocol.
unsafe impl Send for GuardedMapping {}
unsafe impl Sync for GuardedMapping {}

impl GuardedMapping {
    /// Maps `len` bytes, rounded up to whole pages.
    pub fn new(len: usize) -> Result<Self> {
        let len = align_up(len.max(1), PAGE_SIZE);
        let total = len + 2 * PAGE_SIZE;
        // SAFETY: a fresh anonymous mapping aliases nothing.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let base = NonNull::new(raw.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let mapping = Self { base, total };
        // SAFETY: the range lies inside the mapping created above.
        let ret = unsafe {
            libc::mprotect(
                mapping.as_ptr().cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(mapping)
    }

    /// First usable byte.
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: the leading guard page is part of the mapping.
        unsafe { self.base.as_ptr().add(PAGE_SIZE) }
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.total - 2 * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for GuardedMapping {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly what `new` mapped.
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.total) } != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// One installed guest-physical region.
#[derive(Debug)]
pub struct MemoryRegion {
    slot: u32,
    guest_base: u64,
    flags: RegionFlags,
    mapping: Arc<GuardedMapping>,
}

impl MemoryRegion {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Guest-physical address of the first byte, always page aligned.
    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn host_addr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub(crate) fn mapping(&self) -> &Arc<GuardedMapping> {
        &self.mapping
    }

    fn contains(&self, addr: u64, len: usize) -> bool {
        let end = self.guest_base + self.size() as u64;
        addr >= self.guest_base && addr.checked_add(len as u64).is_some_and(|last| last <= end)
    }
}

/// The set of memory regions of one guest, indexed by slot.
#[derive(Debug, Default)]
pub struct GuestMemory {
    regions: [Option<MemoryRegion>; MAX_REGIONS],
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps host memory for the guest range `guest_addr..guest_addr + size`
    /// in `slot`.
    ///
    /// The region starts at the page containing `guest_addr` and its size is
    /// rounded up to whole pages. The returned pointer is the start of that
    /// page, so `ptr.add(guest_addr % PAGE_SIZE)` is the first requested
    /// byte.
    pub fn alloc_region(&mut self, slot: usize, guest_addr: u64, size: usize, flags: RegionFlags) -> Result<&MemoryRegion> {
        let entry = self
            .regions
            .get_mut(slot)
            .ok_or(HostError::SlotOutOfRange(slot))?;
        if entry.is_some() {
            return Err(HostError::SlotBusy(slot));
        }
        let guest_base = align_down(guest_addr as usize, PAGE_SIZE) as u64;
        let size = align_up((guest_addr - guest_base) as usize + size, PAGE_SIZE);
        let mapping = Arc::new(GuardedMapping::new(size)?);
        debug!(
            "slot {}: guest [{:#x}, {:#x}) -> host {:p}",
            slot,
            guest_base,
            guest_base + size as u64,
            mapping.as_ptr()
        );
        Ok(entry.insert(MemoryRegion {
            slot: slot as u32,
            guest_base,
            flags,
            mapping,
        }))
    }

    /// Drops the region in `slot`.
    pub fn remove(&mut self, slot: usize) -> Option<MemoryRegion> {
        self.regions.get_mut(slot)?.take()
    }

    pub fn region(&self, slot: usize) -> Option<&MemoryRegion> {
        self.regions.get(slot)?.as_ref()
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().flatten()
    }

    /// Host address of the guest range `addr..addr + len`, which must lie
    /// within one region.
    pub fn translate(&self, addr: u64, len: usize) -> Option<*mut u8> {
        self.regions()
            .find(|region| region.contains(addr, len))
            // SAFETY: `contains` keeps the offset inside the mapping.
            .map(|region| unsafe { region.host_addr().add((addr - region.guest_base) as usize) })
    }

    fn checked_translate(&self, addr: u64, len: usize) -> Result<*mut u8> {
        self.translate(addr, len).ok_or(HostError::Unbacked { addr, len })
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result {
        let src = self.checked_translate(addr, buf.len())?;
        // SAFETY: the source range is mapped and cannot overlap `buf`.
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result {
        let dst = self.checked_translate(addr, data.len())?;
        // SAFETY: as in `read_bytes`.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max` bytes. The string may
    /// not cross the end of its region.
    pub fn read_c_string(&self, addr: u64, max: usize) -> Option<String> {
        let region = self.regions().find(|region| region.contains(addr, 1))?;
        let offset = (addr - region.guest_base) as usize;
        let len = (region.size() - offset).min(max);
        // SAFETY: `offset + len` stays inside the mapping.
        let bytes = unsafe { std::slice::from_raw_parts(region.host_addr().add(offset), len) };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

impl PageTableMemory for GuestMemory {
    fn read_entry(&self, paddr: u64) -> Option<PageTableEntry> {
        self.read_u64(paddr).ok().map(PageTableEntry::from_raw)
    }

    fn write_entry(&mut self, paddr: u64, entry: PageTableEntry) -> Option<()> {
        self.write_u64(paddr, entry.raw()).ok()
    }
}
