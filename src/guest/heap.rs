//! Bump-pointer heap over a fixed arena. Nothing is ever freed: each VM runs
//! exactly one test.

use memory_addr::{PAGE_SIZE_4K, align_up};

use crate::error::{HarnessError, Result};

/// Bump allocator handing out disjoint slices of one arena.
pub struct BumpHeap<'a> {
    free: &'a mut [u8],
}

impl<'a> BumpHeap<'a> {
    pub fn new(arena: &'a mut [u8]) -> Self {
        let mut heap = Self { free: arena };
        heap.align_cursor();
        heap
    }

    /// Builds a heap over `[start, end)`.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable and unused by anything else for `'a`.
    pub unsafe fn from_raw(start: usize, end: usize) -> Self {
        let len = end.saturating_sub(start);
        Self::new(unsafe { core::slice::from_raw_parts_mut(start as *mut u8, len) })
    }

    /// Address the next allocation starts at, before alignment.
    pub fn cursor(&self) -> usize {
        self.free.as_ptr() as usize
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Allocates `size` bytes at the 4-byte-aligned cursor.
    pub fn alloc(&mut self, size: usize) -> Result<&'a mut [u8]> {
        self.alloc_aligned(size, 4)
    }

    /// Allocates `size` bytes aligned to `align`, a power of two.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<&'a mut [u8]> {
        if !align.is_power_of_two() {
            return Err(HarnessError::InvalidAlignment(align));
        }

        let available = self.free.len();
        let pad = align_up(self.cursor(), align) - self.cursor();
        let needed = pad
            .checked_add(size)
            .filter(|&n| n <= available)
            .ok_or(HarnessError::HeapExhausted {
                requested: size,
                available,
            })?;

        let free = core::mem::take(&mut self.free);
        let (block, rest) = free.split_at_mut(needed);
        self.free = rest;
        self.align_cursor();
        Ok(block.split_at_mut(pad).1)
    }

    /// Allocates one zeroed, page-aligned 4 KiB page.
    pub fn alloc_page(&mut self) -> Result<&'a mut [u8]> {
        let page = self.alloc_aligned(PAGE_SIZE_4K, PAGE_SIZE_4K)?;
        page.fill(0);
        Ok(page)
    }

    /// Allocates a zeroed `T` aligned to at least `align`.
    ///
    /// # Safety
    ///
    /// The all-zero bit pattern must be a valid `T`.
    pub unsafe fn alloc_struct<T>(&mut self, align: usize) -> Result<&'a mut T> {
        let align = align.max(core::mem::align_of::<T>());
        let block = self.alloc_aligned(core::mem::size_of::<T>(), align)?;
        block.fill(0);
        Ok(unsafe { &mut *(block.as_mut_ptr() as *mut T) })
    }

    fn align_cursor(&mut self) {
        let skip = (align_up(self.cursor(), 4) - self.cursor()).min(self.free.len());
        let free = core::mem::take(&mut self.free);
        self.free = free.split_at_mut(skip).1;
    }
}
