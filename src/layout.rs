//! Guest-physical memory layout and the Result Record shared by host and guest.
//!
//! The host builder places the bootstrap structures at these addresses and the
//! guest runtime finds them there. Everything below [`PAYLOAD_BASE`] belongs to
//! the harness; the payload and its heap live above it.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use memory_addr::PAGE_SIZE_4K;

/// Guest page size.
pub const PAGE_SIZE: usize = PAGE_SIZE_4K;

/// Global descriptor table.
pub const GDT_ADDR: u64 = 0x1000;
/// Number of 8-byte slots in the bootstrap GDT.
pub const GDT_ENTRIES: usize = 32;
/// Interrupt descriptor table, 256 16-byte gates.
pub const IDT_ADDR: u64 = 0x2000;
/// Code run by every gate until the guest runtime installs its own handlers.
pub const DEFAULT_INTERRUPT_STUB_ADDR: u64 = 0x3000;
/// Long-mode entry code the reset stub jumps to, followed by its table
/// pointers.
pub const BOOT_CODE_ADDR: u64 = 0x3800;
/// [`BootInfo`] block.
pub const BOOT_INFO_ADDR: u64 = 0x4000;
/// Paging structures: one PML4, one PDPT, four page directories covering
/// 4 GiB and one page table for the first 2 MiB.
pub const PML4_ADDR: u64 = 0x5000;
pub const PDPT_ADDR: u64 = 0x6000;
pub const PD_ADDR: u64 = 0x7000;
pub const PD_COUNT: usize = 4;
pub const LOW_PT_ADDR: u64 = 0xb000;
/// 64-bit task state segment.
pub const TSS_ADDR: u64 = 0xc000;
pub const TSS_SIZE: usize = 0x68;

/// Initial stack pointer of the boot CPU.
pub const BOOT_STACK_TOP: u64 = 0x8_0000;
/// Load address and entry point of the flat payload image.
pub const PAYLOAD_BASE: u64 = 0x10_0000;

/// Page holding the [`ResultRecord`].
pub const RESULT_BASEADDR: u64 = 0xffff_f000;
pub const RESULT_SIZE: usize = PAGE_SIZE;
/// Architectural reset address, inside the result page.
pub const RESET_VECTOR: u64 = 0xffff_fff0;
/// Size of the reset stub area.
pub const RESET_STUB_SIZE: usize = 16;

/// KVM keeps three pages of real-mode TSS here.
pub const KVM_TSS_ADDR: u64 = 0xfffb_d000;
/// KVM's identity page table for unpaged protected mode, one page below the
/// TSS. Guest RAM must stay below both.
pub const KVM_IDENTITY_MAP_ADDR: u64 = KVM_TSS_ADDR - PAGE_SIZE as u64;
pub const RAM_CEILING: u64 = KVM_IDENTITY_MAP_ADDR;
pub const MIN_RAM_SIZE: usize = 4 << 20;

/// Maximum number of memory regions per VM instance.
pub const MAX_REGIONS: usize = 8;

/// Bootstrap GDT selectors.
pub const CODE64_SELECTOR: u16 = 0x08;
pub const DATA_SELECTOR: u16 = 0x10;
pub const TSS_SELECTOR: u16 = 0x18;
/// Flat 32-bit code segment the vCPU starts in. Follows the two-slot TSS.
pub const CODE32_SELECTOR: u16 = 0x28;

pub const RESULT_HEADER_SIZE: usize = 16;
/// Message capacity including the NUL terminator.
pub const MESSAGE_CAPACITY: usize = (RESET_VECTOR - RESULT_BASEADDR) as usize - RESULT_HEADER_SIZE;

const _: () = assert!(IDT_ADDR - GDT_ADDR >= (GDT_ENTRIES * 8) as u64);
const _: () = assert!(PD_ADDR + (PD_COUNT * PAGE_SIZE) as u64 == LOW_PT_ADDR);
const _: () = assert!(TSS_ADDR + TSS_SIZE as u64 <= 0x1_0000);
const _: () = assert!(BOOT_STACK_TOP <= PAYLOAD_BASE);
const _: () = assert!(BOOT_CODE_ADDR > DEFAULT_INTERRUPT_STUB_ADDR && BOOT_CODE_ADDR < BOOT_INFO_ADDR);
const _: () = assert!(RESET_VECTOR + RESET_STUB_SIZE as u64 == RESULT_BASEADDR + RESULT_SIZE as u64);
const _: () = assert!(core::mem::size_of::<ResultRecord>() == (RESET_VECTOR - RESULT_BASEADDR) as usize);

/// No result has been written since the host last cleared the record.
pub const RESULT_NONE: i32 = -1;
/// The payload finished; the record holds its final result.
pub const RESULT_EXIT: i32 = 0xff;
/// The guest posted a signal and may be waiting for the host to clear it.
pub const RESULT_SYNC: i32 = 0xfe;
/// Mask extracting the outcome type from a result code.
pub const RESULT_TYPE_MASK: i32 = 0x3f;

numeric_enum_macro::numeric_enum! {
    #[repr(i32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Outcome codes understood by the test framework.
    pub enum TestResult {
        Pass = 0,
        Fail = 1,
        Broken = 2,
        Warn = 4,
        Info = 16,
        Conf = 32,
    }
}

impl TestResult {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decodes the outcome type of a raw result code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::try_from(code & RESULT_TYPE_MASK).ok()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Pass => "TPASS",
            Self::Fail => "TFAIL",
            Self::Broken => "TBROK",
            Self::Warn => "TWARN",
            Self::Info => "TINFO",
            Self::Conf => "TCONF",
        }
    }
}

impl core::fmt::Display for TestResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// The single structure shared between host and guest.
///
/// The writer fills `line`, `file_addr` and the message, then publishes
/// `result` with release ordering. The reader loads `result` with acquire
/// ordering before touching anything else. The message is only accessed while
/// the other side is known not to be writing it: the guest writes before it
/// halts or signals, the host reads after the run primitive returned or after
/// it observed [`RESULT_SYNC`].
#[repr(C)]
pub struct ResultRecord {
    result: AtomicI32,
    line: AtomicI32,
    file_addr: AtomicU64,
    message: UnsafeCell<[u8; MESSAGE_CAPACITY]>,
}

// SAFETY: the message buffer is guarded by the publish protocol above.
unsafe impl Sync for ResultRecord {}

impl ResultRecord {
    pub const fn new() -> Self {
        Self {
            result: AtomicI32::new(RESULT_NONE),
            line: AtomicI32::new(0),
            file_addr: AtomicU64::new(0),
            message: UnsafeCell::new([0; MESSAGE_CAPACITY]),
        }
    }

    /// # Safety
    ///
    /// `addr` must point to a mapped, suitably aligned Result Record page that
    /// stays mapped for `'a`.
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a Self {
        unsafe { &*(addr as *const Self) }
    }

    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    pub fn line(&self) -> i32 {
        self.line.load(Ordering::Relaxed)
    }

    pub fn file_addr(&self) -> u64 {
        self.file_addr.load(Ordering::Relaxed)
    }

    /// Stores the header fields and lets `fill` write the message, then
    /// publishes the result code `fill` returns.
    ///
    /// # Safety
    ///
    /// The caller must be the only writer and the reader must not be reading
    /// the message concurrently.
    pub unsafe fn publish(
        &self,
        line: i32,
        file_addr: u64,
        fill: impl FnOnce(&mut [u8; MESSAGE_CAPACITY]) -> i32,
    ) {
        self.line.store(line, Ordering::Relaxed);
        self.file_addr.store(file_addr, Ordering::Relaxed);
        let result = fill(unsafe { &mut *self.message.get() });
        self.result.store(result, Ordering::Release);
    }

    /// Stores a correlation value and publishes [`RESULT_SYNC`].
    pub fn post_signal(&self, data: u64) {
        self.file_addr.store(data, Ordering::Relaxed);
        self.result.store(RESULT_SYNC, Ordering::Release);
    }

    /// Resets the record to [`RESULT_NONE`].
    pub fn clear(&self) {
        self.result.store(RESULT_NONE, Ordering::Release);
    }

    /// Returns the message bytes up to the first NUL.
    ///
    /// # Safety
    ///
    /// The writer must not be writing the message concurrently.
    pub unsafe fn message(&self) -> &[u8] {
        let buf = unsafe { &*self.message.get() };
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        &buf[..len]
    }
}

impl Default for ResultRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Value of [`BootInfo::magic`] once the host has filled the block.
pub const BOOT_INFO_MAGIC: u64 = 0x4f46_4e49_5453_4554;

/// Placed by the host at [`BOOT_INFO_ADDR`] so the guest knows its RAM layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub magic: u64,
    pub ram_size: u64,
    pub heap_start: u64,
    pub heap_end: u64,
    pub payload_base: u64,
    pub payload_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_record_layout() {
        use memoffset::offset_of;

        assert_eq!(offset_of!(ResultRecord, result), 0);
        assert_eq!(offset_of!(ResultRecord, line), 4);
        assert_eq!(offset_of!(ResultRecord, file_addr), 8);
        assert_eq!(offset_of!(ResultRecord, message), 16);
        assert_eq!(MESSAGE_CAPACITY, 0xfe0);
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(TestResult::from_code(0), Some(TestResult::Pass));
        assert_eq!(TestResult::from_code(32), Some(TestResult::Conf));
        assert_eq!(TestResult::from_code(2 | 0x40), Some(TestResult::Broken));
        assert_eq!(TestResult::from_code(3), None);
        assert_eq!(TestResult::from_code(RESULT_NONE), None);
        assert_eq!(TestResult::Warn.name(), "TWARN");
    }

    #[test]
    fn test_record_publish_and_clear() {
        let record = ResultRecord::new();
        assert_eq!(record.result(), RESULT_NONE);

        unsafe {
            record.publish(42, 0x1234, |msg| {
                msg[..6].copy_from_slice(b"hello\0");
                TestResult::Pass.code()
            });
            assert_eq!(record.message(), b"hello");
        }
        assert_eq!(record.result(), 0);
        assert_eq!(record.line(), 42);
        assert_eq!(record.file_addr(), 0x1234);

        record.post_signal(7);
        assert_eq!(record.result(), RESULT_SYNC);
        assert_eq!(record.file_addr(), 7);

        record.clear();
        assert_eq!(record.result(), RESULT_NONE);
    }
}
