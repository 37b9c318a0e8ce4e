//! Initial guest address space and the vCPU state the payload starts with.
//!
//! The host writes identity-mapped page tables, a GDT, an IDT and a TSS into
//! low RAM. The vCPU starts at [`RESET_VECTOR`] in flat 32-bit protected mode
//! with paging off. The reset stub jumps to the boot code at
//! [`BOOT_CODE_ADDR`], which enables PAE, long mode and paging, enters the
//! 64-bit code segment, loads the data selectors, TR and IDT and jumps to
//! the payload.

use memory_addr::align_up;

use super::memory::GuestMemory;
use super::{HostError, Result};
use crate::layout::*;
use crate::x86::interrupt::NUM_VECTORS;
use crate::x86::{
    Cr0Flags, Cr4Flags, DescriptorMode, DescriptorTable, EferFlags, IdtGate, PageTableEntry, PageTableFlags,
    Msr, PageTableMemory, SegmentFlags, TablePointer,
};

const HUGE_PAGE_SIZE: u64 = 0x20_0000;
const ENTRIES_PER_TABLE: u64 = 512;

/// Message the default interrupt stub stores before halting.
const UNHANDLED_INTERRUPT_MESSAGE: &[u8] = b"Unhandled interrupt before the guest runtime was ready\0";
/// Offset of the message within the stub page.
const STUB_MESSAGE_OFFSET: u64 = 0x40;
/// Table pointers the boot code loads, after its instructions.
const BOOT_GDT_POINTER: u64 = BOOT_CODE_ADDR + 0x100;
const BOOT_IDT_POINTER: u64 = BOOT_CODE_ADDR + 0x110;

/// A segment register as the backend loads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSegment {
    pub selector: u16,
    pub base: u64,
    /// Byte-granular limit.
    pub limit: u32,
    pub flags: SegmentFlags,
}

impl BootSegment {
    fn from_table(table: &DescriptorTable<'_>, selector: u16) -> Result<Self> {
        let desc = table.descriptor((selector >> 3) as usize)?;
        Ok(Self {
            selector,
            base: desc.base,
            limit: desc.limit,
            flags: desc.flags,
        })
    }
}

/// vCPU state at the first instruction: flat 32-bit protected mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub cs: BootSegment,
    /// Loaded into DS, ES, FS, GS and SS.
    pub data: BootSegment,
    pub tr: BootSegment,
    pub gdt: TablePointer,
    pub idt: TablePointer,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// Writes the boot structures and `payload` into the RAM region of `mem`,
/// which must cover `0..ram_size`.
pub fn build(mem: &mut GuestMemory, ram_size: usize, payload: &[u8]) -> Result<BootState> {
    let payload_end = PAYLOAD_BASE + payload.len() as u64;
    if payload_end > ram_size as u64 {
        return Err(HostError::PayloadTooLarge {
            size: payload.len(),
            limit: (ram_size as u64).saturating_sub(PAYLOAD_BASE),
        });
    }

    write_page_tables(mem)?;
    let (cs, data, tr, gdt) = write_gdt(mem)?;
    mem.write_bytes(TSS_ADDR, &[0; TSS_SIZE])?;
    // No I/O permission bitmap.
    mem.write_bytes(TSS_ADDR + 0x66, &(TSS_SIZE as u16).to_le_bytes())?;
    let idt = write_idt(mem)?;
    write_table_pointer(mem, BOOT_GDT_POINTER, gdt)?;
    write_table_pointer(mem, BOOT_IDT_POINTER, idt)?;
    mem.write_bytes(BOOT_CODE_ADDR, &boot_code(PAYLOAD_BASE))?;
    mem.write_bytes(DEFAULT_INTERRUPT_STUB_ADDR, &default_stub())?;
    mem.write_bytes(
        DEFAULT_INTERRUPT_STUB_ADDR + STUB_MESSAGE_OFFSET,
        UNHANDLED_INTERRUPT_MESSAGE,
    )?;

    let boot_info = BootInfo {
        magic: BOOT_INFO_MAGIC,
        ram_size: ram_size as u64,
        heap_start: align_up(payload_end as usize, PAGE_SIZE) as u64,
        heap_end: ram_size as u64,
        payload_base: PAYLOAD_BASE,
        payload_size: payload.len() as u64,
    };
    write_boot_info(mem, &boot_info)?;
    mem.write_bytes(PAYLOAD_BASE, payload)?;
    mem.write_bytes(RESET_VECTOR, &reset_stub(BOOT_CODE_ADDR))?;
    debug!("guest boot info: {:x?}", boot_info);

    Ok(BootState {
        cr0: (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::EXTENSION_TYPE | Cr0Flags::NUMERIC_ERROR).bits(),
        cr3: 0,
        cr4: 0,
        efer: 0,
        cs,
        data,
        tr,
        gdt,
        // The gates are 64-bit; the boot code loads the table in long mode.
        idt: TablePointer { base: 0, limit: 0 },
        rip: RESET_VECTOR,
        rsp: BOOT_STACK_TOP,
        rflags: 0x2,
    })
}

/// Control register values the boot code switches to.
fn long_mode_cr0() -> u32 {
    (Cr0Flags::PROTECTED_MODE_ENABLE
        | Cr0Flags::MONITOR_COPROCESSOR
        | Cr0Flags::EXTENSION_TYPE
        | Cr0Flags::NUMERIC_ERROR
        | Cr0Flags::WRITE_PROTECT
        | Cr0Flags::PAGING)
        .bits() as u32
}

fn long_mode_cr4() -> u32 {
    (Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE).bits() as u32
}

fn long_mode_efer() -> u32 {
    (EferFlags::LONG_MODE_ENABLE | EferFlags::NO_EXECUTE_ENABLE).bits() as u32
}

fn mov_eax(code: &mut Vec<u8>, imm: u32) {
    code.push(0xb8);
    code.extend(imm.to_le_bytes());
}

/// Switches from flat 32-bit protected mode to 64-bit mode and jumps to
/// `entry`. Runs at [`BOOT_CODE_ADDR`].
fn boot_code(entry: u64) -> Vec<u8> {
    let mut code = Vec::new();
    mov_eax(&mut code, BOOT_GDT_POINTER as u32);
    code.extend([0x0f, 0x01, 0x10]); // lgdt [eax]
    mov_eax(&mut code, long_mode_cr4());
    code.extend([0x0f, 0x22, 0xe0]); // mov cr4, eax
    mov_eax(&mut code, PML4_ADDR as u32);
    code.extend([0x0f, 0x22, 0xd8]); // mov cr3, eax
    code.push(0xb9); // mov ecx, IA32_EFER
    code.extend((Msr::IA32_EFER as u32).to_le_bytes());
    mov_eax(&mut code, long_mode_efer());
    code.extend([0x31, 0xd2, 0x0f, 0x30]); // xor edx, edx; wrmsr
    mov_eax(&mut code, long_mode_cr0());
    code.extend([0x0f, 0x22, 0xc0]); // mov cr0, eax

    // jmp far CODE64_SELECTOR:1f
    let target = BOOT_CODE_ADDR as u32 + code.len() as u32 + 7;
    code.push(0xea);
    code.extend(target.to_le_bytes());
    code.extend(CODE64_SELECTOR.to_le_bytes());

    // 1: 64-bit mode from here on.
    mov_eax(&mut code, DATA_SELECTOR as u32);
    code.extend([0x8e, 0xd8, 0x8e, 0xc0, 0x8e, 0xd0, 0x8e, 0xe0, 0x8e, 0xe8]); // mov ds/es/ss/fs/gs, eax
    mov_eax(&mut code, TSS_SELECTOR as u32);
    code.extend([0x0f, 0x00, 0xd8]); // ltr ax
    mov_eax(&mut code, BOOT_IDT_POINTER as u32);
    code.extend([0x0f, 0x01, 0x18]); // lidt [rax]
    code.push(0xbc); // mov esp, stack top
    code.extend((BOOT_STACK_TOP as u32).to_le_bytes());
    mov_eax(&mut code, entry as u32);
    code.extend([0xff, 0xe0]); // jmp rax
    code
}

fn write_table_pointer(mem: &GuestMemory, addr: u64, pointer: TablePointer) -> Result {
    let mut bytes = [0u8; 10];
    bytes[..2].copy_from_slice(&pointer.limit.to_le_bytes());
    bytes[2..].copy_from_slice(&pointer.base.to_le_bytes());
    mem.write_bytes(addr, &bytes)
}

/// Identity-maps the low 4 GiB: 4 KiB pages below 2 MiB with page 0 left
/// unmapped, 2 MiB pages above.
fn write_page_tables(mem: &mut GuestMemory) -> Result {
    let table = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let huge = table | PageTableFlags::HUGE_PAGE;
    let mut set = |addr: u64, entry: PageTableEntry| {
        mem.write_entry(addr, entry)
            .ok_or(HostError::Unbacked { addr, len: 8 })
    };

    set(PML4_ADDR, PageTableEntry::new(PDPT_ADDR, table))?;
    for pd in 0..PD_COUNT as u64 {
        let pd_addr = PD_ADDR + pd * PAGE_SIZE as u64;
        set(PDPT_ADDR + pd * 8, PageTableEntry::new(pd_addr, table))?;
        for index in 0..ENTRIES_PER_TABLE {
            let entry = if pd == 0 && index == 0 {
                PageTableEntry::new(LOW_PT_ADDR, table)
            } else {
                PageTableEntry::new((pd * ENTRIES_PER_TABLE + index) * HUGE_PAGE_SIZE, huge)
            };
            set(pd_addr + index * 8, entry)?;
        }
    }
    set(LOW_PT_ADDR, PageTableEntry::empty())?;
    for page in 1..ENTRIES_PER_TABLE {
        set(LOW_PT_ADDR + page * 8, PageTableEntry::new(page * PAGE_SIZE as u64, table))?;
    }
    Ok(())
}

fn write_gdt(mem: &GuestMemory) -> Result<(BootSegment, BootSegment, BootSegment, TablePointer)> {
    let mut entries = [0u64; GDT_ENTRIES];
    let mut gdt = DescriptorTable::new(&mut entries, DescriptorMode::Long);
    gdt.set_descriptor((CODE64_SELECTOR >> 3) as usize, 0, 0xfffff, SegmentFlags::CODE64)?;
    gdt.set_descriptor((DATA_SELECTOR >> 3) as usize, 0, 0xfffff, SegmentFlags::DATA)?;
    gdt.set_descriptor((TSS_SELECTOR >> 3) as usize, TSS_ADDR, TSS_SIZE as u32 - 1, SegmentFlags::TSS64)?;
    gdt.set_descriptor((CODE32_SELECTOR >> 3) as usize, 0, 0xfffff, SegmentFlags::CODE32)?;

    let cs = BootSegment::from_table(&gdt, CODE32_SELECTOR)?;
    let data = BootSegment::from_table(&gdt, DATA_SELECTOR)?;
    let tr = BootSegment::from_table(&gdt, TSS_SELECTOR)?;

    let bytes: Vec<u8> = entries.iter().flat_map(|e| e.to_le_bytes()).collect();
    mem.write_bytes(GDT_ADDR, &bytes)?;
    let pointer = TablePointer {
        base: GDT_ADDR,
        limit: (GDT_ENTRIES * 8 - 1) as u16,
    };
    Ok((cs, data, tr, pointer))
}

fn write_idt(mem: &GuestMemory) -> Result<TablePointer> {
    let gate = IdtGate::interrupt(DEFAULT_INTERRUPT_STUB_ADDR, CODE64_SELECTOR).to_bytes();
    let bytes: Vec<u8> = gate.iter().copied().cycle().take(NUM_VECTORS * gate.len()).collect();
    mem.write_bytes(IDT_ADDR, &bytes)?;
    Ok(TablePointer {
        base: IDT_ADDR,
        limit: (bytes.len() - 1) as u16,
    })
}

/// Handler every gate points at until the guest installs its own IDT:
/// copies the message into the Result Record, publishes `TBROK` and halts for
/// good.
fn default_stub() -> Vec<u8> {
    let message = (DEFAULT_INTERRUPT_STUB_ADDR + STUB_MESSAGE_OFFSET) as u32;
    let record = RESULT_BASEADDR as u32;
    let mut code = vec![0xfa]; // cli
    code.push(0xbe); // mov esi, message
    code.extend(message.to_le_bytes());
    code.push(0xbf); // mov edi, record.message
    code.extend((record + RESULT_HEADER_SIZE as u32).to_le_bytes());
    code.push(0xb9); // mov ecx, len
    code.extend((UNHANDLED_INTERRUPT_MESSAGE.len() as u32).to_le_bytes());
    code.extend([0xfc, 0xf3, 0xa4]); // cld; rep movsb
    code.push(0xbf); // mov edi, record
    code.extend(record.to_le_bytes());
    code.extend([0xc7, 0x07]); // mov dword [rdi], TBROK
    code.extend(TestResult::Broken.code().to_le_bytes());
    code.extend([0xf4, 0xeb, 0xfd]); // 1: hlt; jmp 1b
    code
}

/// `mov eax, entry; jmp eax; nop`, padded to the end of the address space.
fn reset_stub(entry: u64) -> [u8; RESET_STUB_SIZE] {
    let mut stub = [0x90; RESET_STUB_SIZE];
    stub[0] = 0xb8;
    stub[1..5].copy_from_slice(&(entry as u32).to_le_bytes());
    stub[5..7].copy_from_slice(&[0xff, 0xe0]);
    stub
}

fn write_boot_info(mem: &GuestMemory, info: &BootInfo) -> Result {
    let fields = [
        info.magic,
        info.ram_size,
        info.heap_start,
        info.heap_end,
        info.payload_base,
        info.payload_size,
    ];
    let bytes: Vec<u8> = fields.iter().flat_map(|f| f.to_le_bytes()).collect();
    mem.write_bytes(BOOT_INFO_ADDR, &bytes)
}
