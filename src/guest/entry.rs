//! Bare-metal entry: interrupt stubs, runtime bring-up and the panic path.
//!
//! A payload binary uses [`guest_main!`](crate::guest_main) to define its
//! `_start` (placed at the payload base) and its panic handler.

use core::arch::global_asm;
use core::panic::PanicInfo;
use log::LevelFilter;

use super::{BumpHeap, GuestLogger, GuestRuntime, ResultChannel, RuntimeSlot};
use crate::layout::{BOOT_INFO_ADDR, BOOT_INFO_MAGIC, BootInfo, RESULT_BASEADDR, ResultRecord, TestResult};
use crate::x86::interrupt::NUM_VECTORS;
use crate::x86::{CpuOps, IdtGate, InterruptFrame, NativeCpu};

/// Bytes between consecutive interrupt stubs.
const STUB_SIZE: u64 = 16;

static RUNTIME: RuntimeSlot<NativeCpu> = RuntimeSlot::new();
static LOGGER: spin::Once<GuestLogger<NativeCpu>> = spin::Once::new();

unsafe extern "C" {
    fn guest_interrupt_stubs();
}

// One 16-byte stub per vector. Each pushes a dummy error code where the CPU
// does not push one, then the vector number, so the common path always sees
// the same frame.
global_asm!(
    r#"
    .pushsection .text.guest_interrupts, "ax"
    .balign 16
    .global guest_interrupt_stubs
guest_interrupt_stubs:
    .set .Lvector, 0
    .rept 256
    .balign 16
    .if (.Lvector == 8) || ((.Lvector >= 10) && (.Lvector <= 14)) || (.Lvector == 17) || (.Lvector == 21) || (.Lvector == 29) || (.Lvector == 30)
    .else
    pushq $0
    .endif
    pushq $.Lvector
    jmp .Lguest_interrupt_common
    .set .Lvector, .Lvector + 1
    .endr

.Lguest_interrupt_common:
    pushq %rax
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    leaq 88(%rsp), %rdi
    movq 72(%rsp), %rsi
    movq 80(%rsp), %rdx
    cld
    call guest_interrupt_entry
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rax
    addq $16, %rsp
    iretq
    .popsection
    "#,
    options(att_syntax)
);

#[unsafe(no_mangle)]
extern "C" fn guest_interrupt_entry(frame: *mut InterruptFrame, vector: u64, error_code: u64) {
    // SAFETY: the runtime lives on the stack of `guest_start`, which never
    // returns, and the stub passes a valid frame.
    if !unsafe { RUNTIME.handle_interrupt(vector as usize, &mut *frame, error_code) } {
        NativeCpu.halt_forever();
    }
}

/// Points every IDT gate at its stub.
fn install_interrupt_stubs(cpu: &NativeCpu) {
    let idtr = cpu.idtr();
    let cs = cpu.segment_selectors().cs;
    let stubs = guest_interrupt_stubs as *const () as u64;
    // SAFETY: the bootstrap IDT holds NUM_VECTORS 16-byte gates.
    let gates = unsafe { core::slice::from_raw_parts_mut(idtr.base as *mut [u64; 2], NUM_VECTORS) };
    for (vector, gate) in gates.iter_mut().enumerate() {
        *gate = IdtGate::interrupt(stubs + vector as u64 * STUB_SIZE, cs).words();
    }
}

fn result_channel() -> ResultChannel<'static> {
    // SAFETY: the host maps the Result Record page before the first entry.
    ResultChannel::new(unsafe { ResultRecord::from_addr(RESULT_BASEADDR as usize) })
}

/// Brings up the runtime, runs `main` and finishes the test.
pub fn guest_start(main: fn(&mut GuestRuntime<'static, NativeCpu>)) -> ! {
    let cpu = NativeCpu;
    let channel = result_channel();

    // SAFETY: the host writes the boot info block before the first entry.
    let info = unsafe { &*(BOOT_INFO_ADDR as *const BootInfo) };
    if info.magic != BOOT_INFO_MAGIC {
        channel.post(
            TestResult::Broken,
            concat!(file!(), "\0"),
            line!(),
            "Boot info block missing",
            &[],
        );
        cpu.halt_forever();
    }

    // SAFETY: the host reserved [heap_start, heap_end) for the guest heap.
    let heap = unsafe { BumpHeap::from_raw(info.heap_start as usize, info.heap_end as usize) };
    let mut rt = GuestRuntime::new(cpu, channel, heap);
    // SAFETY: `rt` stays on this stack frame, which never returns.
    let rt = unsafe { RUNTIME.install(&mut rt) };
    install_interrupt_stubs(&cpu);

    let logger = LOGGER.call_once(|| GuestLogger::new(channel, NativeCpu, LevelFilter::Info));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level());
    }

    main(rt);
    rt.exit()
}

/// Reports a panic as a broken test and stops the guest.
pub fn report_panic(info: &PanicInfo) -> ! {
    let line = info.location().map_or(0, |loc| loc.line());
    match info.location() {
        Some(loc) => result_channel().post_args(
            TestResult::Broken,
            None,
            line,
            format_args!("panicked at {}: {}", loc, info.message()),
        ),
        None => result_channel().post_args(
            TestResult::Broken,
            None,
            line,
            format_args!("panicked: {}", info.message()),
        ),
    }
    NativeCpu.halt_forever()
}

/// Defines the payload's `_start` and panic handler around `main`.
///
/// ```ignore
/// fn main(rt: &mut GuestRuntime<'static, NativeCpu>) { ... }
/// x86_kvm_harness::guest_main!(main);
/// ```
#[macro_export]
macro_rules! guest_main {
    ($main:path) => {
        #[unsafe(no_mangle)]
        #[unsafe(link_section = ".text.entry")]
        pub extern "C" fn _start() -> ! {
            $crate::guest::entry::guest_start($main)
        }

        #[panic_handler]
        fn panic(info: &core::panic::PanicInfo) -> ! {
            $crate::guest::entry::report_panic(info)
        }
    };
}
