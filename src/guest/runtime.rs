use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::heap::BumpHeap;
use super::interrupts::{InterruptCallback, InterruptTable};
use super::report::{Reporter, ResultChannel};
use crate::layout::TestResult;
use crate::x86::{CpuOps, InterruptFrame};
#[cfg(any(feature = "svm", feature = "vmx"))]
use crate::{error::Result, x86::DescriptorTable};
#[cfg(any(feature = "svm", feature = "vmx"))]
use memory_addr::PAGE_SIZE_4K;

#[cfg(feature = "svm")]
use crate::svm::SvmPerCpuState;
#[cfg(feature = "vmx")]
use crate::vmx::VmxPerCpuState;

/// Everything a test payload works with: the CPU, the result channel, the
/// heap, the interrupt callbacks and the nested virtualization state.
pub struct GuestRuntime<'a, C: CpuOps> {
    pub(crate) cpu: C,
    pub(crate) channel: ResultChannel<'a>,
    pub(crate) heap: BumpHeap<'a>,
    pub(crate) interrupts: InterruptTable<C>,
    #[cfg(feature = "svm")]
    pub(crate) svm: SvmPerCpuState<'a>,
    #[cfg(feature = "vmx")]
    pub(crate) vmx: VmxPerCpuState<'a>,
}

impl<'a, C: CpuOps> GuestRuntime<'a, C> {
    pub fn new(cpu: C, channel: ResultChannel<'a>, heap: BumpHeap<'a>) -> Self {
        Self {
            cpu,
            channel,
            heap,
            interrupts: InterruptTable::new(),
            #[cfg(feature = "svm")]
            svm: SvmPerCpuState::new(),
            #[cfg(feature = "vmx")]
            vmx: VmxPerCpuState::new(),
        }
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn heap(&mut self) -> &mut BumpHeap<'a> {
        &mut self.heap
    }

    /// Installs the callback for `vector`. An out-of-range vector aborts the
    /// test.
    pub fn set_interrupt_callback(&mut self, vector: usize, callback: Option<InterruptCallback<C>>, user_data: usize) {
        let res = self.interrupts.set_callback(vector, callback, user_data);
        self.check(res, concat!(file!(), "\0"), line!());
    }

    /// Entry point of every interrupt stub.
    ///
    /// Aborts the test if no callback claims the interrupt.
    pub fn handle_interrupt(&self, vector: usize, frame: &mut InterruptFrame, error_code: u64) {
        let Err(unhandled) = self
            .interrupts
            .dispatch(&self.cpu, self.channel, vector, frame, error_code)
        else {
            return;
        };

        let file = concat!(file!(), "\0");
        match unhandled.name() {
            Some(name) => self.abort(
                TestResult::Broken,
                file,
                line!(),
                "Unhandled interrupt %s at 0x%lx",
                &[name.into(), unhandled.ip.into()],
            ),
            None => self.abort(
                TestResult::Broken,
                file,
                line!(),
                "Unexpected interrupt %zu at 0x%lx",
                &[unhandled.vector.into(), unhandled.ip.into()],
            ),
        }
    }

    /// Signals the host without waiting.
    pub fn signal_host(&self, data: u64) {
        self.channel.signal_host(data);
    }

    /// Signals the host and blocks until it acknowledges.
    pub fn wait_host(&self, data: u64) {
        self.channel.wait_host(data);
    }

    /// Finishes the test. Never returns: if the host resumes the guest anyway
    /// the test is broken.
    pub fn exit(&self) -> ! {
        self.channel.post_exit();
        self.cpu.halt();
        self.abort(
            TestResult::Broken,
            concat!(file!(), "\0"),
            line!(),
            "Test exit resumed execution",
            &[],
        )
    }
}

/// Where the interrupt entry finds the running [`GuestRuntime`].
pub struct RuntimeSlot<C: CpuOps + 'static>(AtomicPtr<GuestRuntime<'static, C>>);

impl<C: CpuOps + 'static> RuntimeSlot<C> {
    pub const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    /// Publishes `rt` and hands it back reborrowed from the pointer the
    /// interrupt path dereferences, so both go through the same provenance.
    ///
    /// # Safety
    ///
    /// `rt` must stay in place for as long as interrupts can be dispatched.
    pub unsafe fn install<'r>(&self, rt: &'r mut GuestRuntime<'static, C>) -> &'r mut GuestRuntime<'static, C> {
        let raw: *mut GuestRuntime<'static, C> = rt;
        self.0.store(raw, Ordering::Release);
        // SAFETY: `raw` comes from a live exclusive reference.
        unsafe { &mut *raw }
    }

    /// Dispatches to the installed runtime. Returns `false` if there is none.
    ///
    /// # Safety
    ///
    /// Must only be called from the interrupt path of the CPU that installed
    /// the runtime, while the runtime is still in place.
    pub unsafe fn handle_interrupt(&self, vector: usize, frame: &mut InterruptFrame, error_code: u64) -> bool {
        let rt = self.0.load(Ordering::Acquire);
        if rt.is_null() {
            return false;
        }
        // SAFETY: interrupts are synchronous on a single CPU and the caller
        // guarantees the runtime is alive.
        unsafe { (*rt).handle_interrupt(vector, frame, error_code) };
        true
    }
}

impl<C: CpuOps + 'static> Default for RuntimeSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pages of stack given to a nested guest.
pub const NESTED_STACK_PAGES: usize = 2;

/// Stack segment selector and initial RSP of a new nested guest.
///
/// With `alloc_stack` the guest gets a fresh stack covered by its own
/// expand-down segment in `gdt`. Otherwise it shares the current SS and starts
/// with RSP 0.
#[cfg(any(feature = "svm", feature = "vmx"))]
pub(crate) fn nested_stack(
    cpu: &impl CpuOps,
    heap: &mut BumpHeap<'_>,
    gdt: &mut DescriptorTable<'_>,
    alloc_stack: bool,
) -> Result<(u16, u64)> {
    if !alloc_stack {
        return Ok((cpu.segment_selectors().ss, 0));
    }
    let stack = heap.alloc_aligned(NESTED_STACK_PAGES * PAGE_SIZE_4K, PAGE_SIZE_4K)?;
    let base = stack.as_ptr() as u64;
    let index = gdt.create_stack_descriptor(base)?;
    Ok(((index << 3) as u16, base + stack.len() as u64))
}

impl<C: CpuOps> Reporter for GuestRuntime<'_, C> {
    fn channel(&self) -> ResultChannel<'_> {
        self.channel
    }

    fn yield_to_host(&self) {
        self.cpu.halt();
    }

    fn halt_forever(&self) -> ! {
        self.cpu.halt_forever()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::guest::InterruptContext;
    use crate::layout::{RESULT_EXIT, ResultRecord};
    use crate::test_utils::mock::{HaltedForever, MockCpu, catch_halt};
    use crate::x86::interrupt::{GP_VECTOR, PF_VECTOR};

    fn leak_record() -> &'static ResultRecord {
        Box::leak(Box::new(ResultRecord::new()))
    }

    /// Collects what the host would read from the record at each halt.
    fn watch_halts(rt: &GuestRuntime<'_, MockCpu>, record: &'static ResultRecord) -> Rc<RefCell<Vec<(i32, String)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        rt.cpu().on_halt(move || {
            let message = String::from_utf8_lossy(unsafe { record.message() }).into_owned();
            sink.borrow_mut().push((record.result(), message));
        });
        seen
    }

    fn claim(cx: &mut InterruptContext<'_, MockCpu>) -> bool {
        cx.frame.rip = cx.user_data as u64;
        true
    }

    #[test]
    fn test_report_yields_once() {
        let record = ResultRecord::new();
        let mut arena = vec![0u8; 0x1000];
        let rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(&record), BumpHeap::new(&mut arena));

        crate::tst_res!(rt, TestResult::Pass, "checkpoint %d", 1);
        assert_eq!(record.result(), TestResult::Pass.code());
        assert_eq!(unsafe { record.message() }, b"checkpoint 1");
        assert_eq!(rt.cpu().halt_count(), 1);
    }

    #[test]
    fn test_abort_halts_forever() {
        let record = leak_record();
        let mut arena = vec![0u8; 0x1000];
        let rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(record), BumpHeap::new(&mut arena));
        let seen = watch_halts(&rt, record);

        let halted = catch_halt(|| {
            crate::tst_brk!(rt, TestResult::Conf, "missing %s", "feature");
        });
        assert_eq!(halted, HaltedForever);
        assert_eq!(*seen.borrow(), [(TestResult::Conf.code(), "missing feature".to_string())]);
        assert_eq!(record.result(), RESULT_EXIT);
    }

    #[test]
    fn test_interrupt_dispatch() {
        let record = ResultRecord::new();
        let mut arena = vec![0u8; 0x1000];
        let mut rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(&record), BumpHeap::new(&mut arena));
        rt.set_interrupt_callback(GP_VECTOR as usize, Some(claim), 0x5000);

        let mut frame = InterruptFrame::default();
        rt.handle_interrupt(GP_VECTOR as usize, &mut frame, 0);
        assert_eq!(frame.rip, 0x5000);
        assert_eq!(record.result(), crate::layout::RESULT_NONE);
    }

    #[test]
    fn test_runtime_slot_dispatch() {
        let slot = RuntimeSlot::<MockCpu>::new();
        let mut frame = InterruptFrame::default();
        assert!(!unsafe { slot.handle_interrupt(GP_VECTOR as usize, &mut frame, 0) });

        let arena: &'static mut [u8] = Box::leak(vec![0u8; 0x1000].into_boxed_slice());
        let mut rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(leak_record()), BumpHeap::new(arena));
        let rt = unsafe { slot.install(&mut rt) };
        rt.set_interrupt_callback(GP_VECTOR as usize, Some(claim), 0x7000);

        assert!(unsafe { slot.handle_interrupt(GP_VECTOR as usize, &mut frame, 0) });
        assert_eq!(frame.rip, 0x7000);
    }

    #[test]
    fn test_unhandled_interrupt_is_broken() {
        let record = leak_record();
        let mut arena = vec![0u8; 0x1000];
        let rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(record), BumpHeap::new(&mut arena));
        let seen = watch_halts(&rt, record);

        let mut frame = InterruptFrame {
            rip: 0x10_2030,
            ..Default::default()
        };
        catch_halt(|| rt.handle_interrupt(PF_VECTOR as usize, &mut frame, 0));
        catch_halt(|| rt.handle_interrupt(0x40, &mut frame, 0));
        let broken = TestResult::Broken.code();
        assert_eq!(
            *seen.borrow(),
            [
                (broken, "Unhandled interrupt Page fault at 0x102030".to_string()),
                (broken, "Unexpected interrupt 64 at 0x102030".to_string()),
            ]
        );
    }

    #[test]
    fn test_bad_vector_aborts() {
        let record = leak_record();
        let mut arena = vec![0u8; 0x1000];
        let mut rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(record), BumpHeap::new(&mut arena));
        let seen = watch_halts(&rt, record);

        catch_halt(|| rt.set_interrupt_callback(300, Some(claim), 0));
        assert_eq!(
            *seen.borrow(),
            [(TestResult::Broken.code(), "Interrupt vector 300 out of range".to_string())]
        );
    }

    #[test]
    fn test_exit_resumed_is_broken() {
        let record = leak_record();
        let mut arena = vec![0u8; 0x1000];
        let rt = GuestRuntime::new(MockCpu::new(), ResultChannel::new(record), BumpHeap::new(&mut arena));
        let seen = watch_halts(&rt, record);

        catch_halt(|| rt.exit());
        assert_eq!(
            *seen.borrow(),
            [
                (RESULT_EXIT, String::new()),
                (TestResult::Broken.code(), "Test exit resumed execution".to_string()),
            ]
        );
        assert_eq!(record.result(), RESULT_EXIT);
    }
}
