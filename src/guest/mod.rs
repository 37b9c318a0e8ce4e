//! Runtime for test payloads running inside the KVM guest.
//!
//! A payload gets a [`GuestRuntime`] and reports through the [`tst_res!`],
//! [`tst_brk!`] and [`tst_check!`] macros, which record the calling file and
//! line for the host.

mod format;
mod heap;
mod interrupts;
mod logger;
mod report;
mod runtime;

#[cfg(target_os = "none")]
pub mod entry;

pub use format::{FormatArg, FormatError, divmod_u64_u16, format};
pub use heap::BumpHeap;
pub use interrupts::{InterruptCallback, InterruptContext, InterruptTable, UnhandledInterrupt};
pub use logger::GuestLogger;
pub use report::{Reporter, ResultChannel};
pub use runtime::{GuestRuntime, NESTED_STACK_PAGES, RuntimeSlot};
#[cfg(any(feature = "svm", feature = "vmx"))]
pub(crate) use runtime::nested_stack;

/// Posts a checkpoint result and yields to the host.
///
/// `tst_res!(rt, TestResult::Pass, "value %d", x)`; `rt` is anything
/// implementing [`Reporter`].
#[macro_export]
macro_rules! tst_res {
    ($rt:expr, $result:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {{
        use $crate::guest::Reporter as _;
        $rt.report(
            $result,
            concat!(file!(), "\0"),
            line!(),
            $fmt,
            &[$($crate::guest::FormatArg::from($arg)),*],
        )
    }};
}

/// Posts a result and stops the guest.
#[macro_export]
macro_rules! tst_brk {
    ($rt:expr, $result:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {{
        use $crate::guest::Reporter as _;
        $rt.abort(
            $result,
            concat!(file!(), "\0"),
            line!(),
            $fmt,
            &[$($crate::guest::FormatArg::from($arg)),*],
        )
    }};
}

/// Unwraps a library `Result`, stopping the guest with the error otherwise.
#[macro_export]
macro_rules! tst_check {
    ($rt:expr, $res:expr $(,)?) => {{
        use $crate::guest::Reporter as _;
        let res = $res;
        $rt.check(res, concat!(file!(), "\0"), line!())
    }};
}
