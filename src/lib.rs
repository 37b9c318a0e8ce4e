#![cfg_attr(not(any(test, feature = "host")), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

pub mod error;
pub mod layout;
pub mod x86;
#[macro_use]
pub mod guest;

cfg_if::cfg_if! {
    if #[cfg(feature = "svm")] {
        pub mod svm;
        pub use svm::{SvmExitCode, SvmExitInfo, SvmIntercept, SvmPerCpuState, SvmVcpu};
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "vmx")] {
        pub mod vmx;
        pub use vmx::{VmxExitInfo, VmxExitReason, VmxPerCpuState, VmxVcpu};
    }
}

#[cfg(feature = "host")]
pub mod host;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
mod tests;

pub use error::{HarnessError, Result};
pub use guest::{BumpHeap, GuestRuntime, InterruptTable, ResultChannel};
pub use layout::{ResultRecord, TestResult};
pub use x86::{CpuOps, GeneralRegisters, Msr};
