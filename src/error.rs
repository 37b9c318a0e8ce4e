//! Errors raised by the guest-side library.
//!
//! Every variant is fatal to the running test. [`HarnessError::outcome`] tells
//! the reporter which severity the guest should halt with.

use thiserror::Error;

use crate::layout::TestResult;

/// Guest-side library error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HarnessError {
    /// Segment limits are 20-bit quantities.
    #[error("Segment limit out of range: {0:#x}")]
    SegmentLimitOutOfRange(u32),

    /// A descriptor base does not fit the descriptor form that must hold it.
    #[error("Segment base out of range: {0:#x}")]
    SegmentBaseOutOfRange(u64),

    #[error("Descriptor index {0} out of range")]
    DescriptorIndexOutOfRange(usize),

    #[error("Descriptor table is full")]
    DescriptorTableFull,

    #[error("Interrupt vector {0} out of range")]
    VectorOutOfRange(usize),

    #[error("Heap exhausted: requested {requested:#x} bytes, {available:#x} left")]
    HeapExhausted { requested: usize, available: usize },

    #[error("Invalid alignment {0:#x}")]
    InvalidAlignment(usize),

    #[error("Invalid SVM intercept ID {0}")]
    InvalidIntercept(u32),

    #[error("Address {0:#x} is not mapped")]
    PageNotMapped(u64),

    /// A VMX instruction reported VMfailValid or VMfailInvalid.
    #[error("{instruction}({target:#x}) failed: {reason}")]
    VmxInstructionFailed {
        instruction: &'static str,
        target: u64,
        reason: &'static str,
    },

    /// The nested guest never started: the exit reason reports an entry failure.
    #[error("Nested VM entry failed: reason {reason:#x}, qualification {qualification:#x}")]
    NestedEntryFailed { reason: u64, qualification: u64 },

    /// A hardware or configuration prerequisite is missing.
    #[error("{0}")]
    Unsupported(&'static str),
}

impl HarnessError {
    /// The outcome the guest reports before halting on this error.
    pub const fn outcome(&self) -> TestResult {
        match self {
            Self::Unsupported(_) => TestResult::Conf,
            _ => TestResult::Broken,
        }
    }
}

/// Library result type.
pub type Result<T = ()> = core::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            HarnessError::Unsupported("SVM is not supported").outcome(),
            TestResult::Conf
        );
        assert_eq!(HarnessError::DescriptorTableFull.outcome(), TestResult::Broken);
        assert_eq!(
            HarnessError::NestedEntryFailed {
                reason: 33,
                qualification: 0
            }
            .outcome(),
            TestResult::Broken
        );
    }

    #[test]
    fn test_display() {
        let err = HarnessError::VmxInstructionFailed {
            instruction: "VMPTRLD",
            target: 0x2000,
            reason: "VMPTRLD with invalid physical address",
        };
        assert_eq!(
            err.to_string(),
            "VMPTRLD(0x2000) failed: VMPTRLD with invalid physical address"
        );
    }
}
