use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::instance::{InstanceState, Report};
use crate::error::HarnessError;
use crate::layout::TestResult;

/// Host-side harness error.
#[derive(Debug, Error)]
pub enum HostError {
    /// A KVM ioctl failed.
    #[error("{op} failed: {source}")]
    Kvm {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Layout(#[from] HarnessError),

    #[error("Memory slot {0} out of range")]
    SlotOutOfRange(usize),

    #[error("Memory slot {0} is already in use")]
    SlotBusy(usize),

    #[error("Guest range {addr:#x}+{len:#x} is not backed by any memory region")]
    Unbacked { addr: u64, len: usize },

    #[error("Invalid guest RAM size {0:#x}")]
    InvalidRamSize(usize),

    #[error("Payload of {size:#x} bytes does not fit below {limit:#x}")]
    PayloadTooLarge { size: usize, limit: u64 },

    #[error("KVM {0} has already been released")]
    Released(&'static str),

    #[error("Operation not valid in instance state {0:?}")]
    InvalidState(InstanceState),

    #[error("KVM test did not return any result")]
    NoResult,

    #[error("KVM test returned invalid result value {0}")]
    InvalidResult(i32),

    #[error("Unexpected VM exit {exit}, RIP={rip:#x}")]
    UnexpectedExit { exit: String, rip: u64 },

    /// The guest reported `TBROK`.
    #[error("{0}")]
    GuestBroken(Report),

    /// A host prerequisite is missing.
    #[error("{0}")]
    Unsupported(String),
}

impl HostError {
    pub(crate) fn kvm(op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> Self {
        move |source| Self::Kvm { op, source }
    }

    /// The errno behind a failed system call, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kvm { source, .. } => Some(source.errno()),
            Self::Io(err) | Self::File { source: err, .. } => err.raw_os_error(),
            _ => None,
        }
    }

    /// The outcome a test ends with when it fails with this error.
    pub fn outcome(&self) -> TestResult {
        match self {
            Self::Unsupported(_) => TestResult::Conf,
            Self::Layout(err) => err.outcome(),
            _ => TestResult::Broken,
        }
    }
}

/// Host result type.
pub type Result<T = ()> = std::result::Result<T, HostError>;
