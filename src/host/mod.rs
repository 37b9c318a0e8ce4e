//! Host side: builds the guest address space, drives the KVM vCPU and reads
//! the results the payload posts.
//!
//! A [`VmInstance`] owns one single-vCPU machine. The hypervisor itself sits
//! behind [`VmBackend`]; [`KvmBackend`] is the `/dev/kvm` implementation.

mod backend;
pub mod bootstrap;
pub mod config;
mod error;
pub mod harness;
mod instance;
pub mod memory;

pub use backend::{KvmBackend, VmBackend, VmExit};
pub use bootstrap::{BootSegment, BootState};
pub use config::{HarnessConfig, RestoreGuard, SaveRestoreEntry, SaveRestoreFlags};
pub use error::{HostError, Result};
pub use harness::{TestSummary, run_payload};
pub use instance::{HostChannel, InstanceState, Report, RunOutcome, SignalStatus, VmInstance};
pub use memory::{GuardedMapping, GuestMemory, MemoryRegion, RegionFlags};
