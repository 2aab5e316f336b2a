// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Drives one conformance run against a [`ConformanceTarget`].

use std::fmt;

use log::{debug, info, warn};
use vm_memory::GuestAddress;
use vmm_sys_util::errno;

use crate::config::HarnessConfig;
use crate::cpuid::{CpuId, CpuidCompareError, CpuidKey, compare_cpuids, find_entry_mut};
use crate::guard::{MutationError, set_cpuid_after_run};
use crate::overflow::{OverflowError, test_get_cpuid2};
use crate::sync::{FINAL_STAGE, GuestAssertion, GuestSignal, StageTracker, SyncError, SyncPacket};
use crate::vstate::memory::MemoryError;
use crate::vstate::vcpu::VcpuError;

/// Why the guest handed control back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestExit {
    /// The guest wrote to the sync port; the mailbox holds its packet.
    Sync,
    /// Any other exit, described for the error report.
    Unexpected(String),
}

/// Errors of the VM/vCPU backing a run.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TargetError {
    /// vCPU error: {0}
    Vcpu(#[from] VcpuError),
    /// Guest memory error: {0}
    Memory(#[from] MemoryError),
    /// The guest program was started before its CPUID table was loaded
    GuestNotLoaded,
}

/// A VM with one vCPU whose CPUID interface is under test.
pub trait ConformanceTarget {
    /// CPUID table the host supports, as reported by `KVM_GET_SUPPORTED_CPUID`.
    fn supported_cpuid(&self) -> &CpuId;

    /// Host's cached copy of the vCPU table.
    fn vcpu_cpuid(&self) -> &CpuId;

    /// Mutable access to the cached copy, to prepare a resubmission.
    fn vcpu_cpuid_mut(&mut self) -> &mut CpuId;

    /// Submits the cached copy with `KVM_SET_CPUID2`.
    fn set_vcpu_cpuid(&mut self) -> Result<(), errno::Error>;

    /// `KVM_GET_CPUID2` into `cpuid`, whose declared entry count is its capacity.
    ///
    /// Fails with `E2BIG` if the capacity is smaller than the vCPU table.
    fn get_vcpu_cpuid(&self, cpuid: &mut CpuId) -> Result<(), errno::Error>;

    /// Copies `table` to guest memory and passes its address to the guest program.
    fn load_guest_table(&mut self, table: &CpuId) -> Result<GuestAddress, TargetError>;

    /// Runs the vCPU until the next exit.
    fn run(&mut self) -> Result<GuestExit, TargetError>;

    /// Reads the mailbox.
    fn sync_packet(&self) -> Result<SyncPacket, TargetError>;
}

/// Errors terminating a conformance run.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum HarnessError {
    /// {0}
    Compare(#[from] CpuidCompareError),
    /// Guest/host protocol error: {0}
    Sync(#[from] SyncError),
    /// {0}
    GuestAssertion(GuestAssertion),
    /// Unexpected exit after stage {stage}: {reason}
    UnexpectedExit {
        /// Last stage the guest signalled.
        stage: u32,
        /// Exit reason.
        reason: String,
    },
    /// Guest did not complete, last stage {0}
    GuestIncomplete(u32),
    /// {0}
    Mutation(#[from] MutationError),
    /// {0}
    Overflow(#[from] OverflowError),
    /// {0}
    Target(#[from] TargetError),
    /// CPUID entry {0} is not in the vCPU table
    MissingEntry(CpuidKey),
}

/// Summary of a passing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Number of entries in the vCPU table.
    pub entries: usize,
    /// Stages the guest signalled, in order.
    pub stages: Vec<u32>,
    /// Number of undersized `KVM_GET_CPUID2` buffers probed.
    pub undersized_queries: usize,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} CPUID entries verified, guest stages {:?}, {} undersized queries rejected",
            self.entries, self.stages, self.undersized_queries
        )
    }
}

/// Runs every check against `target`:
///
/// 1. The vCPU table agrees with the supported table under the mask policy.
/// 2. The guest sees exactly the vCPU table through the `CPUID` instruction.
/// 3. Post-run CPUID changes are rejected.
/// 4. Undersized `KVM_GET_CPUID2` buffers are rejected without side effects.
pub fn run<T: ConformanceTarget>(
    target: &mut T,
    config: &HarnessConfig,
) -> Result<RunReport, HarnessError> {
    info!("Comparing the supported CPUID table against the vCPU table");
    compare_cpuids(target.supported_cpuid(), target.vcpu_cpuid())?;
    let entries = target.vcpu_cpuid().as_slice().len();
    debug!("{entries} CPUID entries match");

    let mut guest_table = target.vcpu_cpuid().clone();
    if let Some(key) = config.corrupt_guest_entry {
        let entry = find_entry_mut(&mut guest_table, key).ok_or(HarnessError::MissingEntry(key))?;
        entry.eax ^= 1;
        warn!("Corrupted EAX of CPUID {key} in the guest's table");
    }
    let addr = target.load_guest_table(&guest_table)?;
    debug!("Guest CPUID table loaded at {:#x}", addr.0);

    let stages = drive_guest(target)?;

    info!("Checking post-run CPUID updates");
    set_cpuid_after_run(target)?;

    info!("Checking KVM_GET_CPUID2 with undersized buffers");
    let undersized_queries = test_get_cpuid2(target)?;

    Ok(RunReport {
        entries,
        stages,
        undersized_queries,
    })
}

/// Resumes the guest through its checkpoints until it completes.
///
/// The guest gets `FINAL_STAGE + 1` runs: one per checkpoint and one to complete.
fn drive_guest<T: ConformanceTarget>(target: &mut T) -> Result<Vec<u32>, HarnessError> {
    let mut tracker = StageTracker::new();
    let mut stages = Vec::new();

    for _ in 0..=FINAL_STAGE {
        if let GuestExit::Unexpected(reason) = target.run()? {
            return Err(HarnessError::UnexpectedExit {
                stage: tracker.stage(),
                reason,
            });
        }

        match GuestSignal::try_from(target.sync_packet()?)? {
            GuestSignal::Sync(stage) => {
                tracker.sync(stage)?;
                info!("Guest reached stage {stage}");
                stages.push(stage);
            }
            GuestSignal::Done(_) => {
                tracker.done()?;
                info!("Guest completed");
                return Ok(stages);
            }
            GuestSignal::Abort(assertion) => return Err(HarnessError::GuestAssertion(assertion)),
        }
    }

    Err(HarnessError::GuestIncomplete(tracker.stage()))
}
