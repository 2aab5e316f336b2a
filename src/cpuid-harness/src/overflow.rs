// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Checks that `KVM_GET_CPUID2` rejects buffers too small for the vCPU table.

use log::debug;
use vmm_sys_util::errno;

use crate::cpuid::{CpuId, declared_len};
use crate::harness::ConformanceTarget;

/// Failures of the undersized-buffer check.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum OverflowError {
    /// Cannot allocate a CPUID buffer: {0:?}
    Fam(vmm_sys_util::fam::Error),
    /// KVM_GET_CPUID2 with room for {capacity} entries failed: {source}
    Query {
        /// Entries the buffer could hold.
        capacity: usize,
        /// Error returned by the ioctl.
        source: errno::Error,
    },
    /// KVM didn't update nent on success, wanted {expected}, got {actual}
    CountNotUpdated {
        /// Entries in the vCPU table.
        expected: usize,
        /// Count the buffer declares after the query.
        actual: usize,
    },
    /// KVM_GET_CPUID2 with room for {0} entries succeeded
    UndersizedAccepted(usize),
    /// KVM_GET_CPUID2 with room for {capacity} entries failed with {source}, not E2BIG
    WrongError {
        /// Entries the buffer could hold.
        capacity: usize,
        /// Error returned by the ioctl.
        source: errno::Error,
    },
    /// KVM modified nent on failure: set {capacity}, got {actual}
    CountModified {
        /// Count declared before the query.
        capacity: usize,
        /// Count declared after the query.
        actual: usize,
    },
}

/// Sets the entry count `cpuid` declares, which must not exceed its allocation.
fn set_declared_len(cpuid: &mut CpuId, nent: u32) {
    // SAFETY: Callers only shrink the count below the number of allocated entries, so the header
    // never describes memory the wrapper does not own.
    unsafe { cpuid.as_mut_fam_struct().nent = nent };
}

/// Queries the vCPU table into buffers of every size below its entry count.
///
/// A buffer one entry larger than needed must come back holding exactly the vCPU's entries.
/// Every smaller one must fail with `E2BIG` and keep the count it declared. Returns the number
/// of undersized buffers probed.
pub fn test_get_cpuid2<T: ConformanceTarget>(target: &T) -> Result<usize, OverflowError> {
    let expected = declared_len(target.vcpu_cpuid());
    let capacity = expected + 1;
    let mut cpuid = CpuId::new(capacity).map_err(OverflowError::Fam)?;

    target
        .get_vcpu_cpuid(&mut cpuid)
        .map_err(|source| OverflowError::Query { capacity, source })?;
    let actual = declared_len(&cpuid);
    if actual != expected {
        return Err(OverflowError::CountNotUpdated { expected, actual });
    }

    for nent in 0..u32::try_from(expected).unwrap_or(u32::MAX) {
        set_declared_len(&mut cpuid, nent);
        let capacity = nent as usize;
        match target.get_vcpu_cpuid(&mut cpuid) {
            Ok(()) => return Err(OverflowError::UndersizedAccepted(capacity)),
            Err(source) if source.errno() != libc::E2BIG => {
                return Err(OverflowError::WrongError { capacity, source });
            }
            Err(_) => {}
        }

        let actual = declared_len(&cpuid);
        if actual != capacity {
            return Err(OverflowError::CountModified { capacity, actual });
        }
    }
    debug!("{expected} undersized KVM_GET_CPUID2 buffers rejected");

    Ok(expected)
}
