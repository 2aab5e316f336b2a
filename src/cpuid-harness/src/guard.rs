// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Checks that a vCPU's CPUID cannot change once it has run.

use std::ops::{Deref, DerefMut};

use log::debug;
use vmm_sys_util::errno;

use crate::cpuid::{
    CpuidKey, LEAF_ADDRESS_SIZES, LEAF_EXTENDED_FEATURES, MAX_PHYS_ADDR_MASK, find_entry_mut,
    kvm_cpuid_entry2,
};
use crate::harness::ConformanceTarget;

/// Failures of the post-run mutation checks.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum MutationError {
    /// Setting unmodified CPUID after KVM_RUN failed: {0}
    UnmodifiedRejected(errno::Error),
    /// Changing CPU features should fail
    FeatureChangeAccepted,
    /// Changing MAXPHYADDR should fail
    MaxPhysAddrChangeAccepted,
    /// CPUID entry {0} is not in the vCPU table
    MissingLeaf(CpuidKey),
}

/// Temporarily altered entry of a target's cached vCPU table.
///
/// The entry is restored when the guard is dropped, whether or not the target accepted the
/// altered table.
#[derive(Debug)]
pub struct EntryMutation<'a, T: ConformanceTarget> {
    target: &'a mut T,
    key: CpuidKey,
    original: kvm_cpuid_entry2,
}

impl<'a, T: ConformanceTarget> EntryMutation<'a, T> {
    /// Applies `mutate` to the cached entry for `key`.
    pub fn new(
        target: &'a mut T,
        key: CpuidKey,
        mutate: impl FnOnce(&mut kvm_cpuid_entry2),
    ) -> Result<Self, MutationError> {
        let entry =
            find_entry_mut(target.vcpu_cpuid_mut(), key).ok_or(MutationError::MissingLeaf(key))?;
        let original = *entry;
        mutate(entry);
        Ok(Self {
            target,
            key,
            original,
        })
    }

    /// The entry as it was before the mutation.
    pub fn original(&self) -> &kvm_cpuid_entry2 {
        &self.original
    }
}

impl<T: ConformanceTarget> Deref for EntryMutation<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.target
    }
}

impl<T: ConformanceTarget> DerefMut for EntryMutation<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.target
    }
}

impl<T: ConformanceTarget> Drop for EntryMutation<'_, T> {
    fn drop(&mut self) {
        if let Some(entry) = find_entry_mut(self.target.vcpu_cpuid_mut(), self.key) {
            *entry = self.original;
        }
    }
}

/// Decrements the MAXPHYADDR field of `CPUID.0x80000008:EAX`, leaving the other fields alone.
fn decrement_max_phys_addr(eax: u32) -> u32 {
    let max_phys_addr = eax & MAX_PHYS_ADDR_MASK;
    (eax & !MAX_PHYS_ADDR_MASK) | (max_phys_addr.wrapping_sub(1) & MAX_PHYS_ADDR_MASK)
}

/// Resubmits the vCPU table after the vCPU has run:
///
/// * unchanged, which KVM must accept;
/// * with `CPUID.7.0:EBX` decremented, which KVM must reject;
/// * with MAXPHYADDR (`CPUID.0x80000008:EAX[7:0]`) decremented, which KVM must reject.
///
/// The cached table is left as it was found.
pub fn set_cpuid_after_run<T: ConformanceTarget>(target: &mut T) -> Result<(), MutationError> {
    target
        .set_vcpu_cpuid()
        .map_err(MutationError::UnmodifiedRejected)?;

    {
        let mut mutation = EntryMutation::new(
            target,
            CpuidKey::leaf(LEAF_EXTENDED_FEATURES),
            |entry| entry.ebx = entry.ebx.wrapping_sub(1),
        )?;
        match mutation.set_vcpu_cpuid() {
            Ok(()) => return Err(MutationError::FeatureChangeAccepted),
            Err(err) => debug!("Feature change rejected: {err}"),
        }
    }

    let mut mutation = EntryMutation::new(target, CpuidKey::leaf(LEAF_ADDRESS_SIZES), |entry| {
        entry.eax = decrement_max_phys_addr(entry.eax)
    })?;
    match mutation.set_vcpu_cpuid() {
        Ok(()) => Err(MutationError::MaxPhysAddrChangeAccepted),
        Err(err) => {
            debug!("MAXPHYADDR change rejected: {err}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuid::{CpuId, lookup};
    use crate::test_utils::MockTarget;

    fn ran_target() -> MockTarget {
        let mut target = MockTarget::new();
        target.mark_ran();
        target
    }

    fn live_table(target: &MockTarget) -> CpuId {
        let mut live = CpuId::new(kvm_bindings::KVM_MAX_CPUID_ENTRIES).unwrap();
        target.get_vcpu_cpuid(&mut live).unwrap();
        live
    }

    #[test]
    fn test_set_cpuid_after_run() {
        let mut target = ran_target();
        let before = target.vcpu_cpuid().clone();
        set_cpuid_after_run(&mut target).unwrap();
        assert_eq!(target.vcpu_cpuid().as_slice(), before.as_slice());
        assert_eq!(live_table(&target).as_slice(), before.as_slice());
    }

    #[test]
    fn test_mutation_restores_on_drop() {
        let mut target = ran_target();
        let before = target.vcpu_cpuid().clone();
        {
            let mut mutation = EntryMutation::new(
                &mut target,
                CpuidKey::leaf(LEAF_EXTENDED_FEATURES),
                |entry| entry.ebx ^= 1,
            )
            .unwrap();
            assert_eq!(
                lookup(mutation.vcpu_cpuid(), LEAF_EXTENDED_FEATURES, 0).unwrap().ebx,
                mutation.original().ebx ^ 1
            );
            assert_eq!(
                mutation.set_vcpu_cpuid().unwrap_err().errno(),
                libc::EINVAL
            );
        }
        assert_eq!(target.vcpu_cpuid().as_slice(), before.as_slice());
        // The rejected table never reached the vCPU.
        assert_eq!(live_table(&target).as_slice(), before.as_slice());
    }

    #[test]
    fn test_decrement_max_phys_addr() {
        // 48 bits virtual, 39 bits physical.
        assert_eq!(decrement_max_phys_addr(0x3027), 0x3026);
        // Stays within the field.
        assert_eq!(decrement_max_phys_addr(0x3000), 0x30ff);
    }

    #[test]
    fn test_missing_leaf() {
        let mut target = ran_target();
        target.remove_entry(CpuidKey::leaf(LEAF_ADDRESS_SIZES));
        assert_eq!(
            set_cpuid_after_run(&mut target),
            Err(MutationError::MissingLeaf(CpuidKey::leaf(LEAF_ADDRESS_SIZES)))
        );
    }

    #[test]
    fn test_mutation_accepted() {
        let mut target = ran_target();
        target.accept_mutations = true;
        let before = target.vcpu_cpuid().clone();
        assert_eq!(
            set_cpuid_after_run(&mut target),
            Err(MutationError::FeatureChangeAccepted)
        );
        // Every mutation was undone even though the vCPU took them.
        assert_eq!(target.vcpu_cpuid().as_slice(), before.as_slice());
        assert_eq!(
            MutationError::FeatureChangeAccepted.to_string(),
            "Changing CPU features should fail"
        );
    }

    #[test]
    fn test_unmodified_rejected() {
        let mut target = ran_target();
        target.reject_all_updates = true;
        let err = set_cpuid_after_run(&mut target).unwrap_err();
        assert!(matches!(err, MutationError::UnmodifiedRejected(_)));
        assert!(
            err.to_string()
                .starts_with("Setting unmodified CPUID after KVM_RUN failed"),
            "{err}"
        );
    }
}
