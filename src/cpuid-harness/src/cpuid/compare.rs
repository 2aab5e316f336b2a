// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use super::{CpuId, MaskedRegisters, declared_len, kvm_cpuid_entry2, mask_for};

/// `function.index.flags` of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryIdentity {
    /// Leaf.
    pub function: u32,
    /// Sub-leaf.
    pub index: u32,
    /// `KVM_CPUID_FLAG_*` bits.
    pub flags: u32,
}

impl From<&kvm_cpuid_entry2> for EntryIdentity {
    fn from(entry: &kvm_cpuid_entry2) -> Self {
        Self {
            function: entry.function,
            index: entry.index,
            flags: entry.flags,
        }
    }
}

impl fmt::Display for EntryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}.{}.{:x}", self.function, self.index, self.flags)
    }
}

/// Mismatch between two CPUID tables.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum CpuidCompareError {
    /// CPUID nent mismatch: {0} vs. {1}
    EntryCount(usize, usize),
    /// CPUID entries[{position}] mismatch: {left} vs. {right}
    EntryIdentity {
        /// Position of the entries in both tables.
        position: usize,
        /// Identity of the entry in the first table.
        left: EntryIdentity,
        /// Identity of the entry in the second table.
        right: EntryIdentity,
    },
    /// CPUID {function:#x}.{index:x} differ: {left} vs {right}
    Value {
        /// Leaf of the differing entries.
        function: u32,
        /// Sub-leaf of the differing entries.
        index: u32,
        /// Masked registers of the first table.
        left: MaskedRegisters,
        /// Masked registers of the second table.
        right: MaskedRegisters,
    },
}

/// Compares two CPUID tables position by position, ignoring bits that legitimately differ.
///
/// # Errors
///
/// The first mismatch found: entry count, entry identity, or invariant register bits.
pub fn compare_cpuids(left: &CpuId, right: &CpuId) -> Result<(), CpuidCompareError> {
    let (nent_left, nent_right) = (declared_len(left), declared_len(right));
    if nent_left != nent_right {
        return Err(CpuidCompareError::EntryCount(nent_left, nent_right));
    }

    for (position, (e1, e2)) in left.as_slice().iter().zip(right.as_slice()).enumerate() {
        let (id1, id2) = (EntryIdentity::from(e1), EntryIdentity::from(e2));
        if id1 != id2 {
            return Err(CpuidCompareError::EntryIdentity {
                position,
                left: id1,
                right: id2,
            });
        }

        // Mask off dynamic bits, e.g. OSXSAVE, when comparing entries.
        let mask = mask_for(e1);
        let (masked1, masked2) = (mask.apply(e1), mask.apply(e2));
        if masked1 != masked2 {
            return Err(CpuidCompareError::Value {
                function: e1.function,
                index: e1.index,
                left: masked1,
                right: masked2,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::cpuid::{CpuidKey, KVM_CPUID_FLAG_SIGNIFCANT_INDEX, find_entry_mut};
    use crate::test_utils::{entry, sample_cpuid};

    fn with_entry(mut cpuid: CpuId, key: CpuidKey, f: impl FnOnce(&mut kvm_cpuid_entry2)) -> CpuId {
        f(find_entry_mut(&mut cpuid, key).unwrap());
        cpuid
    }

    #[test]
    fn test_compare_identical() {
        let cpuid = sample_cpuid();
        compare_cpuids(&cpuid, &cpuid.clone()).unwrap();
    }

    #[test]
    fn test_compare_entry_count() {
        let left = sample_cpuid();
        let right = CpuId::from_entries(&left.as_slice()[1..]).unwrap();
        assert_eq!(
            compare_cpuids(&left, &right),
            Err(CpuidCompareError::EntryCount(
                left.as_slice().len(),
                left.as_slice().len() - 1
            ))
        );
    }

    #[test]
    fn test_compare_reordered_entries() {
        let left = sample_cpuid();
        let mut entries = left.as_slice().to_vec();
        entries.swap(0, 1);
        let right = CpuId::from_entries(&entries).unwrap();

        match compare_cpuids(&left, &right) {
            Err(CpuidCompareError::EntryIdentity { position, .. }) => assert_eq!(position, 0),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_compare_flags_mismatch() {
        let left = sample_cpuid();
        let right = with_entry(left.clone(), CpuidKey::leaf(0x1), |e| {
            e.flags ^= KVM_CPUID_FLAG_SIGNIFCANT_INDEX
        });
        let err = compare_cpuids(&left, &right).unwrap_err();
        assert!(matches!(err, CpuidCompareError::EntryIdentity { .. }));
        assert!(err.to_string().starts_with("CPUID entries["), "{err}");
    }

    #[test]
    fn test_compare_value_message() {
        let left = CpuId::from_entries(&[entry(0x2, 0, 0, [1, 2, 3, 4])]).unwrap();
        let right = CpuId::from_entries(&[entry(0x2, 0, 0, [1, 2, 3, 5])]).unwrap();
        assert_eq!(
            compare_cpuids(&left, &right).unwrap_err().to_string(),
            "CPUID 0x2.0 differ: 0x1:0x2:0x3:0x4 vs 0x1:0x2:0x3:0x5"
        );
    }

    #[test]
    fn test_compare_ospke_tolerated() {
        let left = sample_cpuid();
        let right = with_entry(left.clone(), CpuidKey::leaf(0x7), |e| e.ecx ^= 1 << 4);
        compare_cpuids(&left, &right).unwrap();
    }

    proptest! {
        #[test]
        fn test_compare_reflexive(
            regs in proptest::collection::vec(any::<[u32; 4]>(), 1..16),
        ) {
            let entries: Vec<_> = regs
                .iter()
                .enumerate()
                .map(|(i, r)| entry(u32::try_from(i).unwrap(), 0, 0, *r))
                .collect();
            let cpuid = CpuId::from_entries(&entries).unwrap();
            prop_assert!(compare_cpuids(&cpuid, &cpuid.clone()).is_ok());
        }

        #[test]
        fn test_leaf1_only_osxsave_tolerated(regs in any::<[u32; 4]>(), bit in 0u32..32) {
            let left = CpuId::from_entries(&[entry(0x1, 0, 0, regs)]).unwrap();
            let mut flipped = regs;
            flipped[2] ^= 1 << bit;
            let right = CpuId::from_entries(&[entry(0x1, 0, 0, flipped)]).unwrap();

            let result = compare_cpuids(&left, &right);
            if bit == 27 {
                prop_assert!(result.is_ok());
            } else {
                let is_value_mismatch = matches!(result, Err(CpuidCompareError::Value { .. }));
                prop_assert!(is_value_mismatch);
            }
        }

        #[test]
        fn test_xsave_size_leaves_tolerate_ebx_only(
            regs in any::<[u32; 4]>(),
            index in 0u32..2,
            register in 0usize..4,
            delta in 1u32..,
        ) {
            let flags = KVM_CPUID_FLAG_SIGNIFCANT_INDEX;
            let left = CpuId::from_entries(&[entry(0xd, index, flags, regs)]).unwrap();
            let mut changed = regs;
            changed[register] = changed[register].wrapping_add(delta);
            let right = CpuId::from_entries(&[entry(0xd, index, flags, changed)]).unwrap();

            let result = compare_cpuids(&left, &right);
            if register == 1 {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }
    }
}
