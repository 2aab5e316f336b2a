// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

pub use kvm_bindings::{
    CpuId, KVM_CPUID_FLAG_SIGNIFCANT_INDEX, KVM_MAX_CPUID_ENTRIES, kvm_cpuid_entry2,
};
use serde::{Deserialize, Serialize};

/// Table comparison under the mask policy.
pub mod compare;
/// Per-leaf register masks.
pub mod mask;

pub use compare::{CpuidCompareError, compare_cpuids};
pub use mask::{MaskedRegisters, RegisterMask, mask_for};

/// Processor info and feature bits.
pub const LEAF_FEATURE_INFO: u32 = 0x1;
/// Structured extended feature flags.
pub const LEAF_EXTENDED_FEATURES: u32 = 0x7;
/// Processor extended state enumeration.
pub const LEAF_XSAVE_STATE: u32 = 0xd;
/// KVM signature leaf; EAX holds the highest KVM leaf.
pub const LEAF_KVM_SIGNATURE: u32 = 0x4000_0000;
/// KVM paravirtual features leaf, the highest leaf KVM reports.
pub const LEAF_KVM_FEATURES: u32 = 0x4000_0001;
/// Virtual and physical address sizes.
pub const LEAF_ADDRESS_SIZES: u32 = 0x8000_0008;

/// Mask of the MAXPHYADDR field in `CPUID.0x80000008:EAX`.
pub const MAX_PHYS_ADDR_MASK: u32 = 0xff;

/// Identifies a CPUID entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuidKey {
    /// Leaf (`function`).
    pub leaf: u32,
    /// Sub-leaf (`index`).
    #[serde(default)]
    pub subleaf: u32,
}

impl CpuidKey {
    /// `CpuidKey { leaf, subleaf: 0 }`
    #[must_use]
    pub const fn leaf(leaf: u32) -> Self {
        Self { leaf, subleaf: 0 }
    }

    /// `CpuidKey { leaf, subleaf }`
    #[must_use]
    pub const fn subleaf(leaf: u32, subleaf: u32) -> Self {
        Self { leaf, subleaf }
    }
}

impl From<&kvm_cpuid_entry2> for CpuidKey {
    fn from(entry: &kvm_cpuid_entry2) -> Self {
        Self::subleaf(entry.function, entry.index)
    }
}

impl fmt::Display for CpuidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}.{:#x}", self.leaf, self.subleaf)
    }
}

/// Error type for [`<CpuidKey as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum CpuidKeyFromStrError {
    /// Invalid CPUID leaf `{0}`: {1}
    Leaf(String, ParseIntError),
    /// Invalid CPUID sub-leaf `{0}`: {1}
    Subleaf(String, ParseIntError),
}

fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Parses `LEAF[.SUBLEAF]`, each part decimal or `0x`-prefixed hexadecimal.
impl FromStr for CpuidKey {
    type Err = CpuidKeyFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (leaf, subleaf) = s.split_once('.').unwrap_or((s, "0"));
        Ok(Self {
            leaf: parse_u32(leaf)
                .map_err(|err| CpuidKeyFromStrError::Leaf(leaf.to_string(), err))?,
            subleaf: parse_u32(subleaf)
                .map_err(|err| CpuidKeyFromStrError::Subleaf(subleaf.to_string(), err))?,
        })
    }
}

/// CPUID register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuidRegister {
    /// EAX
    Eax,
    /// EBX
    Ebx,
    /// ECX
    Ecx,
    /// EDX
    Edx,
}

impl CpuidRegister {
    /// All registers in the order CPUID returns them.
    pub const ALL: [CpuidRegister; 4] = [Self::Eax, Self::Ebx, Self::Ecx, Self::Edx];

    /// Reads this register out of `entry`.
    #[must_use]
    pub fn read(self, entry: &kvm_cpuid_entry2) -> u32 {
        match self {
            Self::Eax => entry.eax,
            Self::Ebx => entry.ebx,
            Self::Ecx => entry.ecx,
            Self::Edx => entry.edx,
        }
    }
}

impl fmt::Display for CpuidRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eax => "eax",
            Self::Ebx => "ebx",
            Self::Ecx => "ecx",
            Self::Edx => "edx",
        };
        f.write_str(name)
    }
}

/// A single feature bit in a CPUID leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidFeature {
    /// Leaf the feature is enumerated in.
    pub leaf: u32,
    /// Register holding the bit.
    pub register: CpuidRegister,
    /// Bit position within the register.
    pub bit: u32,
}

impl CpuidFeature {
    /// Single-bit mask of the feature within its register.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        1 << self.bit
    }
}

/// The OS has set CR4.OSXSAVE.
pub const OSXSAVE: CpuidFeature = CpuidFeature {
    leaf: LEAF_FEATURE_INFO,
    register: CpuidRegister::Ecx,
    bit: 27,
};

/// The OS has set CR4.PKE.
pub const OSPKE: CpuidFeature = CpuidFeature {
    leaf: LEAF_EXTENDED_FEATURES,
    register: CpuidRegister::Ecx,
    bit: 4,
};

/// Returns the number of entries the table declares in its header.
#[must_use]
pub fn declared_len(cpuid: &CpuId) -> usize {
    cpuid.as_fam_struct_ref().nent as usize
}

/// Finds the entry for `key`, the way a vCPU's cached table is looked up before mutating it.
pub fn find_entry_mut(cpuid: &mut CpuId, key: CpuidKey) -> Option<&mut kvm_cpuid_entry2> {
    cpuid
        .as_mut_slice()
        .iter_mut()
        .find(|entry| entry.function == key.leaf && entry.index == key.subleaf)
}

/// Finds the entry `CPUID(function, index)` resolves to.
///
/// The index only takes part in the match for entries flagged with a significant index.
#[must_use]
pub fn lookup(cpuid: &CpuId, function: u32, index: u32) -> Option<&kvm_cpuid_entry2> {
    cpuid.as_slice().iter().find(|entry| {
        entry.function == function
            && (entry.flags & KVM_CPUID_FLAG_SIGNIFCANT_INDEX == 0 || entry.index == index)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{entry, sample_cpuid};

    #[test]
    fn test_declared_len() {
        let cpuid = sample_cpuid();
        assert_eq!(declared_len(&cpuid), cpuid.as_slice().len());
    }

    #[test]
    fn test_find_entry_mut() {
        let mut cpuid = sample_cpuid();
        let found = find_entry_mut(&mut cpuid, CpuidKey::subleaf(LEAF_XSAVE_STATE, 1)).unwrap();
        assert_eq!((found.function, found.index), (LEAF_XSAVE_STATE, 1));
        found.eax = 0xdead;
        assert_eq!(
            lookup(&cpuid, LEAF_XSAVE_STATE, 1).map(|entry| entry.eax),
            Some(0xdead)
        );
        assert!(find_entry_mut(&mut cpuid, CpuidKey::leaf(0x1234_5678)).is_none());
    }

    #[test]
    fn test_lookup_ignores_index_unless_significant() {
        let cpuid = CpuId::from_entries(&[
            entry(0x1, 0, 0, [1, 2, 3, 4]),
            entry(0x7, 0, KVM_CPUID_FLAG_SIGNIFCANT_INDEX, [5, 6, 7, 8]),
        ])
        .unwrap();

        assert_eq!(lookup(&cpuid, 0x1, 9).map(|e| e.eax), Some(1));
        assert_eq!(lookup(&cpuid, 0x7, 0).map(|e| e.eax), Some(5));
        assert!(lookup(&cpuid, 0x7, 1).is_none());
        assert!(lookup(&cpuid, 0x2, 0).is_none());
    }

    #[test]
    fn test_register_read() {
        let entry = entry(0x1, 0, 0, [1, 2, 3, 4]);
        let values: Vec<u32> = CpuidRegister::ALL
            .iter()
            .map(|register| register.read(&entry))
            .collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_key_from_str() {
        assert_eq!("0x7".parse(), Ok(CpuidKey::leaf(0x7)));
        assert_eq!("13.1".parse(), Ok(CpuidKey::subleaf(0xd, 1)));
        assert_eq!("0x80000008.0x0".parse(), Ok(CpuidKey::leaf(0x8000_0008)));
        let key = CpuidKey::subleaf(0xd, 2);
        assert_eq!(key.to_string().parse(), Ok(key));

        assert!(matches!(
            "leaf".parse::<CpuidKey>(),
            Err(CpuidKeyFromStrError::Leaf(..))
        ));
        let err = "0xd.".parse::<CpuidKey>().unwrap_err();
        assert!(err.to_string().starts_with("Invalid CPUID sub-leaf ``"), "{err}");
    }

    #[test]
    fn test_display() {
        assert_eq!(CpuidKey::subleaf(0xd, 1).to_string(), "0xd.0x1");
        assert_eq!(CpuidRegister::Ecx.to_string(), "ecx");
        assert_eq!(OSXSAVE.mask(), 0x0800_0000);
        assert_eq!(OSPKE.mask(), 0x10);
    }
}
