// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

use std::arch::x86_64::CpuidResult;

use crate::cpuid::{
    CpuId, KVM_CPUID_FLAG_SIGNIFCANT_INDEX, LEAF_ADDRESS_SIZES, LEAF_EXTENDED_FEATURES,
    LEAF_FEATURE_INFO, LEAF_KVM_FEATURES, LEAF_KVM_SIGNATURE, LEAF_XSAVE_STATE, OSXSAVE,
    kvm_cpuid_entry2, lookup,
};
use crate::guest::CpuidInstruction;

pub mod mock_target;

pub use mock_target::MockTarget;

/// Builds a CPUID entry from its registers, in `[eax, ebx, ecx, edx]` order.
pub fn entry(function: u32, index: u32, flags: u32, regs: [u32; 4]) -> kvm_cpuid_entry2 {
    let [eax, ebx, ecx, edx] = regs;
    kvm_cpuid_entry2 {
        function,
        index,
        flags,
        eax,
        ebx,
        ecx,
        edx,
        ..Default::default()
    }
}

/// A small table shaped like the one KVM reports on a Skylake-class host.
pub fn sample_cpuid() -> CpuId {
    let sig = KVM_CPUID_FLAG_SIGNIFCANT_INDEX;
    CpuId::from_entries(&[
        // "GenuineIntel"
        entry(0x0, 0, 0, [0xd, 0x756e_6547, 0x6c65_746e, 0x4965_6e69]),
        entry(
            LEAF_FEATURE_INFO,
            0,
            0,
            [0x0005_0654, 0x0001_0800, 0xf6fa_3203 | OSXSAVE.mask(), 0x0f8b_fbff],
        ),
        entry(
            LEAF_EXTENDED_FEATURES,
            0,
            sig,
            [0, 0xd19f_4fbb, 0x0000_0008, 0xa400_0000],
        ),
        entry(LEAF_XSAVE_STATE, 0, sig, [0x2e7, 0xa88, 0xa88, 0]),
        entry(LEAF_XSAVE_STATE, 1, sig, [0xf, 0x988, 0, 0]),
        entry(LEAF_XSAVE_STATE, 2, sig, [0x100, 0x240, 0, 0]),
        // "KVMKVMKVM"
        entry(
            LEAF_KVM_SIGNATURE,
            0,
            0,
            [LEAF_KVM_FEATURES, 0x4b4d_564b, 0x564b_4d56, 0x4d],
        ),
        entry(LEAF_KVM_FEATURES, 0, 0, [0x0100_7afb, 0, 0, 0]),
        entry(0x8000_0000, 0, 0, [LEAF_ADDRESS_SIZES, 0, 0, 0]),
        // 48 bits virtual, 39 bits physical.
        entry(LEAF_ADDRESS_SIZES, 0, 0, [0x3027, 0, 0, 0]),
    ])
    .unwrap()
}

/// A `CPUID` instruction answering from a table, with zeros for absent leaves.
#[derive(Debug, Clone, Copy)]
pub struct TableCpu<'a>(pub &'a CpuId);

impl CpuidInstruction for TableCpu<'_> {
    fn cpuid(&self, function: u32, index: u32) -> CpuidResult {
        match lookup(self.0, function, index) {
            Some(entry) => CpuidResult {
                eax: entry.eax,
                ebx: entry.ebx,
                ecx: entry.ecx,
                edx: entry.edx,
            },
            None => CpuidResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuid::declared_len;

    #[test]
    fn test_sample_cpuid() {
        let cpuid = sample_cpuid();
        assert_eq!(declared_len(&cpuid), 10);
        let leaf1 = lookup(&cpuid, LEAF_FEATURE_INFO, 0).unwrap();
        assert_ne!(leaf1.ecx & OSXSAVE.mask(), 0);
    }

    #[test]
    fn test_table_cpu() {
        let cpuid = sample_cpuid();
        let cpu = TableCpu(&cpuid);
        assert_eq!(cpu.cpuid(LEAF_KVM_SIGNATURE, 0).eax, LEAF_KVM_FEATURES);
        assert_eq!(cpu.cpuid(LEAF_XSAVE_STATE, 2).ebx, 0x240);
        // Not in the table.
        assert_eq!(cpu.cpuid(LEAF_XSAVE_STATE, 3).eax, 0);
        assert_eq!(cpu.cpuid(0x1234, 0).ebx, 0);
    }
}
