// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use super::{
    CpuidFeature, CpuidRegister, LEAF_EXTENDED_FEATURES, LEAF_FEATURE_INFO, LEAF_XSAVE_STATE,
    OSPKE, OSXSAVE, kvm_cpuid_entry2,
};

/// Bits of each register that must agree between two observations of the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMask {
    /// EAX mask.
    pub eax: u32,
    /// EBX mask.
    pub ebx: u32,
    /// ECX mask.
    pub ecx: u32,
    /// EDX mask.
    pub edx: u32,
}

impl Default for RegisterMask {
    fn default() -> Self {
        Self::INVARIANT
    }
}

impl RegisterMask {
    /// Every bit of every register is invariant.
    pub const INVARIANT: Self = Self {
        eax: u32::MAX,
        ebx: u32::MAX,
        ecx: u32::MAX,
        edx: u32::MAX,
    };

    /// Mask of `register`.
    #[must_use]
    pub fn get(&self, register: CpuidRegister) -> u32 {
        match register {
            CpuidRegister::Eax => self.eax,
            CpuidRegister::Ebx => self.ebx,
            CpuidRegister::Ecx => self.ecx,
            CpuidRegister::Edx => self.edx,
        }
    }

    fn get_mut(&mut self, register: CpuidRegister) -> &mut u32 {
        match register {
            CpuidRegister::Eax => &mut self.eax,
            CpuidRegister::Ebx => &mut self.ebx,
            CpuidRegister::Ecx => &mut self.ecx,
            CpuidRegister::Edx => &mut self.edx,
        }
    }

    fn clear_feature(&mut self, feature: CpuidFeature) {
        *self.get_mut(feature.register) &= !feature.mask();
    }

    /// Applies the mask to the registers of `entry`.
    #[must_use]
    pub fn apply(&self, entry: &kvm_cpuid_entry2) -> MaskedRegisters {
        MaskedRegisters {
            eax: entry.eax & self.eax,
            ebx: entry.ebx & self.ebx,
            ecx: entry.ecx & self.ecx,
            edx: entry.edx & self.edx,
        }
    }
}

/// Register values of an entry with the dynamic bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskedRegisters {
    /// Masked EAX.
    pub eax: u32,
    /// Masked EBX.
    pub ebx: u32,
    /// Masked ECX.
    pub ecx: u32,
    /// Masked EDX.
    pub edx: u32,
}

impl fmt::Display for MaskedRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}:{:#x}:{:#x}:{:#x}",
            self.eax, self.ebx, self.ecx, self.edx
        )
    }
}

/// Returns the invariant bits of `entry`, derived from its function and index only.
///
/// Bits reflecting OS state rather than CPU identity are excluded:
///
/// * `CPUID.1:ECX.OSXSAVE` mirrors CR4.OSXSAVE.
/// * `CPUID.7:ECX.OSPKE` mirrors CR4.PKE.
/// * `CPUID.0xD.{0,1}:EBX` enumerate the XSAVE area size for the current XCR0 and IA32_XSS.
#[must_use]
pub fn mask_for(entry: &kvm_cpuid_entry2) -> RegisterMask {
    let mut mask = RegisterMask::INVARIANT;

    match entry.function {
        LEAF_FEATURE_INFO => mask.clear_feature(OSXSAVE),
        LEAF_EXTENDED_FEATURES => mask.clear_feature(OSPKE),
        LEAF_XSAVE_STATE if entry.index < 2 => mask.ebx = 0,
        _ => {}
    }

    mask
}
