// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The in-guest verifier.
//!
//! The guest receives a copy of the vCPU CPUID table and checks that the `CPUID` instruction
//! agrees with every entry of it, reporting progress through the [`crate::sync`] mailbox:
//!
//! 1. Sync stage 1.
//! 2. Every entry of the table must match `CPUID(function, index)` exactly.
//! 3. Sync stage 2.
//! 4. `CPUID(0x4000_0000).EAX` must name `0x4000_0001` as the highest KVM leaf.
//! 5. Done.
//!
//! [`image`] holds the real-mode program a KVM vCPU executes; [`GuestVerifier`] is the same
//! checklist as a resumable state machine, driven by targets that emulate the vCPU in process.

use std::arch::x86_64::CpuidResult;

use log::debug;

use crate::cpuid::{CpuId, CpuidRegister, LEAF_KVM_FEATURES, LEAF_KVM_SIGNATURE};
use crate::sync::{FailedCheck, GuestAssertion, STAGE_ARMED, STAGE_TABLE_VERIFIED, SyncPacket};

/// Real-mode guest program.
pub mod image;

/// Guest-physical address the guest program is loaded at.
pub const GUEST_CODE_ADDR: u64 = 0x1000;
/// First guest-physical address available for guest data.
pub const GUEST_DATA_START: u64 = 0x3000;
/// End (exclusive) of the guest data window; the guest addresses it with 16-bit offsets.
pub const GUEST_DATA_END: u64 = 0x1_0000;

/// Source of `CPUID` results as observed from inside the guest.
pub trait CpuidInstruction {
    /// Executes `CPUID` with `EAX = function` and `ECX = index`.
    fn cpuid(&self, function: u32, index: u32) -> CpuidResult;
}

/// `CPUID` of the CPU this code runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCpuid;

impl CpuidInstruction for NativeCpuid {
    fn cpuid(&self, function: u32, index: u32) -> CpuidResult {
        // SAFETY: `CPUID` is available on every x86_64 CPU.
        #[allow(unused_unsafe)]
        unsafe {
            std::arch::x86_64::__cpuid_count(function, index)
        }
    }
}

fn read_result(result: &CpuidResult, register: CpuidRegister) -> u32 {
    match register {
        CpuidRegister::Eax => result.eax,
        CpuidRegister::Ebx => result.ebx,
        CpuidRegister::Ecx => result.ecx,
        CpuidRegister::Edx => result.edx,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Arm,
    VerifyTable,
    CheckMaxKvmLeaf,
    Halted,
}

/// The verifier checklist as a resumable state machine.
///
/// Each call to [`GuestVerifier::resume`] runs the guest until its next port write and returns
/// the packet it posted, or `None` once the guest has halted.
#[derive(Debug)]
pub struct GuestVerifier {
    table: CpuId,
    step: Step,
}

impl GuestVerifier {
    /// Creates a verifier for the guest's copy of the table.
    #[must_use]
    pub fn new(table: CpuId) -> Self {
        Self {
            table,
            step: Step::Arm,
        }
    }

    /// The guest's copy of the table.
    #[must_use]
    pub fn table(&self) -> &CpuId {
        &self.table
    }

    /// Runs until the next exit.
    pub fn resume(&mut self, cpu: &impl CpuidInstruction) -> Option<SyncPacket> {
        match self.step {
            Step::Arm => {
                self.step = Step::VerifyTable;
                Some(SyncPacket::sync(STAGE_ARMED))
            }
            Step::VerifyTable => match self.verify_table(cpu) {
                Some(assertion) => self.abort(&assertion),
                None => {
                    self.step = Step::CheckMaxKvmLeaf;
                    Some(SyncPacket::sync(STAGE_TABLE_VERIFIED))
                }
            },
            Step::CheckMaxKvmLeaf => {
                let max_leaf = cpu.cpuid(LEAF_KVM_SIGNATURE, 0).eax;
                if max_leaf != LEAF_KVM_FEATURES {
                    return self.abort(&GuestAssertion {
                        stage: STAGE_TABLE_VERIFIED,
                        check: FailedCheck::MaxKvmLeaf {
                            function: LEAF_KVM_SIGNATURE,
                        },
                        expected: LEAF_KVM_FEATURES,
                        actual: max_leaf,
                    });
                }
                self.step = Step::Halted;
                Some(SyncPacket::done(STAGE_TABLE_VERIFIED))
            }
            Step::Halted => None,
        }
    }

    fn abort(&mut self, assertion: &GuestAssertion) -> Option<SyncPacket> {
        self.step = Step::Halted;
        Some(SyncPacket::abort(assertion))
    }

    fn verify_table(&self, cpu: &impl CpuidInstruction) -> Option<GuestAssertion> {
        for entry in self.table.as_slice() {
            let result = cpu.cpuid(entry.function, entry.index);
            for register in CpuidRegister::ALL {
                let (expected, actual) = (register.read(entry), read_result(&result, register));
                if expected != actual {
                    debug!(
                        "guest: CPUID {:#x}.{:x} {register} is {actual:#x}, table has {expected:#x}",
                        entry.function, entry.index
                    );
                    return Some(GuestAssertion {
                        stage: STAGE_ARMED,
                        check: FailedCheck::Register {
                            function: entry.function,
                            index: entry.index,
                            register,
                        },
                        expected,
                        actual,
                    });
                }
            }
        }
        None
    }
}
