// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mailbox protocol between the guest verifier and the host driver.
//!
//! The guest fills a [`SyncPacket`] at [`MAILBOX_ADDR`] and writes to [`SYNC_PORT`], which makes
//! the vCPU exit to the host. The host reads the packet back from guest memory, decodes it into a
//! [`GuestSignal`] and either resumes the guest or stops driving it. Turns strictly alternate, so
//! the packet is only ever written by the guest while the host is blocked in `KVM_RUN`.
//!
//! ```text
//! Offset  Size  Field
//! 0x00    4     magic
//! 0x04    4     command     Sync / Done / Abort
//! 0x08    4     stage       last stage the guest signalled
//! 0x0c    4     function    ┐
//! 0x10    4     index       │
//! 0x14    4     check       │ Abort only
//! 0x18    4     expected    │
//! 0x1c    4     actual      ┘
//! ```

use std::fmt;
use std::mem::offset_of;

use vm_memory::ByteValued;

use crate::cpuid::CpuidRegister;

/// I/O port the guest writes to after filling the mailbox.
pub const SYNC_PORT: u16 = 0x1000;

/// Guest-physical address of the mailbox.
pub const MAILBOX_ADDR: u64 = 0x2000;

/// Tag identifying packets written by the verifier.
pub const SYNC_MAGIC: u32 = u32::from_le_bytes(*b"SYNC");

/// Guest reached a checkpoint.
pub const CMD_SYNC: u32 = 1;
/// Guest completed every check.
pub const CMD_DONE: u32 = 2;
/// Guest assertion failed.
pub const CMD_ABORT: u32 = 3;

/// Codes for the `check` field of an Abort packet.
pub const CHECK_EAX: u32 = 0;
/// Wrong EBX.
pub const CHECK_EBX: u32 = 1;
/// Wrong ECX.
pub const CHECK_ECX: u32 = 2;
/// Wrong EDX.
pub const CHECK_EDX: u32 = 3;
/// Wrong maximum KVM leaf.
pub const CHECK_MAX_KVM_LEAF: u32 = 4;

/// Stage signalled before the guest starts checking.
pub const STAGE_ARMED: u32 = 1;
/// Stage signalled once every table entry was verified.
pub const STAGE_TABLE_VERIFIED: u32 = 2;
/// Last stage the guest signals before Done.
pub const FINAL_STAGE: u32 = STAGE_TABLE_VERIFIED;

/// Fixed-layout mailbox shared between guest and host.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    /// Always [`SYNC_MAGIC`].
    pub magic: u32,
    /// One of the `CMD_*` constants.
    pub command: u32,
    /// Stage counter.
    pub stage: u32,
    /// Leaf of the failed check.
    pub function: u32,
    /// Sub-leaf of the failed check.
    pub index: u32,
    /// One of the `CHECK_*` constants.
    pub check: u32,
    /// Value the guest expected.
    pub expected: u32,
    /// Value the guest observed.
    pub actual: u32,
}

// SAFETY: `SyncPacket` is a `repr(C)` struct made of `u32`s only, so it has no padding and every
// bit pattern is valid.
unsafe impl ByteValued for SyncPacket {}

/// Byte offsets of the packet fields, for code that writes the packet by hand.
pub mod offsets {
    use super::{SyncPacket, offset_of};

    /// `magic`
    pub const MAGIC: usize = offset_of!(SyncPacket, magic);
    /// `command`
    pub const COMMAND: usize = offset_of!(SyncPacket, command);
    /// `stage`
    pub const STAGE: usize = offset_of!(SyncPacket, stage);
    /// `function`
    pub const FUNCTION: usize = offset_of!(SyncPacket, function);
    /// `index`
    pub const INDEX: usize = offset_of!(SyncPacket, index);
    /// `check`
    pub const CHECK: usize = offset_of!(SyncPacket, check);
    /// `expected`
    pub const EXPECTED: usize = offset_of!(SyncPacket, expected);
    /// `actual`
    pub const ACTUAL: usize = offset_of!(SyncPacket, actual);
}

const _: () = assert!(std::mem::size_of::<SyncPacket>() == 32);

impl SyncPacket {
    /// Checkpoint packet.
    #[must_use]
    pub fn sync(stage: u32) -> Self {
        Self {
            magic: SYNC_MAGIC,
            command: CMD_SYNC,
            stage,
            ..Default::default()
        }
    }

    /// Completion packet.
    #[must_use]
    pub fn done(stage: u32) -> Self {
        Self {
            magic: SYNC_MAGIC,
            command: CMD_DONE,
            stage,
            ..Default::default()
        }
    }

    /// Failure packet describing `assertion`.
    #[must_use]
    pub fn abort(assertion: &GuestAssertion) -> Self {
        let (function, index, check) = match assertion.check {
            FailedCheck::Register {
                function,
                index,
                register,
            } => (function, index, check_code(register)),
            FailedCheck::MaxKvmLeaf { function } => (function, 0, CHECK_MAX_KVM_LEAF),
        };
        Self {
            magic: SYNC_MAGIC,
            command: CMD_ABORT,
            stage: assertion.stage,
            function,
            index,
            check,
            expected: assertion.expected,
            actual: assertion.actual,
        }
    }
}

fn check_code(register: CpuidRegister) -> u32 {
    match register {
        CpuidRegister::Eax => CHECK_EAX,
        CpuidRegister::Ebx => CHECK_EBX,
        CpuidRegister::Ecx => CHECK_ECX,
        CpuidRegister::Edx => CHECK_EDX,
    }
}

/// Errors of the guest/host protocol.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum SyncError {
    /// Mailbox does not hold a sync packet (magic {0:#x})
    BadMagic(u32),
    /// Unknown sync command {0}
    UnknownCommand(u32),
    /// Unknown failed-check code {0}
    UnknownCheck(u32),
    /// Stage {expected}: Unexpected sync from the guest, got stage {observed}
    StageMismatch {
        /// Stage the host expected next.
        expected: u32,
        /// Stage the guest signalled.
        observed: u32,
    },
    /// Guest signalled completion at stage {0}, before reaching the final stage
    EarlyDone(u32),
}

/// What the guest checked when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedCheck {
    /// A register returned by `CPUID(function, index)` differs from the guest's table.
    Register {
        /// Leaf.
        function: u32,
        /// Sub-leaf.
        index: u32,
        /// Offending register.
        register: CpuidRegister,
    },
    /// The highest KVM leaf reported by `CPUID(function)` is wrong.
    MaxKvmLeaf {
        /// KVM signature leaf.
        function: u32,
    },
}

impl fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register {
                function,
                index,
                register,
            } => write!(f, "CPUID {function:#x}.{index:x} {register}"),
            Self::MaxKvmLeaf { function } => write!(f, "max KVM leaf (CPUID {function:#x} eax)"),
        }
    }
}

/// A guest-side assertion failure, surfaced on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestAssertion {
    /// Last stage the guest signalled.
    pub stage: u32,
    /// Failed check.
    pub check: FailedCheck,
    /// Value the guest expected.
    pub expected: u32,
    /// Value the guest observed.
    pub actual: u32,
}

impl fmt::Display for GuestAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Guest assertion failed after stage {}: {}: expected {:#x}, got {:#x}",
            self.stage, self.check, self.expected, self.actual
        )
    }
}

impl std::error::Error for GuestAssertion {}

/// Decoded content of the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestSignal {
    /// Guest reached the given stage.
    Sync(u32),
    /// Guest finished; the stage is the last one it signalled.
    Done(u32),
    /// Guest assertion failed.
    Abort(GuestAssertion),
}

impl TryFrom<SyncPacket> for GuestSignal {
    type Error = SyncError;

    fn try_from(packet: SyncPacket) -> Result<Self, Self::Error> {
        if packet.magic != SYNC_MAGIC {
            return Err(SyncError::BadMagic(packet.magic));
        }

        match packet.command {
            CMD_SYNC => Ok(Self::Sync(packet.stage)),
            CMD_DONE => Ok(Self::Done(packet.stage)),
            CMD_ABORT => {
                let check = match packet.check {
                    CHECK_MAX_KVM_LEAF => FailedCheck::MaxKvmLeaf {
                        function: packet.function,
                    },
                    code => FailedCheck::Register {
                        function: packet.function,
                        index: packet.index,
                        register: *CpuidRegister::ALL
                            .get(code as usize)
                            .ok_or(SyncError::UnknownCheck(code))?,
                    },
                };
                Ok(Self::Abort(GuestAssertion {
                    stage: packet.stage,
                    check,
                    expected: packet.expected,
                    actual: packet.actual,
                }))
            }
            command => Err(SyncError::UnknownCommand(command)),
        }
    }
}

/// Host-side view of the guest's progress.
#[derive(Debug, Default)]
pub struct StageTracker {
    stage: u32,
}

impl StageTracker {
    /// Tracker expecting [`STAGE_ARMED`] next.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last stage the guest signalled, 0 before the first Sync.
    #[must_use]
    pub fn stage(&self) -> u32 {
        self.stage
    }

    /// Accepts a Sync for `observed` if it is exactly the next stage.
    ///
    /// # Errors
    ///
    /// [`SyncError::StageMismatch`] on a skipped or repeated stage.
    pub fn sync(&mut self, observed: u32) -> Result<(), SyncError> {
        let expected = self.stage + 1;
        if observed != expected {
            return Err(SyncError::StageMismatch { expected, observed });
        }
        self.stage = observed;
        Ok(())
    }

    /// Accepts a Done if every stage has been signalled.
    ///
    /// # Errors
    ///
    /// [`SyncError::EarlyDone`] if the guest skipped the remaining checkpoints.
    pub fn done(&self) -> Result<(), SyncError> {
        if self.stage == FINAL_STAGE {
            Ok(())
        } else {
            Err(SyncError::EarlyDone(self.stage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_layout() {
        assert_eq!(offsets::MAGIC, 0x00);
        assert_eq!(offsets::COMMAND, 0x04);
        assert_eq!(offsets::STAGE, 0x08);
        assert_eq!(offsets::FUNCTION, 0x0c);
        assert_eq!(offsets::INDEX, 0x10);
        assert_eq!(offsets::CHECK, 0x14);
        assert_eq!(offsets::EXPECTED, 0x18);
        assert_eq!(offsets::ACTUAL, 0x1c);
        assert_eq!(SyncPacket::default().as_slice().len(), 32);
    }

    #[test]
    fn test_decode_sync_and_done() {
        assert_eq!(
            GuestSignal::try_from(SyncPacket::sync(1)),
            Ok(GuestSignal::Sync(1))
        );
        assert_eq!(
            GuestSignal::try_from(SyncPacket::done(2)),
            Ok(GuestSignal::Done(2))
        );
    }

    #[test]
    fn test_decode_abort() {
        let assertion = GuestAssertion {
            stage: STAGE_ARMED,
            check: FailedCheck::Register {
                function: 0x1,
                index: 0,
                register: CpuidRegister::Edx,
            },
            expected: 0xbfeb_fbff,
            actual: 0x1,
        };
        let packet = SyncPacket::abort(&assertion);
        assert_eq!(packet.check, CHECK_EDX);
        assert_eq!(
            GuestSignal::try_from(packet),
            Ok(GuestSignal::Abort(assertion))
        );
        assert_eq!(
            assertion.to_string(),
            "Guest assertion failed after stage 1: CPUID 0x1.0 edx: expected 0xbfebfbff, got 0x1"
        );

        let assertion = GuestAssertion {
            stage: STAGE_TABLE_VERIFIED,
            check: FailedCheck::MaxKvmLeaf {
                function: 0x4000_0000,
            },
            expected: 0x4000_0001,
            actual: 0,
        };
        assert_eq!(
            GuestSignal::try_from(SyncPacket::abort(&assertion)),
            Ok(GuestSignal::Abort(assertion))
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert_eq!(
            GuestSignal::try_from(SyncPacket::default()),
            Err(SyncError::BadMagic(0))
        );

        let mut packet = SyncPacket::sync(1);
        packet.command = 42;
        assert_eq!(
            GuestSignal::try_from(packet),
            Err(SyncError::UnknownCommand(42))
        );

        packet.command = CMD_ABORT;
        packet.check = 9;
        assert_eq!(
            GuestSignal::try_from(packet),
            Err(SyncError::UnknownCheck(9))
        );
    }

    #[test]
    fn test_stage_tracker() {
        let mut tracker = StageTracker::new();
        assert_eq!(tracker.done(), Err(SyncError::EarlyDone(0)));
        assert_eq!(
            tracker.sync(2),
            Err(SyncError::StageMismatch {
                expected: 1,
                observed: 2
            })
        );
        tracker.sync(1).unwrap();
        assert_eq!(
            tracker.sync(1),
            Err(SyncError::StageMismatch {
                expected: 2,
                observed: 1
            })
        );
        tracker.sync(2).unwrap();
        assert_eq!(tracker.stage(), FINAL_STAGE);
        tracker.done().unwrap();
    }

    #[test]
    fn test_stage_mismatch_message() {
        let err = SyncError::StageMismatch {
            expected: 2,
            observed: 3,
        };
        assert_eq!(
            err.to_string(),
            "Stage 2: Unexpected sync from the guest, got stage 3"
        );
    }
}
