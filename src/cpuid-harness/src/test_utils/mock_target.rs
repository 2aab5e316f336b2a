// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use vmm_sys_util::errno;

use super::{TableCpu, sample_cpuid};
use crate::cpuid::{
    CpuId, CpuidKey, LEAF_FEATURE_INFO, LEAF_XSAVE_STATE, OSXSAVE, declared_len,
};
use crate::guest::GuestVerifier;
use crate::harness::{ConformanceTarget, GuestExit, TargetError};
use crate::sync::SyncPacket;
use crate::vstate::memory::{self, GuestAddress, GuestAllocator, GuestMemoryMmap};

/// XSAVE area size the mock reports for the enabled features.
pub const XSAVE_SIZE: u32 = 0x240;

/// What the mock vCPU does to a table it is handed: clear OSXSAVE, since the guest has not set
/// CR4.OSXSAVE yet, and size the XSAVE area for the enabled features. Applying it twice is the
/// same as applying it once.
pub fn adjust(cpuid: &CpuId) -> CpuId {
    let mut adjusted = cpuid.clone();
    for entry in adjusted.as_mut_slice() {
        match entry.function {
            LEAF_FEATURE_INFO => entry.ecx &= !OSXSAVE.mask(),
            LEAF_XSAVE_STATE if entry.index < 2 => entry.ebx = XSAVE_SIZE,
            _ => {}
        }
    }
    adjusted
}

fn errno(code: i32) -> errno::Error {
    errno::Error::new(code)
}

/// An in-process vCPU behaving the way KVM does, with knobs to misbehave.
#[derive(Debug)]
pub struct MockTarget {
    supported: CpuId,
    cache: CpuId,
    live: CpuId,
    ran: bool,
    exits: VecDeque<(GuestExit, Option<SyncPacket>)>,
    guest: Option<GuestVerifier>,
    mailbox: SyncPacket,
    mem: GuestMemoryMmap,
    allocator: GuestAllocator,
    /// Post-run updates go through.
    pub accept_mutations: bool,
    /// Every update fails with `EINVAL`, unchanged ones included.
    pub reject_all_updates: bool,
    /// An undersized `KVM_GET_CPUID2` writes the entry count before failing.
    pub clobber_count_on_e2big: bool,
    /// An undersized `KVM_GET_CPUID2` returns the entries that fit.
    pub truncate_undersized: bool,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTarget {
    /// A target supporting [`sample_cpuid`].
    pub fn new() -> Self {
        Self::with_supported(sample_cpuid())
    }

    /// A target supporting `supported`, whose vCPU has been given that table.
    pub fn with_supported(supported: CpuId) -> Self {
        let live = adjust(&supported);
        MockTarget {
            cache: live.clone(),
            live,
            supported,
            ran: false,
            exits: VecDeque::new(),
            guest: None,
            mailbox: SyncPacket::default(),
            mem: memory::create(1).unwrap(),
            allocator: GuestAllocator::new().unwrap(),
            accept_mutations: false,
            reject_all_updates: false,
            clobber_count_on_e2big: false,
            truncate_undersized: false,
        }
    }

    /// Behaves as if the vCPU had already entered the guest.
    pub fn mark_ran(&mut self) {
        self.ran = true;
    }

    /// Whether the vCPU has entered the guest.
    pub fn has_run(&self) -> bool {
        self.ran
    }

    /// Makes the next run return `exit` instead of resuming the guest.
    pub fn inject_exit(&mut self, exit: GuestExit) {
        self.exits.push_back((exit, None));
    }

    /// Makes the next run post `packet` instead of resuming the guest.
    pub fn inject_sync(&mut self, packet: SyncPacket) {
        self.exits.push_back((GuestExit::Sync, Some(packet)));
    }

    /// Drops `key` from every table the target holds.
    pub fn remove_entry(&mut self, key: CpuidKey) {
        for cpuid in [&mut self.supported, &mut self.cache, &mut self.live] {
            let entries: Vec<_> = cpuid
                .as_slice()
                .iter()
                .filter(|entry| CpuidKey::from(*entry) != key)
                .copied()
                .collect();
            *cpuid = CpuId::from_entries(&entries).unwrap();
        }
    }

    /// The table the vCPU actually runs with.
    pub fn live_cpuid(&self) -> &CpuId {
        &self.live
    }
}

impl ConformanceTarget for MockTarget {
    fn supported_cpuid(&self) -> &CpuId {
        &self.supported
    }

    fn vcpu_cpuid(&self) -> &CpuId {
        &self.cache
    }

    fn vcpu_cpuid_mut(&mut self) -> &mut CpuId {
        &mut self.cache
    }

    fn set_vcpu_cpuid(&mut self) -> Result<(), errno::Error> {
        if self.reject_all_updates {
            return Err(errno(libc::EINVAL));
        }
        let requested = adjust(&self.cache);
        if self.ran && !self.accept_mutations && requested.as_slice() != self.live.as_slice() {
            return Err(errno(libc::EINVAL));
        }
        self.live = requested;
        Ok(())
    }

    fn get_vcpu_cpuid(&self, cpuid: &mut CpuId) -> Result<(), errno::Error> {
        let entries = self.live.as_slice();
        let capacity = declared_len(cpuid);
        if capacity < entries.len() {
            if self.truncate_undersized {
                cpuid
                    .as_mut_slice()
                    .copy_from_slice(&entries[..capacity]);
                return Ok(());
            }
            if self.clobber_count_on_e2big {
                *cpuid = CpuId::from_entries(entries).map_err(|_| errno(libc::ENOMEM))?;
            }
            return Err(errno(libc::E2BIG));
        }
        *cpuid = CpuId::from_entries(entries).map_err(|_| errno(libc::ENOMEM))?;
        Ok(())
    }

    fn load_guest_table(&mut self, table: &CpuId) -> Result<GuestAddress, TargetError> {
        let addr = self.allocator.load_cpuid(&self.mem, table)?;
        let guest_copy = memory::read_cpuid(&self.mem, addr)?;
        self.guest = Some(GuestVerifier::new(guest_copy));
        Ok(addr)
    }

    fn run(&mut self) -> Result<GuestExit, TargetError> {
        self.ran = true;
        if let Some((exit, packet)) = self.exits.pop_front() {
            if let Some(packet) = packet {
                self.mailbox = packet;
            }
            return Ok(exit);
        }

        let guest = self.guest.as_mut().ok_or(TargetError::GuestNotLoaded)?;
        match guest.resume(&TableCpu(&self.live)) {
            Some(packet) => {
                self.mailbox = packet;
                Ok(GuestExit::Sync)
            }
            None => Ok(GuestExit::Unexpected("Hlt".to_string())),
        }
    }

    fn sync_packet(&self) -> Result<SyncPacket, TargetError> {
        Ok(self.mailbox)
    }
}
