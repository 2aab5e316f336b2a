// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::mem::{offset_of, size_of};

use kvm_bindings::{CpuId, kvm_cpuid_entry2, kvm_cpuid2};
pub use vm_allocator::AllocPolicy;
use vm_allocator::AddressAllocator;
pub use vm_memory::{
    Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryError, GuestMemoryRegion,
};

use crate::guest::{GUEST_DATA_END, GUEST_DATA_START};

/// Type of GuestMemoryMmap.
pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;

/// Errors associated with guest memory.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MemoryError {
    /// Cannot create guest memory: {0}
    Create(vm_memory::Error),
    /// Cannot access guest memory: {0}
    Access(#[from] GuestMemoryError),
    /// Cannot allocate guest memory: {0}
    Allocate(#[from] vm_allocator::Error),
    /// Guest table declares {0} entries, more than a table can hold
    TooManyEntries(u32),
    /// Cannot build CPUID table: {0:?}
    Fam(vmm_sys_util::fam::Error),
}

// Fixed part of `kvm_cpuid2`; the bindings type ends in a flexible array.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuidHeader {
    nent: u32,
    padding: u32,
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuidEntryWrapper(kvm_cpuid_entry2);

// SAFETY: `CpuidHeader` is a `repr(C)` pair of `u32`s, so every bit pattern is valid.
unsafe impl ByteValued for CpuidHeader {}
// SAFETY: `kvm_cpuid_entry2` is a `repr(C)` struct of `u32`s with no padding, and the wrapper is
// transparent over it.
unsafe impl ByteValued for CpuidEntryWrapper {}

const ENTRY_SIZE: u64 = size_of::<CpuidEntryWrapper>() as u64;
const ENTRIES_OFFSET: u64 = offset_of!(kvm_cpuid2, entries) as u64;

/// Creates `size_mib` MiB of anonymous guest memory starting at guest address 0.
pub fn create(size_mib: usize) -> Result<GuestMemoryMmap, MemoryError> {
    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size_mib << 20)]).map_err(MemoryError::Create)
}

/// Size in bytes a table occupies in guest memory.
pub fn table_size(cpuid: &CpuId) -> u64 {
    ENTRIES_OFFSET + ENTRY_SIZE * cpuid.as_slice().len() as u64
}

/// Writes `cpuid` to `addr` with the `kvm_cpuid2` layout.
pub fn write_cpuid(
    mem: &GuestMemoryMmap,
    addr: GuestAddress,
    cpuid: &CpuId,
) -> Result<(), MemoryError> {
    let fam = cpuid.as_fam_struct_ref();
    let header = CpuidHeader {
        nent: fam.nent,
        padding: fam.padding,
    };
    mem.write_obj(header, addr)?;

    let mut entry_addr = addr.unchecked_add(ENTRIES_OFFSET);
    for entry in cpuid.as_slice() {
        mem.write_obj(CpuidEntryWrapper(*entry), entry_addr)?;
        entry_addr = entry_addr.unchecked_add(ENTRY_SIZE);
    }
    Ok(())
}

/// Reads back a table written by [`write_cpuid`].
pub fn read_cpuid(mem: &GuestMemoryMmap, addr: GuestAddress) -> Result<CpuId, MemoryError> {
    let header: CpuidHeader = mem.read_obj(addr)?;
    if header.nent as usize > kvm_bindings::KVM_MAX_CPUID_ENTRIES {
        return Err(MemoryError::TooManyEntries(header.nent));
    }

    let mut entries = Vec::with_capacity(header.nent as usize);
    let mut entry_addr = addr.unchecked_add(ENTRIES_OFFSET);
    for _ in 0..header.nent {
        let entry: CpuidEntryWrapper = mem.read_obj(entry_addr)?;
        entries.push(entry.0);
        entry_addr = entry_addr.unchecked_add(ENTRY_SIZE);
    }
    CpuId::from_entries(&entries).map_err(MemoryError::Fam)
}

/// Allocator for the guest data window the guest program can address.
#[derive(Debug)]
pub struct GuestAllocator {
    data: AddressAllocator,
}

impl GuestAllocator {
    /// Alignment of guest data allocations.
    pub const ALIGNMENT: u64 = 8;

    /// Creates an allocator over `[GUEST_DATA_START, GUEST_DATA_END)`.
    pub fn new() -> Result<Self, MemoryError> {
        Ok(Self {
            data: AddressAllocator::new(GUEST_DATA_START, GUEST_DATA_END - GUEST_DATA_START)?,
        })
    }

    /// Allocates `size` bytes and returns the first address of the range.
    pub fn allocate(&mut self, size: u64) -> Result<GuestAddress, MemoryError> {
        let range = self
            .data
            .allocate(size, Self::ALIGNMENT, AllocPolicy::FirstMatch)?;
        Ok(GuestAddress(range.start()))
    }

    /// Allocates room for `cpuid` and copies it to guest memory.
    pub fn load_cpuid(
        &mut self,
        mem: &GuestMemoryMmap,
        cpuid: &CpuId,
    ) -> Result<GuestAddress, MemoryError> {
        let addr = self.allocate(table_size(cpuid))?;
        write_cpuid(mem, addr, cpuid)?;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_cpuid;

    #[test]
    fn test_create() {
        let mem = create(1).unwrap();
        assert_eq!(mem.last_addr(), GuestAddress((1 << 20) - 1));
    }

    #[test]
    fn test_table_layout() {
        let mem = create(1).unwrap();
        let cpuid = sample_cpuid();
        let addr = GuestAddress(GUEST_DATA_START);
        write_cpuid(&mem, addr, &cpuid).unwrap();

        let nent: u32 = mem.read_obj(addr).unwrap();
        assert_eq!(nent as usize, cpuid.as_slice().len());
        assert_eq!(table_size(&cpuid), 8 + 40 * u64::from(nent));

        let second = &cpuid.as_slice()[1];
        let second_addr = addr.unchecked_add(8 + 40);
        assert_eq!(mem.read_obj::<u32>(second_addr).unwrap(), second.function);
        assert_eq!(
            mem.read_obj::<u32>(second_addr.unchecked_add(12)).unwrap(),
            second.eax
        );

        assert_eq!(read_cpuid(&mem, addr).unwrap().as_slice(), cpuid.as_slice());
    }

    #[test]
    fn test_entry_wrappers() {
        assert_eq!(size_of::<CpuidHeader>() as u64, ENTRIES_OFFSET);
        assert_eq!(ENTRY_SIZE, 40);

        let mem = create(1).unwrap();
        let addr = GuestAddress(GUEST_DATA_START);
        let entry = kvm_cpuid_entry2 {
            function: 0xd,
            index: 1,
            flags: 1,
            eax: 0xf,
            ebx: 0x240,
            ecx: 0,
            edx: 0,
            padding: [1, 2, 3],
        };
        mem.write_obj(CpuidEntryWrapper(entry), addr).unwrap();
        assert_eq!(mem.read_obj::<u32>(addr.unchecked_add(4)).unwrap(), 1);
        assert_eq!(mem.read_obj::<u32>(addr.unchecked_add(16)).unwrap(), 0x240);
        assert_eq!(mem.read_obj::<u32>(addr.unchecked_add(36)).unwrap(), 3);
        assert_eq!(
            mem.read_obj::<CpuidEntryWrapper>(addr).unwrap(),
            CpuidEntryWrapper(entry)
        );
    }

    #[test]
    fn test_read_bogus_count() {
        let mem = create(1).unwrap();
        let addr = GuestAddress(GUEST_DATA_START);
        mem.write_obj(0xffff_u32, addr).unwrap();
        assert!(matches!(
            read_cpuid(&mem, addr),
            Err(MemoryError::TooManyEntries(0xffff))
        ));
    }

    #[test]
    fn test_allocator() {
        let mut allocator = GuestAllocator::new().unwrap();
        let first = allocator.allocate(3).unwrap();
        assert_eq!(first, GuestAddress(GUEST_DATA_START));
        let second = allocator.allocate(16).unwrap();
        assert_eq!(second.raw_value() % GuestAllocator::ALIGNMENT, 0);
        assert!(second.raw_value() > first.raw_value());

        // The whole window is smaller than this.
        allocator.allocate(GUEST_DATA_END).unwrap_err();
    }

    #[test]
    fn test_load_cpuid() {
        let mem = create(1).unwrap();
        let mut allocator = GuestAllocator::new().unwrap();
        let cpuid = sample_cpuid();
        let addr = allocator.load_cpuid(&mem, &cpuid).unwrap();
        assert!(addr.raw_value() + table_size(&cpuid) <= GUEST_DATA_END);
        assert_eq!(read_cpuid(&mem, addr).unwrap().as_slice(), cpuid.as_slice());
    }
}
