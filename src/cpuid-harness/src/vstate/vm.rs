// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;

use crate::vstate::kvm::Kvm;
use crate::vstate::memory::{Address, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

/// Address of the three-page TSS region real-mode guests need on Intel hosts.
pub const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

/// Errors associated with the wrappers over KVM ioctls.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum VmError {
    /// Cannot set the memory regions: {0}
    SetUserMemoryRegion(kvm_ioctls::Error),
    /// Cannot open the VM file descriptor: {0}
    VmFd(kvm_ioctls::Error),
    /// Cannot configure the VM: {0}
    VmSetup(kvm_ioctls::Error),
    /// Guest memory region at {0:#x} has no host mapping
    HostAddress(u64),
}

/// A wrapper around creating and using a VM.
#[derive(Debug)]
pub struct Vm {
    fd: VmFd,
}

impl Vm {
    /// Create a new `Vm` struct.
    pub fn new(kvm: &Kvm) -> Result<Self, VmError> {
        // Create fd for interacting with kvm-vm specific functions.
        let vm_fd = kvm.fd.create_vm().map_err(VmError::VmFd)?;
        Ok(Vm { fd: vm_fd })
    }

    /// Registers the guest memory with KVM.
    pub fn memory_init(&self, guest_mem: &GuestMemoryMmap) -> Result<(), VmError> {
        guest_mem
            .iter()
            .zip(0u32..)
            .try_for_each(|(region, slot)| {
                let start = region.start_addr();
                let host_addr = guest_mem
                    .get_host_address(start)
                    .map_err(|_| VmError::HostAddress(start.raw_value()))?;
                let memory_region = kvm_userspace_memory_region {
                    slot,
                    guest_phys_addr: start.raw_value(),
                    memory_size: region.len(),
                    userspace_addr: host_addr as u64,
                    flags: 0,
                };

                // SAFETY: Safe because the fd is a valid KVM file descriptor and the region stays
                // mapped for as long as the VM exists.
                unsafe { self.fd.set_user_memory_region(memory_region) }
                    .map_err(VmError::SetUserMemoryRegion)
            })?;

        self.fd
            .set_tss_address(KVM_TSS_ADDRESS)
            .map_err(VmError::VmSetup)
    }

    /// Gets a reference to the kvm file descriptor owned by this VM.
    pub fn fd(&self) -> &VmFd {
        &self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vstate::memory;

    #[test]
    #[ignore = "needs /dev/kvm"]
    fn test_memory_init() {
        let kvm = Kvm::new().unwrap();
        let vm = Vm::new(&kvm).unwrap();
        let mem = memory::create(1).unwrap();
        vm.memory_init(&mem).unwrap();
    }
}
