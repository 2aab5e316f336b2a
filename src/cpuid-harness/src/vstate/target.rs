// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use log::{debug, info};
use vmm_sys_util::errno;

use crate::config::HarnessConfig;
use crate::cpuid::CpuId;
use crate::guest::GUEST_CODE_ADDR;
use crate::guest::image::guest_code;
use crate::harness::{ConformanceTarget, GuestExit, TargetError};
use crate::sync::{MAILBOX_ADDR, SyncPacket};
use crate::vstate::kvm::{Kvm, KvmError};
use crate::vstate::memory::{
    self, Bytes, GuestAddress, GuestAllocator, GuestMemoryMmap, MemoryError,
};
use crate::vstate::vcpu::{KvmVcpu, VcpuError};
use crate::vstate::vm::{Vm, VmError};

/// Errors associated with creating a [`KvmTarget`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum KvmTargetError {
    /// {0}
    Kvm(#[from] KvmError),
    /// {0}
    Vm(#[from] VmError),
    /// {0}
    Vcpu(#[from] VcpuError),
    /// {0}
    Memory(#[from] MemoryError),
    /// Cannot set the vCPU CPUID to the supported table: {0}
    SetCpuid(errno::Error),
    /// Cannot read back the vCPU CPUID: {0}
    GetCpuid(errno::Error),
    /// Cannot allocate a CPUID buffer: {0:?}
    Fam(vmm_sys_util::fam::Error),
}

/// A KVM VM with one vCPU running the guest image in real mode.
// Fields drop in declaration order: the vCPU before the VM, the VM before its memory.
#[derive(Debug)]
pub struct KvmTarget {
    vcpu: KvmVcpu,
    // Only held so the VM outlives the vCPU.
    _vm: Vm,
    mem: GuestMemoryMmap,
    allocator: GuestAllocator,
    kvm: Kvm,
    vcpu_cpuid: CpuId,
}

impl KvmTarget {
    /// Creates the VM and its vCPU, gives the vCPU the supported CPUID table and caches the
    /// table KVM reports back for it.
    pub fn with_one_vcpu(config: &HarnessConfig) -> Result<Self, KvmTargetError> {
        let kvm = Kvm::new()?;
        let vm = Vm::new(&kvm)?;

        let mem = memory::create(config.mem_size_mib)?;
        vm.memory_init(&mem)?;
        mem.write_slice(guest_code(), GuestAddress(GUEST_CODE_ADDR))
            .map_err(MemoryError::from)?;
        debug!(
            "Guest image ({} bytes) loaded at {GUEST_CODE_ADDR:#x}",
            guest_code().len()
        );

        let vcpu = KvmVcpu::new(&vm)?;
        vcpu.setup_real_mode(GUEST_CODE_ADDR)?;
        vcpu.set_cpuid(&kvm.supported_cpuid)
            .map_err(KvmTargetError::SetCpuid)?;

        let mut vcpu_cpuid = CpuId::new(KVM_MAX_CPUID_ENTRIES).map_err(KvmTargetError::Fam)?;
        vcpu.get_cpuid(&mut vcpu_cpuid)
            .map_err(KvmTargetError::GetCpuid)?;
        info!(
            "vCPU created with {} CPUID entries",
            vcpu_cpuid.as_slice().len()
        );

        Ok(KvmTarget {
            vcpu,
            _vm: vm,
            mem,
            allocator: GuestAllocator::new()?,
            kvm,
            vcpu_cpuid,
        })
    }
}

impl ConformanceTarget for KvmTarget {
    fn supported_cpuid(&self) -> &CpuId {
        &self.kvm.supported_cpuid
    }

    fn vcpu_cpuid(&self) -> &CpuId {
        &self.vcpu_cpuid
    }

    fn vcpu_cpuid_mut(&mut self) -> &mut CpuId {
        &mut self.vcpu_cpuid
    }

    fn set_vcpu_cpuid(&mut self) -> Result<(), errno::Error> {
        self.vcpu.set_cpuid(&self.vcpu_cpuid)
    }

    fn get_vcpu_cpuid(&self, cpuid: &mut CpuId) -> Result<(), errno::Error> {
        self.vcpu.get_cpuid(cpuid)
    }

    fn load_guest_table(&mut self, table: &CpuId) -> Result<GuestAddress, TargetError> {
        let addr = self.allocator.load_cpuid(&self.mem, table)?;
        self.vcpu.set_first_arg(addr.0)?;
        Ok(addr)
    }

    fn run(&mut self) -> Result<GuestExit, TargetError> {
        Ok(self.vcpu.run()?)
    }

    fn sync_packet(&self) -> Result<SyncPacket, TargetError> {
        let packet = self
            .mem
            .read_obj(GuestAddress(MAILBOX_ADDR))
            .map_err(MemoryError::from)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            KvmTargetError::SetCpuid(errno::Error::new(libc::EINVAL))
                .to_string()
                .split(':')
                .next(),
            Some("Cannot set the vCPU CPUID to the supported table")
        );
        assert_eq!(
            KvmTargetError::Kvm(KvmError::Capabilities(7)).to_string(),
            "Missing KVM capabilities: 0x7"
        );
    }

    #[test]
    #[ignore = "needs /dev/kvm"]
    fn test_with_one_vcpu() {
        let target = KvmTarget::with_one_vcpu(&HarnessConfig::default()).unwrap();
        let nent = target.vcpu_cpuid().as_slice().len();
        assert!(nent > 0);
        assert!(nent <= target.supported_cpuid().as_slice().len());

        let mut cpuid = CpuId::new(nent).unwrap();
        target.get_vcpu_cpuid(&mut cpuid).unwrap();
        assert_eq!(cpuid.as_slice(), target.vcpu_cpuid().as_slice());
        assert_eq!(target.sync_packet().unwrap(), SyncPacket::default());
    }
}
