// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use kvm_bindings::{CpuId, kvm_regs};
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{error, trace};
use vmm_sys_util::errno;
use vmm_sys_util::ioctl::ioctl_with_mut_ptr;

use crate::harness::GuestExit;
use crate::sync::SYNC_PORT;
use crate::vstate::vm::Vm;
use ioctls::KVM_GET_CPUID2;

// kvm-ioctls only exposes KVM_GET_CPUID2 through a wrapper that allocates its own buffer; the
// overflow check needs to hand the kernel a caller-sized one.
mod ioctls {
    use kvm_bindings::{KVMIO, kvm_cpuid2};
    use vmm_sys_util::{ioctl_ioc_nr, ioctl_iowr_nr};

    ioctl_iowr_nr!(KVM_GET_CPUID2, KVMIO, 0x91, kvm_cpuid2);
}

/// Errors associated with the wrappers over KVM ioctls.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum VcpuError {
    /// Cannot open the VCPU file descriptor: {0}
    VcpuFd(kvm_ioctls::Error),
    /// Failed to get KVM vcpu sregs: {0}
    VcpuGetSregs(kvm_ioctls::Error),
    /// Failed to set KVM vcpu sregs: {0}
    VcpuSetSregs(kvm_ioctls::Error),
    /// Failed to get KVM vcpu regs: {0}
    VcpuGetRegs(kvm_ioctls::Error),
    /// Failed to set KVM vcpu regs: {0}
    VcpuSetRegs(kvm_ioctls::Error),
    /// Error running the vcpu: {0}
    VcpuRun(kvm_ioctls::Error),
}

/// A single vCPU executing the guest program in real mode.
#[derive(Debug)]
pub struct KvmVcpu {
    /// KVM vcpu fd.
    pub fd: VcpuFd,
}

impl KvmVcpu {
    /// Creates vCPU 0 of `vm`.
    pub fn new(vm: &Vm) -> Result<Self, VcpuError> {
        let fd = vm.fd().create_vcpu(0).map_err(VcpuError::VcpuFd)?;
        Ok(KvmVcpu { fd })
    }

    /// Puts the vCPU in flat real mode, about to execute the instruction at `entry`.
    pub fn setup_real_mode(&self, entry: u64) -> Result<(), VcpuError> {
        let mut sregs = self.fd.get_sregs().map_err(VcpuError::VcpuGetSregs)?;
        for segment in [&mut sregs.cs, &mut sregs.ds, &mut sregs.es, &mut sregs.ss] {
            segment.base = 0;
            segment.selector = 0;
        }
        self.fd.set_sregs(&sregs).map_err(VcpuError::VcpuSetSregs)?;

        let regs = kvm_regs {
            rip: entry,
            // Bit 1 of RFLAGS is reserved and must be set.
            rflags: 0x2,
            ..Default::default()
        };
        self.fd.set_regs(&regs).map_err(VcpuError::VcpuSetRegs)
    }

    /// Passes `arg` as the first SysV argument of the guest program.
    pub fn set_first_arg(&self, arg: u64) -> Result<(), VcpuError> {
        let mut regs = self.fd.get_regs().map_err(VcpuError::VcpuGetRegs)?;
        regs.rdi = arg;
        self.fd.set_regs(&regs).map_err(VcpuError::VcpuSetRegs)
    }

    /// `KVM_SET_CPUID2`
    pub fn set_cpuid(&self, cpuid: &CpuId) -> Result<(), errno::Error> {
        self.fd.set_cpuid2(cpuid)
    }

    /// `KVM_GET_CPUID2` into `cpuid`, whose declared entry count is its capacity.
    ///
    /// On success the kernel replaces the count with the number of entries it wrote. On failure
    /// the buffer is left as the kernel left it.
    pub fn get_cpuid(&self, cpuid: &mut CpuId) -> Result<(), errno::Error> {
        // SAFETY: The kernel writes at most `nent` entries, and `nent` never exceeds the number of
        // entries the wrapper allocated.
        let ret =
            unsafe { ioctl_with_mut_ptr(&self.fd, KVM_GET_CPUID2(), cpuid.as_mut_fam_struct_ptr()) };
        if ret < 0 {
            return Err(errno::Error::last());
        }
        Ok(())
    }

    /// Runs the vCPU until the guest posts to the mailbox or exits for any other reason.
    pub fn run(&mut self) -> Result<GuestExit, VcpuError> {
        match self.fd.run().map_err(VcpuError::VcpuRun)? {
            VcpuExit::IoOut(SYNC_PORT, _) => {
                trace!("vcpu: sync port write");
                Ok(GuestExit::Sync)
            }
            unexpected_exit => {
                error!("Unexpected exit reason on vcpu run: {:?}", unexpected_exit);
                Ok(GuestExit::Unexpected(format!("{:?}", unexpected_exit)))
            }
        }
    }
}
