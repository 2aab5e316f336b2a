// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Conformance harness for the KVM vCPU CPUID interface.
//!
//! The harness checks that the CPUID table reported for a vCPU matches what the host supports,
//! that guest code executing `CPUID` observes exactly the table the host configured, and that the
//! table can no longer be altered once the vCPU has run.
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg(target_arch = "x86_64")]

/// Harness configuration.
pub mod config;
/// CPUID table vocabulary, mask policy and comparator.
pub mod cpuid;
/// Post-run mutation checks.
pub mod guard;
/// Guest side of the harness.
pub mod guest;
/// Top level driver and the vCPU target contract.
pub mod harness;
/// Logging.
pub mod logger;
/// `KVM_GET_CPUID2` buffer overflow checks.
pub mod overflow;
/// Guest/host signalling protocol.
pub mod sync;
/// Test doubles and fixtures shared by unit and integration tests.
pub mod test_utils;
/// KVM backed implementation of the vCPU target.
pub mod vstate;

pub use crate::harness::{ConformanceTarget, GuestExit, HarnessError, RunReport, TargetError};
