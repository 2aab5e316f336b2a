// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cpuid::CpuidKey;
use crate::logger::LoggerConfig;

/// The default memory size of the VM, in MiB.
pub const DEFAULT_MEM_SIZE_MIB: usize = 1;
/// The guest only addresses its first 64 KiB, so there is no point in more than this.
pub const MAX_MEM_SIZE_MIB: usize = 1024;

/// Errors associated with loading the harness configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Cannot read configuration file: {0}
    Read(#[from] std::io::Error),
    /// Cannot parse configuration: {0}
    Parse(#[from] serde_json::Error),
    /// The memory size (MiB) must be between 1 and 1024, got {0}
    InvalidMemorySize(usize),
}

/// Configuration of one conformance run.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// The guest memory size in MiB.
    #[serde(default = "default_mem_size_mib")]
    pub mem_size_mib: usize,
    /// Entry whose EAX is flipped in the guest's copy of the table, so that the guest aborts.
    #[serde(default)]
    pub corrupt_guest_entry: Option<CpuidKey>,
    /// Logger settings.
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
}

fn default_mem_size_mib() -> usize {
    DEFAULT_MEM_SIZE_MIB
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mem_size_mib: DEFAULT_MEM_SIZE_MIB,
            corrupt_guest_entry: None,
            logger: None,
        }
    }
}

impl HarnessConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Checks the values deserialization cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_MEM_SIZE_MIB).contains(&self.mem_size_mib) {
            return Err(ConfigError::InvalidMemorySize(self.mem_size_mib));
        }
        Ok(())
    }
}
