// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use cpuid_harness::HarnessError;
use cpuid_harness::config::{ConfigError, HarnessConfig};
use cpuid_harness::cpuid::CpuidKey;
use cpuid_harness::logger::{
    LOGGER, LevelFilter, LoggerConfig, LoggerInitError, LoggerUpdateError,
};
use cpuid_harness::vstate::{KvmTarget, KvmTargetError};
use log::{error, info};

const EXIT_CODE_ERROR: i32 = 1;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum Error {
    /// Failed to load configuration: {0}
    Config(#[from] ConfigError),
    /// Failed to register logger: {0}
    LoggerInit(#[from] LoggerInitError),
    /// Failed to configure logger: {0}
    LoggerUpdate(#[from] LoggerUpdateError),
    /// Failed to create the vCPU: {0}
    Target(#[from] KvmTargetError),
    /// CPUID conformance check failed: {0}
    Harness(#[from] HarnessError),
}

type Result<T> = std::result::Result<T, Error>;

/// Checks that a KVM vCPU's CPUID table is consistent with the host, observed unchanged by the
/// guest and frozen once the vCPU has run.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path of a JSON harness config file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log level, overriding the config file.
    #[arg(short, long)]
    level: Option<LevelFilter>,
    /// Path of the log file, overriding the config file.
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,
    /// Flip EAX of the given entry in the guest's copy of the table; the guest must abort.
    #[arg(long, value_name = "LEAF[.SUBLEAF]")]
    corrupt_leaf: Option<CpuidKey>,
    /// Guest memory size in MiB.
    #[arg(long, value_name = "MIB")]
    mem_size_mib: Option<usize>,
}

impl Cli {
    /// Merges the config file, if any, with the flags.
    fn harness_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_file(path)?,
            None => HarnessConfig::default(),
        };

        if self.level.is_some() || self.log_path.is_some() {
            let logger = config.logger.get_or_insert_with(LoggerConfig::default);
            if let Some(level) = self.level {
                logger.level = Some(level);
            }
            if let Some(log_path) = &self.log_path {
                logger.log_path = Some(log_path.clone());
            }
        }
        if let Some(key) = self.corrupt_leaf {
            config.corrupt_guest_entry = Some(key);
        }
        if let Some(mem_size_mib) = self.mem_size_mib {
            config.mem_size_mib = mem_size_mib;
        }

        config.validate()?;
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.harness_config()?;

    LOGGER.init()?;
    if let Some(logger) = config.logger.clone() {
        LOGGER.update(logger)?;
    }

    let mut target = KvmTarget::with_one_vcpu(&config)?;
    let report = cpuid_harness::harness::run(&mut target, &config).inspect_err(|err| {
        error!("{err}");
    })?;
    info!("{report}");
    println!("{report}");

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(EXIT_CODE_ERROR);
    }
}
