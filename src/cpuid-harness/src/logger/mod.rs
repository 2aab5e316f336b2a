// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging for the harness and the `cpuid-check` tool.

mod logging;
mod time;

use std::sync::LockResult;

pub use log::*;

pub use crate::logger::logging::{
    DEFAULT_LEVEL, LOGGER, LevelFilter, LevelFilterFromStrError, Logger, LoggerConfig,
    LoggerInitError, LoggerUpdateError,
};
pub use crate::logger::time::LocalTime;

fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // If a thread panics while holding this lock, the writer within should still be usable.
        // (we might get an incomplete log line or something like that).
        Err(poisoned) => poisoned.into_inner(),
    }
}
