// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Wall-clock time in the local timezone, with nanosecond precision.
#[derive(Debug, Clone, Copy)]
pub struct LocalTime {
    sec: i32,
    min: i32,
    hour: i32,
    mday: i32,
    /// Months since January.
    mon: i32,
    /// Years since 1900.
    year: i32,
    nsec: i64,
}

impl LocalTime {
    /// Returns the local time of the calling moment.
    pub fn now() -> LocalTime {
        let mut timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `libc::tm` is a plain C struct for which all-zeroes is a valid value.
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };

        // SAFETY: Safe because the parameters are valid pointers to owned values.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut timespec);
            libc::localtime_r(&timespec.tv_sec, &mut tm);
        }

        LocalTime {
            sec: tm.tm_sec,
            min: tm.tm_min,
            hour: tm.tm_hour,
            mday: tm.tm_mday,
            mon: tm.tm_mon,
            year: tm.tm_year,
            nsec: timespec.tv_nsec,
        }
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
            self.year + 1900,
            self.mon + 1,
            self.mday,
            self.hour,
            self.min,
            self.sec,
            self.nsec
        )
    }
}
