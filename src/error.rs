/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures writing a control file.
///
/// Reads never fail: a missing or unparseable file is reported as an absent
/// value instead.
#[derive(Error, Debug)]
pub enum SysfsError {
    /// The privilege gate refused the write before it was attempted.
    #[error("Not permitted to write control files")]
    NotPrivileged,

    /// The file could not be opened or written, most commonly because of
    /// missing privileges or hardware that lacks the control.
    #[error("Error writing to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel accepted only part of the value.
    #[error("Short write to {}: wrote {written} of {expected} bytes", path.display())]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[error("Sysfs write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
