/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::task::spawn_blocking;
use tracing::{debug, trace};

use crate::error::SysfsError;

/// Integer access to control files.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Reads a decimal integer. `None` when the file is missing, unreadable,
    /// empty or doesn't hold an integer.
    async fn read_int(&self, path: &Path) -> Option<i64>;

    /// Writes `value` as a decimal string in a single write.
    async fn write_int(&self, path: &Path, value: i64) -> Result<(), SysfsError>;
}

/// Sysfs attributes take a value in one `write(2)`; anything less is an error.
fn write_once(file: &mut impl Write, path: PathBuf, data: &str) -> Result<(), SysfsError> {
    match file.write(data.as_bytes()) {
        Ok(written) if written == data.len() => Ok(()),
        Ok(written) => Err(SysfsError::ShortWrite {
            path,
            written,
            expected: data.len(),
        }),
        Err(source) => Err(SysfsError::Write { path, source }),
    }
}

/// The kernel's sysfs, accessed directly.
#[derive(Debug, Default, Copy, Clone)]
pub struct SysfsStore;

#[async_trait]
impl ValueStore for SysfsStore {
    async fn read_int(&self, path: &Path) -> Option<i64> {
        let contents = fs::read_to_string(path)
            .await
            .inspect_err(|message| debug!("Error reading {}: {message}", path.display()))
            .ok()?;
        contents
            .trim()
            .parse()
            .inspect_err(|message| debug!("Error parsing {}: {message}", path.display()))
            .ok()
    }

    async fn write_int(&self, path: &Path, value: i64) -> Result<(), SysfsError> {
        let path = path.to_path_buf();
        let data = value.to_string();
        trace!("Writing {data} to {}", path.display());
        spawn_blocking(move || {
            // Sysfs attributes already exist; a missing one means the
            // hardware lacks the control, so never create it.
            let mut file = match OpenOptions::new().write(true).truncate(true).open(&path) {
                Ok(file) => file,
                Err(source) => return Err(SysfsError::Write { path, source }),
            };
            write_once(&mut file, path, &data)
        })
        .await?
    }
}
