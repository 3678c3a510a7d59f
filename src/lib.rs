/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use std::path::{Path, PathBuf};

pub mod battery;
pub mod config;
pub mod error;
pub mod leds;
pub mod panel;
pub mod power;
pub mod privilege;
pub mod sysfs;

#[cfg(test)]
mod testing;

pub use crate::battery::{Override, SkipReason, ThresholdController, ThresholdState, Thresholds};
pub use crate::config::Config;
pub use crate::error::SysfsError;
pub use crate::leds::{Led, LedControl};
pub use crate::panel::{ControlPanel, Status};
pub use crate::power::{PowerLimitController, PowerLimits};
pub use crate::privilege::{FixedPrivilege, PrivilegeGate, ProcessPrivilege};
pub use crate::sysfs::{SysfsStore, ValueStore};

#[cfg(not(test))]
pub fn path<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref().to_path_buf()
}

#[cfg(test)]
pub fn path<P: AsRef<Path>>(path: P) -> PathBuf {
    let current_test = crate::testing::current();
    let path = path.as_ref();
    current_test
        .path()
        .join(path.strip_prefix("/").unwrap_or(path))
}
