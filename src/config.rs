/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
#[cfg(not(test))]
use xdg::BaseDirectories;

use crate::path;

const SYSTEM_CONFIG_PATH: &str = "/usr/share/librem-control/config.toml";
const ADMIN_CONFIG_PATH: &str = "/etc/librem-control/config.toml";

#[derive(Clone, Default, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub battery: BatteryConfig,
}

/// Where the control files live.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub battery: PathBuf,
    pub rapl: PathBuf,
    pub leds: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> PathsConfig {
        PathsConfig {
            battery: PathBuf::from("/sys/class/power_supply/BAT0"),
            rapl: PathBuf::from("/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0"),
            leds: PathBuf::from("/sys/class/leds"),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct BatteryConfig {
    /// How long a charge-now or stop-charge-now override holds its
    /// transient threshold before restoring it.
    pub override_delay_ms: u64,
}

impl Default for BatteryConfig {
    fn default() -> BatteryConfig {
        BatteryConfig {
            override_delay_ms: 1000,
        }
    }
}

impl BatteryConfig {
    pub fn override_delay(&self) -> Duration {
        Duration::from_millis(self.override_delay_ms)
    }
}

#[cfg(not(test))]
fn user_config_path() -> Option<PathBuf> {
    BaseDirectories::new().get_config_file("librem-control/config.toml")
}

#[cfg(test)]
fn user_config_path() -> Option<PathBuf> {
    Some(path("librem-control/config.toml"))
}

fn add_file(
    builder: ConfigBuilder<DefaultState>,
    file: &Path,
    required: bool,
) -> ConfigBuilder<DefaultState> {
    debug!("Reading configuration from {}", file.display());
    builder.add_source(File::new(&file.to_string_lossy(), FileFormat::Toml).required(required))
}

impl Config {
    /// Layers the system, administrator and user configuration files, then
    /// `explicit` if given. Only `explicit` has to exist.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let mut builder = config::Config::builder();
        builder = add_file(builder, &path(SYSTEM_CONFIG_PATH), false);
        builder = add_file(builder, &path(ADMIN_CONFIG_PATH), false);
        if let Some(user) = user_config_path() {
            builder = add_file(builder, &user, false);
        }
        if let Some(explicit) = explicit {
            builder = add_file(builder, explicit, true);
        }
        builder
            .build()?
            .try_deserialize()
            .map_err(|e| anyhow!("Error parsing configuration: {e}"))
    }
}
