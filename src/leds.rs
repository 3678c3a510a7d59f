/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{error, warn};

use crate::error::SysfsError;
use crate::path;
use crate::privilege::PrivilegeGate;
use crate::sysfs::ValueStore;

const BRIGHTNESS_SUFFIX: &str = "brightness";
const MAX_BRIGHTNESS_SUFFIX: &str = "max_brightness";

pub const DEFAULT_MAX_BRIGHTNESS: u32 = 255;

#[derive(Display, EnumString, EnumIter, Serialize, Hash, Eq, PartialEq, Debug, Copy, Clone)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Led {
    Red,
    Green,
    Blue,
    KbdBacklight,
    Airplane,
}

impl Led {
    fn device_name(self) -> &'static str {
        match self {
            Led::Red => "red:status",
            Led::Green => "green:status",
            Led::Blue => "blue:status",
            Led::KbdBacklight => "librem_ec:kbd_backlight",
            Led::Airplane => "librem_ec:airplane",
        }
    }
}

#[derive(Serialize, PartialEq, Eq, Debug, Copy, Clone)]
pub struct LedState {
    pub led: Led,
    pub brightness: Option<u32>,
    pub max_brightness: u32,
}

/// Direct brightness access for the status LEDs, keyboard backlight and
/// airplane-mode LED. Writes go straight to the hardware; nothing is staged.
pub struct LedControl {
    store: Arc<dyn ValueStore>,
    privilege: Arc<dyn PrivilegeGate>,
    base: PathBuf,
}

impl LedControl {
    pub fn new(
        store: Arc<dyn ValueStore>,
        privilege: Arc<dyn PrivilegeGate>,
        leds: impl AsRef<Path>,
    ) -> LedControl {
        LedControl {
            store,
            privilege,
            base: path(leds),
        }
    }

    fn attribute(&self, led: Led, suffix: &str) -> PathBuf {
        self.base.join(led.device_name()).join(suffix)
    }

    pub async fn brightness(&self, led: Led) -> Option<u32> {
        let value = self
            .store
            .read_int(&self.attribute(led, BRIGHTNESS_SUFFIX))
            .await?;
        u32::try_from(value)
            .inspect_err(|_| warn!("Ignoring brightness {value} of {led} LED"))
            .ok()
    }

    pub async fn max_brightness(&self, led: Led) -> u32 {
        self.store
            .read_int(&self.attribute(led, MAX_BRIGHTNESS_SUFFIX))
            .await
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_BRIGHTNESS)
    }

    pub async fn state(&self, led: Led) -> LedState {
        LedState {
            led,
            brightness: self.brightness(led).await,
            max_brightness: self.max_brightness(led).await,
        }
    }

    pub async fn states(&self) -> Vec<LedState> {
        let mut states = Vec::new();
        for led in Led::iter() {
            states.push(self.state(led).await);
        }
        states
    }

    /// Sets `led` to `brightness`, clamped to what the LED supports.
    /// Returns the value written.
    pub async fn set_brightness(&self, led: Led, brightness: u32) -> Result<u32, SysfsError> {
        if !self.privilege.is_privileged() {
            return Err(SysfsError::NotPrivileged);
        }
        let brightness = brightness.min(self.max_brightness(led).await);
        self.store
            .write_int(&self.attribute(led, BRIGHTNESS_SUFFIX), brightness.into())
            .await
            .inspect_err(|message| error!("Error setting {led} LED brightness: {message}"))?;
        Ok(brightness)
    }

    pub async fn airplane_mode(&self) -> Option<bool> {
        self.brightness(Led::Airplane)
            .await
            .map(|brightness| brightness > 0)
    }

    pub async fn set_airplane_mode(&self, enabled: bool) -> Result<(), SysfsError> {
        let brightness = if enabled {
            self.max_brightness(Led::Airplane).await
        } else {
            0
        };
        self.set_brightness(Led::Airplane, brightness).await?;
        Ok(())
    }
}
