/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::battery::{BatteryPaths, ThresholdController, ThresholdState, Thresholds};
use crate::config::Config;
use crate::leds::{LedControl, LedState};
use crate::power::{PowerLimitController, PowerLimits, RaplPaths};
use crate::privilege::PrivilegeGate;
use crate::sysfs::ValueStore;

/// Everything the control panel shows, as last read.
#[derive(Serialize, Debug, Clone)]
pub struct Status {
    pub privileged: bool,
    pub battery: ThresholdState,
    pub pending_thresholds: Thresholds,
    pub power_limits: PowerLimits,
    pub pending_power_limits: PowerLimits,
    pub leds: Vec<LedState>,
}

/// Owns every controller. Built once and handed to whatever drives it.
pub struct ControlPanel {
    pub battery: ThresholdController,
    pub power: PowerLimitController,
    pub leds: LedControl,
    privilege: Arc<dyn PrivilegeGate>,
}

impl ControlPanel {
    pub async fn load(
        config: &Config,
        store: Arc<dyn ValueStore>,
        privilege: Arc<dyn PrivilegeGate>,
    ) -> ControlPanel {
        let battery = ThresholdController::load(
            store.clone(),
            privilege.clone(),
            BatteryPaths::new(&config.paths.battery),
            config.battery.override_delay(),
        )
        .await;
        let power = PowerLimitController::load(
            store.clone(),
            privilege.clone(),
            RaplPaths::new(&config.paths.rapl),
        )
        .await;
        let leds = LedControl::new(store, privilege.clone(), &config.paths.leds);
        ControlPanel {
            battery,
            power,
            leds,
            privilege,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privilege.is_privileged()
    }

    /// Whether any threshold or power limit differs from what was applied.
    pub fn has_pending_edits(&self) -> bool {
        self.battery.has_pending_edits() || self.power.has_pending_edits()
    }

    /// Whether applying would reach the hardware.
    pub fn can_apply(&self) -> bool {
        self.is_privileged() && self.has_pending_edits()
    }

    /// Applies thresholds, then power limits. Both are attempted even if
    /// the first fails.
    pub async fn apply(&mut self) -> Result<()> {
        let battery = self.battery.apply().await;
        let power = self.power.apply().await;
        match (battery, power) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(battery), Err(power)) => bail!("{battery}; {power}"),
        }
    }

    /// Drops every staged edit. Returns whether anything was staged.
    pub fn undo(&mut self) -> bool {
        let battery = self.battery.undo();
        let power = self.power.undo();
        battery || power
    }

    pub async fn status(&self) -> Status {
        Status {
            privileged: self.is_privileged(),
            battery: self.battery.state(),
            pending_thresholds: self.battery.pending(),
            power_limits: self.power.applied(),
            pending_power_limits: self.power.pending(),
            leds: self.leds.states().await,
        }
    }
}
