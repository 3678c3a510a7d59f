/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{ensure, Result};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::path;
use crate::privilege::PrivilegeGate;
use crate::sysfs::ValueStore;

const PL1_SUFFIX: &str = "constraint_0_power_limit_uw";
const PL2_SUFFIX: &str = "constraint_1_power_limit_uw";

pub const PL1_RANGE: RangeInclusive<f64> = 5.0..=15.0;
pub const PL2_RANGE: RangeInclusive<f64> = 5.0..=25.0;

const MICROWATTS_PER_WATT: f64 = 1_000_000.0;

/// CPU package power limits, in watts.
#[derive(Serialize, PartialEq, Debug, Copy, Clone)]
pub struct PowerLimits {
    pub pl1_watts: f64,
    pub pl2_watts: f64,
}

impl Default for PowerLimits {
    fn default() -> PowerLimits {
        PowerLimits {
            pl1_watts: *PL1_RANGE.end(),
            pl2_watts: *PL2_RANGE.end(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaplPaths {
    pub pl1: PathBuf,
    pub pl2: PathBuf,
}

impl RaplPaths {
    pub fn new(rapl: impl AsRef<Path>) -> RaplPaths {
        let base = path(rapl);
        RaplPaths {
            pl1: base.join(PL1_SUFFIX),
            pl2: base.join(PL2_SUFFIX),
        }
    }
}

fn to_microwatts(watts: f64) -> i64 {
    (watts * MICROWATTS_PER_WATT).round() as i64
}

fn clamp_watts(watts: f64, range: &RangeInclusive<f64>) -> Option<f64> {
    if !watts.is_finite() {
        warn!("Ignoring power limit {watts}");
        return None;
    }
    Some(watts.clamp(*range.start(), *range.end()))
}

/// Staged and applied RAPL long-term (PL1) and short-term (PL2) limits.
pub struct PowerLimitController {
    store: Arc<dyn ValueStore>,
    privilege: Arc<dyn PrivilegeGate>,
    paths: RaplPaths,
    applied: PowerLimits,
    pending: PowerLimits,
}

impl PowerLimitController {
    pub async fn load(
        store: Arc<dyn ValueStore>,
        privilege: Arc<dyn PrivilegeGate>,
        paths: RaplPaths,
    ) -> PowerLimitController {
        let mut controller = PowerLimitController {
            store,
            privilege,
            paths,
            applied: PowerLimits::default(),
            pending: PowerLimits::default(),
        };
        controller.refresh().await;
        controller
    }

    async fn read_watts(&self, path: &Path, range: &RangeInclusive<f64>) -> Option<f64> {
        let microwatts = self.store.read_int(path).await?;
        let watts = microwatts as f64 / MICROWATTS_PER_WATT;
        if range.contains(&watts) {
            return Some(watts);
        }
        let clamped = watts.clamp(*range.start(), *range.end());
        warn!(
            "Ignoring out of range power limit {watts} W in {}, using {clamped} W",
            path.display()
        );
        Some(clamped)
    }

    /// Re-reads both limits, discarding staged edits.
    pub async fn refresh(&mut self) {
        match self.read_watts(&self.paths.pl1, &PL1_RANGE).await {
            Some(watts) => self.applied.pl1_watts = watts,
            None => debug!("No PL1 limit available"),
        }
        match self.read_watts(&self.paths.pl2, &PL2_RANGE).await {
            Some(watts) => self.applied.pl2_watts = watts,
            None => debug!("No PL2 limit available"),
        }
        self.pending = self.applied;
    }

    pub fn applied(&self) -> PowerLimits {
        self.applied
    }

    pub fn pending(&self) -> PowerLimits {
        self.pending
    }

    pub fn has_pending_edits(&self) -> bool {
        self.pending != self.applied
    }

    pub fn set_pl1(&mut self, watts: f64) -> PowerLimits {
        if let Some(watts) = clamp_watts(watts, &PL1_RANGE) {
            self.pending.pl1_watts = watts;
        }
        self.pending
    }

    pub fn set_pl2(&mut self, watts: f64) -> PowerLimits {
        if let Some(watts) = clamp_watts(watts, &PL2_RANGE) {
            self.pending.pl2_watts = watts;
        }
        self.pending
    }

    /// Commits the staged limits and writes them as microwatts, PL1 first.
    pub async fn apply(&mut self) -> Result<()> {
        if !self.has_pending_edits() {
            return Ok(());
        }
        let target = self.pending;
        self.applied = target;

        if !self.privilege.is_privileged() {
            debug!("Not privileged, keeping power limits {target:?} in memory only");
            return Ok(());
        }

        info!(
            "Setting CPU power limits to PL1 {} W, PL2 {} W",
            target.pl1_watts, target.pl2_watts
        );
        let mut failures = Vec::new();
        for (path, watts) in [
            (&self.paths.pl1, target.pl1_watts),
            (&self.paths.pl2, target.pl2_watts),
        ] {
            if let Err(message) = self.store.write_int(path, to_microwatts(watts)).await {
                error!("Error writing CPU power limit: {message}");
                failures.push(message.to_string());
            }
        }
        ensure!(
            failures.is_empty(),
            "Failed to write CPU power limits: {}",
            failures.join(", ")
        );
        Ok(())
    }

    /// Drops staged edits. Returns whether anything was staged.
    pub fn undo(&mut self) -> bool {
        let changed = self.has_pending_edits();
        self.pending = self.applied;
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::privilege::FixedPrivilege;
    use crate::sysfs::SysfsStore;
    use crate::testing::{self, write_node, FakeStore};
    use tokio::fs::read_to_string;

    const RAPL: &str = "/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0";

    async fn controller(privileged: bool) -> PowerLimitController {
        PowerLimitController::load(
            Arc::new(SysfsStore),
            Arc::new(FixedPrivilege(privileged)),
            RaplPaths::new(RAPL),
        )
        .await
    }

    #[tokio::test]
    async fn load_defaults_when_absent() {
        let _h = testing::start();
        let controller = controller(true).await;
        assert_eq!(
            controller.applied(),
            PowerLimits {
                pl1_watts: 15.0,
                pl2_watts: 25.0
            }
        );
        assert!(!controller.has_pending_edits());
    }

    #[tokio::test]
    async fn load_microwatts() {
        let _h = testing::start();
        write_node(format!("{RAPL}/{PL1_SUFFIX}"), "12500000\n")
            .await
            .expect("write");
        write_node(format!("{RAPL}/{PL2_SUFFIX}"), "20000000\n")
            .await
            .expect("write");

        let controller = controller(true).await;
        assert_eq!(
            controller.applied(),
            PowerLimits {
                pl1_watts: 12.5,
                pl2_watts: 20.0
            }
        );
    }

    #[tokio::test]
    async fn load_clamps_out_of_range() {
        let _h = testing::start();
        write_node(format!("{RAPL}/{PL1_SUFFIX}"), "2000000\n")
            .await
            .expect("write");
        write_node(format!("{RAPL}/{PL2_SUFFIX}"), "28000000\n")
            .await
            .expect("write");

        let mut controller = controller(true).await;
        assert_eq!(
            controller.applied(),
            PowerLimits {
                pl1_watts: 5.0,
                pl2_watts: 25.0
            }
        );
        assert!(!controller.has_pending_edits());

        controller.set_pl1(10.0);
        controller.apply().await.expect("apply");
        assert_eq!(
            read_to_string(path(RAPL).join(PL2_SUFFIX)).await.unwrap(),
            "25000000"
        );
    }

    #[tokio::test]
    async fn set_limits_clamp() {
        let _h = testing::start();
        let mut controller = controller(true).await;

        assert_eq!(controller.set_pl1(3.0).pl1_watts, 5.0);
        assert_eq!(controller.set_pl1(40.0).pl1_watts, 15.0);
        assert_eq!(controller.set_pl2(40.0).pl2_watts, 25.0);
        assert_eq!(controller.set_pl2(7.5).pl2_watts, 7.5);
        assert_eq!(controller.set_pl2(f64::NAN).pl2_watts, 7.5);
        assert_eq!(controller.pending().pl1_watts, 15.0);
        assert!(controller.has_pending_edits());
    }

    #[tokio::test]
    async fn apply_writes_microwatts() {
        let _h = testing::start();
        write_node(format!("{RAPL}/{PL1_SUFFIX}"), "15000000\n")
            .await
            .expect("write");
        write_node(format!("{RAPL}/{PL2_SUFFIX}"), "25000000\n")
            .await
            .expect("write");
        let mut controller = controller(true).await;

        controller.set_pl1(9.5);
        controller.set_pl2(18.0);
        controller.apply().await.expect("apply");
        assert!(!controller.has_pending_edits());

        let base = path(RAPL);
        assert_eq!(
            read_to_string(base.join(PL1_SUFFIX)).await.unwrap(),
            "9500000"
        );
        assert_eq!(
            read_to_string(base.join(PL2_SUFFIX)).await.unwrap(),
            "18000000"
        );
    }

    #[tokio::test]
    async fn apply_unprivileged_and_failures() {
        let _h = testing::start();
        let paths = RaplPaths {
            pl1: PathBuf::from("pl1"),
            pl2: PathBuf::from("pl2"),
        };
        let store = Arc::new(FakeStore::default());
        let mut controller = PowerLimitController::load(
            store.clone(),
            Arc::new(FixedPrivilege(false)),
            paths.clone(),
        )
        .await;
        controller.set_pl1(10.0);
        controller.apply().await.expect("apply");
        assert_eq!(controller.applied().pl1_watts, 10.0);
        assert!(store.writes().is_empty());

        store.fail_writes(true);
        let mut controller =
            PowerLimitController::load(store.clone(), Arc::new(FixedPrivilege(true)), paths).await;
        controller.set_pl2(12.0);
        assert!(controller.apply().await.is_err());
        assert_eq!(controller.applied().pl2_watts, 12.0);
        assert_eq!(
            store.writes(),
            vec![
                (PathBuf::from("pl1"), 15_000_000),
                (PathBuf::from("pl2"), 12_000_000)
            ]
        );

        // Nothing staged, so nothing written.
        controller.apply().await.expect("apply");
        assert_eq!(store.writes().len(), 2);
    }

    #[tokio::test]
    async fn undo_restores_applied() {
        let _h = testing::start();
        let mut controller = controller(true).await;
        controller.set_pl1(6.0);
        controller.set_pl2(6.0);
        assert!(controller.undo());
        assert_eq!(controller.pending(), controller.applied());
        assert!(!controller.undo());
    }
}
