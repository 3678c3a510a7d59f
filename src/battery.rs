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
use std::time::Duration;
use strum::Display;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SysfsError;
use crate::path;
use crate::privilege::PrivilegeGate;
use crate::sysfs::ValueStore;

const CAPACITY_SUFFIX: &str = "capacity";
const START_THRESHOLD_SUFFIX: &str = "charge_control_start_threshold";
const END_THRESHOLD_SUFFIX: &str = "charge_control_end_threshold";

pub const START_THRESHOLD_RANGE: RangeInclusive<i32> = 10..=99;
pub const END_THRESHOLD_RANGE: RangeInclusive<i32> = 11..=100;

const DEFAULT_START_THRESHOLD: i32 = 90;
const DEFAULT_END_THRESHOLD: i32 = 100;
const DEFAULT_STATE_OF_CHARGE: i32 = 0;

/// A pair of charge thresholds, in percent.
#[derive(Serialize, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Thresholds {
    pub start: i32,
    pub end: i32,
}

impl Default for Thresholds {
    fn default() -> Thresholds {
        Thresholds {
            start: DEFAULT_START_THRESHOLD,
            end: DEFAULT_END_THRESHOLD,
        }
    }
}

impl Thresholds {
    pub fn is_valid(&self) -> bool {
        START_THRESHOLD_RANGE.contains(&self.start)
            && END_THRESHOLD_RANGE.contains(&self.end)
            && self.start < self.end
    }

    /// Pulls both thresholds back into range, keeping `start < end`.
    fn clamped(self) -> Thresholds {
        let start = self
            .start
            .clamp(*START_THRESHOLD_RANGE.start(), *START_THRESHOLD_RANGE.end());
        let end = self.end.clamp(start + 1, *END_THRESHOLD_RANGE.end());
        Thresholds { start, end }
    }
}

/// Applied thresholds together with the last state of charge read.
#[derive(Serialize, PartialEq, Eq, Debug, Copy, Clone)]
pub struct ThresholdState {
    pub start_threshold: i32,
    pub end_threshold: i32,
    pub state_of_charge: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryPaths {
    pub capacity: PathBuf,
    pub start_threshold: PathBuf,
    pub end_threshold: PathBuf,
}

impl BatteryPaths {
    pub fn new(battery: impl AsRef<Path>) -> BatteryPaths {
        let base = path(battery);
        BatteryPaths {
            capacity: base.join(CAPACITY_SUFFIX),
            start_threshold: base.join(START_THRESHOLD_SUFFIX),
            end_threshold: base.join(END_THRESHOLD_SUFFIX),
        }
    }
}

#[derive(Display, PartialEq, Eq, Debug, Copy, Clone)]
pub enum SkipReason {
    #[strum(to_string = "Not permitted to write charge thresholds")]
    Unprivileged,
    #[strum(to_string = "Battery charge is already above the end threshold")]
    AboveEndThreshold,
    #[strum(to_string = "Battery charge is not above the start threshold")]
    NotAboveStartThreshold,
    #[strum(to_string = "Battery is already fully charged")]
    Full,
}

/// Outcome of a charge-now or stop-charge-now request.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Override {
    /// The transient threshold was written and its restore is scheduled.
    Scheduled,
    Skipped(SkipReason),
}

struct ScheduledRestore {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Staged and applied battery charge thresholds.
///
/// Values are staged with [`set_start`](Self::set_start) and
/// [`set_end`](Self::set_end), which keep the staged pair ordered, and only
/// reach the hardware through [`apply`](Self::apply).
pub struct ThresholdController {
    store: Arc<dyn ValueStore>,
    privilege: Arc<dyn PrivilegeGate>,
    paths: BatteryPaths,
    override_delay: Duration,
    applied: Thresholds,
    pending: Thresholds,
    state_of_charge: i32,
    restore: Option<ScheduledRestore>,
}

impl ThresholdController {
    pub fn new(
        store: Arc<dyn ValueStore>,
        privilege: Arc<dyn PrivilegeGate>,
        paths: BatteryPaths,
        override_delay: Duration,
    ) -> ThresholdController {
        ThresholdController {
            store,
            privilege,
            paths,
            override_delay,
            applied: Thresholds::default(),
            pending: Thresholds::default(),
            state_of_charge: DEFAULT_STATE_OF_CHARGE,
            restore: None,
        }
    }

    pub async fn load(
        store: Arc<dyn ValueStore>,
        privilege: Arc<dyn PrivilegeGate>,
        paths: BatteryPaths,
        override_delay: Duration,
    ) -> ThresholdController {
        let mut controller = ThresholdController::new(store, privilege, paths, override_delay);
        controller.refresh().await;
        controller
    }

    async fn read_percent(&self, path: &Path) -> Option<i32> {
        let value = self.store.read_int(path).await?;
        i32::try_from(value)
            .inspect_err(|_| warn!("Ignoring out of range value {value} in {}", path.display()))
            .ok()
    }

    /// Re-reads thresholds and state of charge, discarding staged edits.
    /// Files that can't be read keep their previous values.
    pub async fn refresh(&mut self) {
        self.finish_override().await;

        let mut applied = self.applied;
        match self.read_percent(&self.paths.start_threshold).await {
            Some(start) => applied.start = start,
            None => debug!("No start threshold available, keeping {}", applied.start),
        }
        match self.read_percent(&self.paths.end_threshold).await {
            Some(end) => applied.end = end,
            None => debug!("No end threshold available, keeping {}", applied.end),
        }
        if let Some(soc) = self.read_percent(&self.paths.capacity).await {
            self.state_of_charge = soc;
        }

        if !applied.is_valid() {
            let clamped = applied.clamped();
            warn!("Hardware thresholds {applied:?} are inconsistent, using {clamped:?}");
            applied = clamped;
        }
        self.applied = applied;
        self.pending = applied;
    }

    pub fn applied(&self) -> Thresholds {
        self.applied
    }

    pub fn pending(&self) -> Thresholds {
        self.pending
    }

    pub fn state_of_charge(&self) -> i32 {
        self.state_of_charge
    }

    pub fn state(&self) -> ThresholdState {
        ThresholdState {
            start_threshold: self.applied.start,
            end_threshold: self.applied.end,
            state_of_charge: self.state_of_charge,
        }
    }

    pub fn has_pending_edits(&self) -> bool {
        self.pending != self.applied
    }

    pub fn is_privileged(&self) -> bool {
        self.privilege.is_privileged()
    }

    /// Stages a new start threshold, raising the end threshold when needed
    /// to stay at least one point above it.
    pub fn set_start(&mut self, value: i32) -> Thresholds {
        let start = value.clamp(*START_THRESHOLD_RANGE.start(), *START_THRESHOLD_RANGE.end());
        self.pending.start = start;
        if start + 1 > self.pending.end {
            self.pending.end = start + 1;
        }
        self.pending
    }

    /// Stages a new end threshold, lowering the start threshold when needed
    /// to stay at least one point below it. The value itself is not clamped.
    pub fn set_end(&mut self, value: i32) -> Thresholds {
        self.pending.end = value;
        let below = value.saturating_sub(1);
        if below < self.pending.start {
            self.pending.start = below;
        }
        self.pending
    }

    /// Commits the staged thresholds and writes them, start first.
    ///
    /// The applied state is updated even when unprivileged or when the
    /// writes fail; write failures are returned after both were attempted.
    pub async fn apply(&mut self) -> Result<()> {
        self.finish_override().await;
        if !self.has_pending_edits() {
            return Ok(());
        }

        let mut target = self.pending;
        if !target.is_valid() {
            let clamped = target.clamped();
            warn!("Staged thresholds {target:?} are out of range, applying {clamped:?}");
            target = clamped;
        }
        self.applied = target;
        self.pending = target;

        if !self.is_privileged() {
            debug!("Not privileged, keeping thresholds {target:?} in memory only");
            return Ok(());
        }

        info!("Setting charge thresholds to {}..{}", target.start, target.end);
        let start = self.write(&self.paths.start_threshold, target.start).await;
        let end = self.write(&self.paths.end_threshold, target.end).await;
        let start = match (start, &end) {
            // Raising both thresholds past the old end can get the start
            // rejected until the new end is in place.
            (Err(_), Ok(())) => self.write(&self.paths.start_threshold, target.start).await,
            (start, _) => start,
        };

        let failures: Vec<String> = [start, end]
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();
        ensure!(
            failures.is_empty(),
            "Failed to write charge thresholds: {}",
            failures.join(", ")
        );
        Ok(())
    }

    async fn write(&self, path: &Path, value: i32) -> Result<(), SysfsError> {
        self.store
            .write_int(path, value.into())
            .await
            .inspect_err(|message| error!("Error writing charge threshold: {message}"))
    }

    /// Drops staged edits. Returns whether anything was staged.
    pub fn undo(&mut self) -> bool {
        let changed = self.has_pending_edits();
        self.pending = self.applied;
        changed
    }

    /// Makes the battery start charging now, up to the end threshold, by
    /// briefly moving the start threshold just below the end threshold.
    ///
    /// A failed write of the transient threshold is returned, with its
    /// restore already scheduled.
    pub async fn start_charge_now(&mut self) -> Result<Override> {
        self.finish_override().await;
        if !self.is_privileged() {
            return Ok(Override::Skipped(SkipReason::Unprivileged));
        }
        if self.applied.end < self.state_of_charge {
            return Ok(Override::Skipped(SkipReason::AboveEndThreshold));
        }
        let path = self.paths.start_threshold.clone();
        self.schedule_override(path, self.applied.end - 1, self.applied.start)
            .await
    }

    /// Makes the battery stop charging now by briefly moving the end
    /// threshold just above the current charge.
    pub async fn stop_charge_now(&mut self) -> Result<Override> {
        self.finish_override().await;
        if !self.is_privileged() {
            return Ok(Override::Skipped(SkipReason::Unprivileged));
        }
        // No end threshold lies above a full battery.
        if self.state_of_charge >= *END_THRESHOLD_RANGE.end() {
            return Ok(Override::Skipped(SkipReason::Full));
        }
        if self.applied.start >= self.state_of_charge {
            return Ok(Override::Skipped(SkipReason::NotAboveStartThreshold));
        }
        let path = self.paths.end_threshold.clone();
        self.schedule_override(path, self.state_of_charge + 1, self.applied.end)
            .await
    }

    async fn schedule_override(
        &mut self,
        path: PathBuf,
        transient: i32,
        restore: i32,
    ) -> Result<Override> {
        debug!(
            "Overriding {} with {transient} for {:?}",
            path.display(),
            self.override_delay
        );
        // The restore runs even if this fails, so the hardware is never left
        // holding the transient value.
        let written = self.write(&path, transient).await;

        let token = CancellationToken::new();
        let moved_token = token.clone();
        let store = self.store.clone();
        let delay = self.override_delay;
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = sleep(delay) => (),
                () = moved_token.cancelled() => debug!("Charge override cut short"),
            }
            if let Err(message) = store.write_int(&path, restore.into()).await {
                error!("Error restoring charge threshold to {restore}: {message}");
            }
        });
        self.restore = Some(ScheduledRestore { token, handle });
        written?;
        Ok(Override::Scheduled)
    }

    /// Whether an override is still holding its transient value.
    pub fn override_pending(&self) -> bool {
        self.restore
            .as_ref()
            .is_some_and(|restore| !restore.handle.is_finished())
    }

    /// Waits for a scheduled restore to run. Dropping the returned future
    /// early leaves the restore scheduled.
    pub async fn settle(&mut self) {
        let Some(restore) = self.restore.as_mut() else {
            return;
        };
        if let Err(e) = (&mut restore.handle).await {
            error!("Charge override restore task failed: {e}");
        }
        self.restore = None;
    }

    /// Stops waiting on a scheduled override and restores the threshold now.
    pub async fn cancel_override(&mut self) {
        self.finish_override().await;
    }

    async fn finish_override(&mut self) {
        if let Some(ref restore) = self.restore {
            restore.token.cancel();
        }
        self.settle().await;
    }
}

impl Drop for ThresholdController {
    fn drop(&mut self) {
        if let Some(ref restore) = self.restore {
            restore.token.cancel();
        }
    }
}
