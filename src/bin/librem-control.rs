/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{bail, ensure, Result};
use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::subscriber::set_global_default;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use librem_control::{
    Config, ControlPanel, FixedPrivilege, Led, Override, PrivilegeGate, ProcessPrivilege, Status,
    SysfsStore,
};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Read this configuration file after the default ones
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stage and report changes without writing anything
    #[arg(long)]
    preview: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every control
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Set the battery charge thresholds
    Thresholds {
        /// Percentage below which charging starts
        #[arg(long)]
        start: Option<i32>,

        /// Percentage at which charging stops
        #[arg(long)]
        end: Option<i32>,
    },

    /// Start charging now, up to the end threshold
    ChargeNow,

    /// Stop charging now
    StopChargeNow,

    /// Set the CPU package power limits
    PowerLimits {
        /// Long-term limit (PL1) in watts
        #[arg(long)]
        pl1: Option<f64>,

        /// Short-term limit (PL2) in watts
        #[arg(long)]
        pl2: Option<f64>,
    },

    /// Set the brightness of an LED
    Led {
        /// red, green, blue, kbd_backlight or airplane
        led: Led,
        brightness: u32,
    },

    /// Turn the airplane-mode LED on or off
    Airplane {
        #[arg(value_parser = BoolishValueParser::new())]
        enabled: bool,
    },

    /// Print the user ids the panel runs as
    Whoami,
}

fn print_status(status: &Status) {
    let battery = &status.battery;
    println!("Privileged: {}", status.privileged);
    println!("State of charge: {}%", battery.state_of_charge);
    println!(
        "Charge thresholds: start {}%, end {}%",
        battery.start_threshold, battery.end_threshold
    );
    if status.pending_thresholds.start != battery.start_threshold
        || status.pending_thresholds.end != battery.end_threshold
    {
        println!(
            "  staged: start {}%, end {}%",
            status.pending_thresholds.start, status.pending_thresholds.end
        );
    }
    println!(
        "CPU power limits: PL1 {} W, PL2 {} W",
        status.power_limits.pl1_watts, status.power_limits.pl2_watts
    );
    if status.pending_power_limits != status.power_limits {
        println!(
            "  staged: PL1 {} W, PL2 {} W",
            status.pending_power_limits.pl1_watts, status.pending_power_limits.pl2_watts
        );
    }
    for led in &status.leds {
        match led.brightness {
            Some(brightness) => println!("LED {}: {brightness}/{}", led.led, led.max_brightness),
            None => println!("LED {}: unavailable", led.led),
        }
    }
}

async fn apply(panel: &mut ControlPanel, what: &str) -> Result<()> {
    if !panel.has_pending_edits() {
        println!("{what} unchanged");
        return Ok(());
    }
    if !panel.is_privileged() {
        print_status(&panel.status().await);
        println!("Not applied: writing {what} requires root");
        return Ok(());
    }
    panel.apply().await
}

async fn run_override(panel: &mut ControlPanel, outcome: Result<Override>) -> Result<()> {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            panel.battery.cancel_override().await;
            return Err(e);
        }
    };
    if let Override::Skipped(reason) = outcome {
        bail!("{reason}");
    }
    let interrupted = tokio::select! {
        () = panel.battery.settle() => false,
        res = tokio::signal::ctrl_c() => {
            res?;
            true
        }
    };
    if interrupted {
        info!("Interrupted, restoring charge threshold now");
        panel.battery.cancel_override().await;
    }
    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    let stderr_log = fmt::layer().with_writer(std::io::stderr);
    let subscriber = Registry::default()
        .with(stderr_log)
        .with(EnvFilter::from_default_env());
    set_global_default(subscriber)?;

    let config = Config::load(args.config.as_deref())?;
    let privilege: Arc<dyn PrivilegeGate> = if args.preview {
        Arc::new(FixedPrivilege(false))
    } else {
        Arc::new(ProcessPrivilege)
    };
    let mut panel = ControlPanel::load(&config, Arc::new(SysfsStore), privilege).await;

    match args.command {
        Commands::Status { json } => {
            let status = panel.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Thresholds { start, end } => {
            ensure!(
                start.is_some() || end.is_some(),
                "Give a start or end threshold"
            );
            if let Some(start) = start {
                panel.battery.set_start(start);
            }
            if let Some(end) = end {
                panel.battery.set_end(end);
            }
            apply(&mut panel, "charge thresholds").await?;
        }
        Commands::ChargeNow => {
            let outcome = panel.battery.start_charge_now().await;
            run_override(&mut panel, outcome).await?;
        }
        Commands::StopChargeNow => {
            let outcome = panel.battery.stop_charge_now().await;
            run_override(&mut panel, outcome).await?;
        }
        Commands::PowerLimits { pl1, pl2 } => {
            ensure!(pl1.is_some() || pl2.is_some(), "Give a PL1 or PL2 limit");
            if let Some(pl1) = pl1 {
                panel.power.set_pl1(pl1);
            }
            if let Some(pl2) = pl2 {
                panel.power.set_pl2(pl2);
            }
            apply(&mut panel, "CPU power limits").await?;
        }
        Commands::Led { led, brightness } => {
            let written = panel.leds.set_brightness(led, brightness).await?;
            println!("LED {led}: {written}");
        }
        Commands::Airplane { enabled } => {
            panel.leds.set_airplane_mode(enabled).await?;
        }
        Commands::Whoami => {
            let process = ProcessPrivilege;
            println!("UID={}", process.uid());
            println!("EUID={}", process.euid());
        }
    }
    Ok(())
}
