//! `stereonav` – command line front end for the localisation core.
//!
//! ```text
//! stereonav init      --config stereonav.toml
//! stereonav record    --config stereonav.toml --out run/ --length-mm 10000
//! stereonav calibrate --config stereonav.toml --path run/ --bias-x -200 --json
//! ```
//!
//! Ctrl-C stops path replay or calibration at the last complete record and
//! still prints the partial report.

mod calibrate;
mod config;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use colored::Colorize;
use stereonav_runtime::SteersmanConfig;
use stereonav_runtime::telemetry::{LogFormat, init_tracing_with};
use tracing::warn;

use calibrate::{CalibrateOptions, CalibrationReport, RecordOptions};

#[derive(Debug, Parser)]
#[command(author, version, about = "Stereo pose-sampling localisation toolkit")]
struct Cli {
    /// Emit newline-delimited JSON logs (overrides STEREONAV_LOG_FORMAT).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init {
        #[arg(long, default_value = "stereonav.toml")]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Record a straight path through the synthetic corridor.
    Record {
        #[arg(long, default_value = "stereonav.toml")]
        config: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 10_000.0)]
        length_mm: f32,
        #[arg(long, default_value_t = 100.0)]
        step_mm: f32,
        /// Features stored per step.
        #[arg(long, default_value_t = 300)]
        features: usize,
        /// Seed of the synthetic world.
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Replay a recorded path and localise along it with an injected bias.
    Calibrate {
        #[arg(long, default_value = "stereonav.toml")]
        config: PathBuf,
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = -200.0, allow_hyphen_values = true)]
        bias_x: f32,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        bias_y: f32,
        /// Localise at every n-th record.
        #[arg(long, default_value_t = 5)]
        every: usize,
        /// Features observed per localisation.
        #[arg(long, default_value_t = 50)]
        features: usize,
        /// Seed of the synthetic world; must match the recording.
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{}: {err}", "error".red().bold());
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::from_env() };
    let _guard = init_tracing_with("stereonav", format);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("{}", "Ctrl-C received, stopping after the current record".yellow().bold());
        stop_handler.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; runs cannot be interrupted cleanly");
    }

    match cli.command {
        Command::Init { config, force } => init(&config, force),
        Command::Record {
            config,
            out,
            length_mm,
            step_mm,
            features,
            seed,
        } => {
            let cfg = load_config(&config)?;
            let opts = RecordOptions {
                length_mm,
                step_mm,
                features,
                seed,
            };
            let records = calibrate::record(&cfg, &out, &opts)?;
            println!(
                "  {} Recorded {} steps to {}",
                "✓".green().bold(),
                records,
                out.display().to_string().bold()
            );
            Ok(())
        }
        Command::Calibrate {
            config,
            path,
            bias_x,
            bias_y,
            every,
            features,
            seed,
            json,
        } => {
            let cfg = load_config(&config)?;
            let opts = CalibrateOptions {
                bias_x_mm: bias_x,
                bias_y_mm: bias_y,
                every,
                features,
                seed,
            };
            let report = calibrate::calibrate(cfg, &path, &opts, &stop)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
    }
}

fn init(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
    }
    SteersmanConfig::default().save_to(path)?;
    println!(
        "  {} Config written to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

fn load_config(path: &Path) -> Result<SteersmanConfig, Box<dyn Error>> {
    match config::load(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            println!(
                "  {} {} not found, using the default configuration",
                "!".yellow().bold(),
                path.display()
            );
            let mut cfg = SteersmanConfig::default();
            config::apply_env_overrides(&mut cfg);
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

fn print_report(report: &CalibrationReport) {
    println!();
    println!("{}", "  Calibration".bold().cyan());
    println!("  Replayed      {} records, {} rays", report.records, report.rays);
    println!(
        "  Localised     {} of {} attempts",
        report.localised.to_string().bold(),
        report.attempts
    );
    if report.failures > 0 {
        println!("  Failures      {}", report.failures.to_string().yellow());
    }
    println!("  Bias          ({:.1}, {:.1}) mm", report.bias_x_mm, report.bias_y_mm);
    match (report.mean_offset_x_mm, report.mean_offset_y_mm, report.error_mm) {
        (Some(x), Some(y), Some(error_mm)) => {
            println!("  Mean offset   ({x:.1}, {y:.1}) mm");
            if let Some(pan) = report.mean_offset_pan_deg {
                println!("  Mean pan      {pan:.3}°");
            }
            let shown = format!("{error_mm:.1} mm");
            let shown = if error_mm < 75.0 { shown.green() } else { shown.red() };
            println!("  Error         {shown}");
        }
        _ => println!("  Mean offset   {}", "n/a".dimmed()),
    }
    if report.stopped {
        println!("  {}", "Stopped early on request.".yellow());
    }
    println!();
}
