//! iovet CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use iovet::config::cli::Cli;
use iovet::config::{self, Config};
use iovet::job::JobSelector;
use iovet::monitor::Monitor;
use iovet::output::{json, text};
use iovet::{logging, IoContext, ProcessState};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("iovet: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = logging::init(config.output.verbosity, config.output.debug) {
        eprintln!("iovet: {:#}", e);
        return ExitCode::from(EXIT_FAILURE);
    }

    if config.output.dry_run {
        text::print_plan(&config);
        println!();
        println!("Dry run mode - configuration validated successfully");
        return ExitCode::SUCCESS;
    }

    match run(config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_FAILURE),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = config::toml::load(cli)?;
    config::validator::validate_config(&config).context("Configuration validation failed")?;
    Ok(config)
}

/// Run one job to completion; true if it succeeded
fn run(config: Config) -> Result<bool> {
    let start = chrono::Local::now();
    let config = Arc::new(config);

    let state = Arc::new(ProcessState::new(config.output.debug));
    state.install_signal_handler()?;
    let monitor = Monitor::start(Arc::clone(&state))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.test.mode,
        workers = config.worker_count(),
        "starting"
    );
    let template = IoContext::from_config(&config).context("Failed to set up devices")?;
    let id = state.create_job(Arc::clone(&config), &template, false)?;
    info!(job = id, "job started");

    let reports = state.wait_job(&JobSelector::All)?;
    monitor.shutdown();

    text::print_reports(&reports);
    if let Some(path) = &config.output.json {
        json::write_json_output(path, &json::build_report(&config, &reports, start))?;
        info!(path = %path.display(), "JSON report written");
    }

    Ok(!reports.is_empty() && reports.iter().all(|r| r.success))
}
