mod activity;
mod config;
mod display;
mod progress;
mod pty;
mod runner;
mod session;
mod signals;
mod status;
mod watchdog;

use clap::Parser;
use config::{Overrides, WatchdogFileConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "watchdog.toml";

/// Supervise a file transfer (typically `rsync --progress`) on a pseudo-terminal,
/// kill it when its transfer rate stays too low or it goes silent, and
/// optionally repeat it on an interval.
#[derive(Parser, Debug)]
#[command(name = "rsync-watchdog", version, about)]
pub struct Cli {
    /// Config file path [default: watchdog.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repeat the transfer every N seconds until interrupted
    #[arg(short, long, value_name = "SECONDS")]
    repeat_time: Option<u64>,

    /// Rate in bytes/s at or below which a sample counts as low (overrides config)
    #[arg(long, value_name = "BYTES_PER_SEC")]
    rate_floor: Option<u64>,

    /// Seconds of low rate tolerated before killing the transfer (overrides config)
    #[arg(long, value_name = "SECONDS")]
    stale_after: Option<u64>,

    /// Write supervisor state as JSON to this file on every transition
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog decisions, state changes)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Transfer command and arguments (overrides config), after `--`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn print_resolved(config: &WatchdogFileConfig) {
    println!("rsync-watchdog v{}", env!("CARGO_PKG_VERSION"));
    println!("Command:          {}", config.command_vector().join(" "));
    for (key, value) in &config.transfer.env {
        println!("Env:              {key}={value}");
    }
    println!(
        "Rate floor:       {} bytes/s",
        display::group_thousands(config.watchdog.rate_floor_bytes_per_sec)
    );
    println!("Stale after:      {}s", config.watchdog.stale_after_secs);
    println!(
        "Silence ladder:   terminate after {}s, kill after {}s",
        config.activity.terminate_after_secs, config.activity.kill_after_secs
    );
    println!("Poll interval:    {}ms", config.watchdog.poll_interval_ms);
    match config.repeat.interval_secs {
        Some(secs) => println!("Repeat:           every {secs}s"),
        None => println!("Repeat:           no"),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let mut config = match WatchdogFileConfig::load(&config_path, required) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    config.apply(Overrides {
        command: cli.command.clone(),
        repeat_secs: cli.repeat_time,
        rate_floor: cli.rate_floor,
        stale_after_secs: cli.stale_after,
    });

    if config.command_vector().is_empty() {
        tracing::error!("no transfer command configured");
        std::process::exit(1);
    }

    if cli.dry_run {
        print_resolved(&config);
        println!("Dry run mode, config validated, not running.");
        return;
    }

    let shutdown = match signals::ShutdownFlag::install() {
        Ok(flag) => flag,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            std::process::exit(1);
        }
    };

    let mut sink = display::TerminalSink::stdout();
    let mut status = status::StatusTracker::new(cli.status_file.clone());
    let code = runner::run_repeating(&config, &mut sink, &mut status, shutdown);
    status.remove();

    tracing::info!(exit_code = code, "rsync-watchdog finished");
    std::process::exit(code);
}
