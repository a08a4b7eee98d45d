/// Top-level loop: run the transfer once, or forever on an interval until
/// the operator interrupts.
///
/// Each run gets a fresh supervisor session (new ptys, new watchdog state).
/// A failed or killed run does not stop repeating; an interrupt does.
use crate::config::WatchdogFileConfig;
use crate::display::ProgressSink;
use crate::session::{SessionOutcome, SessionSettings, Supervisor, INTERRUPTED_EXIT_CODE};
use crate::signals::ShutdownFlag;
use crate::status::{StatusTracker, SupervisorState};
use chrono::Local;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Granularity of the interruptible wait between runs.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Run the configured transfer and return the process exit code.
pub fn run_repeating<S: ProgressSink>(
    config: &WatchdogFileConfig,
    sink: &mut S,
    status: &mut StatusTracker,
    shutdown: ShutdownFlag,
) -> i32 {
    let command = config.command_vector();
    let command_line = command.join(" ");
    let settings = SessionSettings::from_config(config);
    let repeat = config.repeat.interval_secs.map(Duration::from_secs);

    let mut last_code = 0;
    loop {
        status.begin_run(&command_line);
        info!(command = %command_line, "executing transfer");
        sink.announce(&format!("Executing: {command_line}"));

        match Supervisor::new(&settings, sink, status, shutdown).run(&command, &config.transfer.env) {
            Ok(result) if result.outcome == SessionOutcome::Interrupted => {
                sink.announce("Program terminated with keyboard interrupt. Exiting...");
                return INTERRUPTED_EXIT_CODE;
            }
            Ok(result) => {
                last_code = result.exit_code();
                if last_code != 0 {
                    warn!(
                        pid = result.pid,
                        exit_code = last_code,
                        terminated_for = ?result.terminated_for,
                        samples = result.samples,
                        duration_secs = result.duration.as_secs(),
                        "transfer exited unsuccessfully"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "transfer session failed");
                last_code = 1;
            }
        }

        let Some(interval) = repeat else {
            break;
        };
        status.update(SupervisorState::WaitingToRepeat);
        if !wait_for_next_run(interval, shutdown, sink) {
            status.update(SupervisorState::Interrupted);
            sink.announce("Program terminated with keyboard interrupt. Exiting...");
            return INTERRUPTED_EXIT_CODE;
        }
    }
    last_code
}

/// Sleep for `interval`, waking every `WAIT_SLICE` to check for an
/// interrupt. Returns false if interrupted.
fn wait_for_next_run<S: ProgressSink>(
    interval: Duration,
    shutdown: ShutdownFlag,
    sink: &mut S,
) -> bool {
    let now = Local::now();
    let next = chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| now.checked_add_signed(d));
    sink.announce(&format!("Current time is:     {}", now.format("%H:%M:%S")));
    if let Some(next) = next {
        sink.announce(&format!("Will repeat sync at: {}", next.format("%H:%M:%S")));
    }

    let deadline = Instant::now() + interval;
    loop {
        if shutdown.is_set() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(WAIT_SLICE));
    }
}
