/// Optional JSON status file for external monitors.
///
/// Rewritten whole on every supervisor transition; a sibling temp file is
/// renamed over the target so readers see either the old or the new state.
use crate::progress::TelemetrySample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Terminating,
    Killing,
    Exited,
    Interrupted,
    WaitingToRepeat,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub child_pid: Option<u32>,
    pub state: SupervisorState,
    pub run: u32,
    pub command: String,
    pub session_start: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub last_sample: Option<TelemetrySample>,
    pub last_exit_code: Option<i32>,
}

/// Location of the status file.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Replace the file contents with `data`.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".watchdog.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Builds `StatusData` for each update. Without a file it only tracks the
/// current state.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    state: SupervisorState,
    child_pid: Option<u32>,
    run: u32,
    command: String,
    session_start: Option<DateTime<Utc>>,
    last_sample: Option<TelemetrySample>,
    last_exit_code: Option<i32>,
}

impl StatusTracker {
    pub fn new(status_path: Option<PathBuf>) -> Self {
        Self {
            file: status_path.map(StatusFile::new),
            pid: std::process::id(),
            state: SupervisorState::Starting,
            child_pid: None,
            run: 0,
            command: String::new(),
            session_start: None,
            last_sample: None,
            last_exit_code: None,
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::new(None)
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Record a transition and write the status file.
    pub fn update(&mut self, state: SupervisorState) {
        if state != self.state {
            tracing::debug!(from = ?self.state, to = ?state, "supervisor state change");
        }
        self.state = state;

        let Some(file) = &self.file else {
            return;
        };
        let data = StatusData {
            pid: self.pid,
            child_pid: self.child_pid,
            state,
            run: self.run,
            command: self.command.clone(),
            session_start: self.session_start,
            last_update: Utc::now(),
            last_sample: self.last_sample.clone(),
            last_exit_code: self.last_exit_code,
        };
        if let Err(e) = file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Mark the start of a new run of `command`.
    pub fn begin_run(&mut self, command: &str) {
        self.run += 1;
        self.command = command.to_string();
        self.child_pid = None;
        self.last_sample = None;
        self.session_start = Some(Utc::now());
    }

    pub fn set_child_pid(&mut self, pid: u32) {
        self.child_pid = Some(pid);
    }

    /// Remember the latest sample; it is written with the next transition.
    pub fn set_last_sample(&mut self, sample: &TelemetrySample) {
        self.last_sample = Some(sample.clone());
    }

    pub fn set_exit_code(&mut self, code: Option<i32>) {
        self.last_exit_code = code;
    }

    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

/// Failure to publish a status update.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "cannot encode status as JSON: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "cannot write status temp file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "cannot move {} into place at {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
