/// Single session lifecycle: spawn the transfer on ptys, watch its output,
/// enforce the rate and silence policies, report the exit status.
///
/// Everything runs on the calling thread. The only place the loop blocks is
/// `poll` on the stdout/stderr masters, bounded by `poll_interval`, so the
/// time-based checks run even when the child is silent.
///
/// The child leads its own process group so that signals reach rsync's ssh
/// helper too. That group is in the background of the operator's terminal,
/// so the transfer must authenticate non-interactively: a prompt read from
/// `/dev/tty` stops the child with SIGTTIN until the silence ladder ends it.
use crate::activity::{ActivityAction, ActivityMonitor, ActivityState};
use crate::config::WatchdogFileConfig;
use crate::display::ProgressSink;
use crate::progress::parse_progress_line;
use crate::pty::{PtyError, PtySet, StreamKind};
use crate::signals::ShutdownFlag;
use crate::status::{StatusTracker, SupervisorState};
use crate::watchdog::{RateDecision, RatePolicy, WatchdogState};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Exit code reported when the operator interrupts a session.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// A partial line longer than this is emitted without waiting for a newline.
const MAX_PENDING_LINE: usize = 4096;

/// How often the interrupt path checks whether the child has gone.
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Tunables for one supervised run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub rate_policy: RatePolicy,
    pub activity: ActivityMonitor,
    pub poll_interval: Duration,
    pub read_chunk_bytes: usize,
    pub interrupt_grace: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &WatchdogFileConfig) -> Self {
        Self {
            rate_policy: RatePolicy::new(
                config.watchdog.rate_floor_bytes_per_sec,
                config.watchdog.stale_after(),
            ),
            activity: ActivityMonitor::new(
                config.activity.terminate_after(),
                config.activity.kill_after(),
            ),
            poll_interval: config.watchdog.poll_interval(),
            read_chunk_bytes: config.watchdog.read_chunk_bytes.max(1),
            interrupt_grace: Duration::from_millis(config.shutdown.interrupt_grace_ms),
        }
    }

    fn poll_timeout(&self) -> PollTimeout {
        let ms = u16::try_from(self.poll_interval.as_millis()).unwrap_or(u16::MAX);
        PollTimeout::from(ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&WatchdogFileConfig::default())
    }
}

/// Why the supervisor signalled the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    LowRate,
    Silence,
    Interrupt,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::LowRate => write!(f, "low_rate"),
            TerminationReason::Silence => write!(f, "silence"),
            TerminationReason::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The child exited; `code` is its exit code, or 128 + signal number if
    /// it died from a signal.
    Exited { code: i32 },
    /// The operator interrupted the session.
    Interrupted,
}

/// Result of a completed session.
#[derive(Debug)]
pub struct SessionResult {
    pub outcome: SessionOutcome,
    /// Wall-clock duration of the session.
    pub duration: Duration,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
    /// Number of progress samples seen.
    pub samples: u64,
    /// First reason the supervisor signalled the child, if it did.
    pub terminated_for: Option<TerminationReason>,
}

impl SessionResult {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            SessionOutcome::Exited { code } => code,
            SessionOutcome::Interrupted => INTERRUPTED_EXIT_CODE,
        }
    }
}

/// Errors that can occur during session execution.
#[derive(Debug)]
pub enum SessionError {
    /// No executable was given.
    EmptyCommand,
    /// Failed to acquire the ptys.
    Pty(PtyError),
    /// Failed to spawn the transfer subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// `poll` failed for a reason other than a signal.
    Poll { source: nix::Error },
    /// Failed to read from a pty master.
    Read {
        stream: StreamKind,
        source: std::io::Error,
    },
    /// Failed to collect the child's exit status.
    Wait { source: std::io::Error },
    /// Failed to signal the child's process group.
    Signal { signal: Signal, source: nix::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::EmptyCommand => write!(f, "no transfer command given"),
            SessionError::Pty(e) => write!(f, "{e}"),
            SessionError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            SessionError::Poll { source } => write!(f, "poll on child output failed: {source}"),
            SessionError::Read { stream, source } => {
                write!(f, "failed to read child {stream}: {source}")
            }
            SessionError::Wait { source } => {
                write!(f, "failed to collect child exit status: {source}")
            }
            SessionError::Signal { signal, source } => {
                write!(f, "failed to send {signal} to child: {source}")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::EmptyCommand => None,
            SessionError::Pty(e) => Some(e),
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Poll { source } => Some(source),
            SessionError::Read { source, .. } => Some(source),
            SessionError::Wait { source } => Some(source),
            SessionError::Signal { source, .. } => Some(source),
        }
    }
}

impl From<PtyError> for SessionError {
    fn from(e: PtyError) -> Self {
        SessionError::Pty(e)
    }
}

/// Splits raw pty bytes into lines on `\n` or `\r`.
///
/// rsync redraws progress with `\r`, so both count as terminators. Blank
/// lines are dropped.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                lines.extend(self.take());
            } else {
                self.pending.push(b);
                if self.pending.len() >= MAX_PENDING_LINE {
                    lines.extend(self.take());
                }
            }
        }
        lines
    }

    /// Emit whatever partial line is buffered.
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        (!line.trim().is_empty()).then_some(line)
    }
}

/// The spawned child, in its own process group.
///
/// Dropping an unreaped child kills its group and reaps it.
struct ChildProcess {
    child: Child,
    pgid: Pid,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn signal(&self, signal: Signal) -> Result<(), SessionError> {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SessionError::Signal { signal, source }),
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, SessionError> {
        if self.status.is_none() {
            self.status = self
                .child
                .try_wait()
                .map_err(|source| SessionError::Wait { source })?;
        }
        Ok(self.status)
    }

    fn wait(&mut self) -> Result<ExitStatus, SessionError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .map_err(|source| SessionError::Wait { source })?;
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = killpg(self.pgid, Signal::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

/// Per-invocation state; a repeated run starts from a fresh one.
struct Session {
    child: ChildProcess,
    started: Instant,
    watchdog: WatchdogState,
    activity: ActivityState,
    assemblers: [LineAssembler; 2],
    escalation: ActivityAction,
    terminated_for: Option<TerminationReason>,
    samples: u64,
}

/// Drives one child invocation to completion.
pub struct Supervisor<'a, S: ProgressSink> {
    settings: &'a SessionSettings,
    sink: &'a mut S,
    status: &'a mut StatusTracker,
    shutdown: ShutdownFlag,
}

impl<'a, S: ProgressSink> Supervisor<'a, S> {
    pub fn new(
        settings: &'a SessionSettings,
        sink: &'a mut S,
        status: &'a mut StatusTracker,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            settings,
            sink,
            status,
            shutdown,
        }
    }

    /// Run `command` (executable followed by arguments) with extra
    /// environment variables `env` until it exits or is interrupted.
    pub fn run(
        &mut self,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<SessionResult, SessionError> {
        let (program, args) = command.split_first().ok_or(SessionError::EmptyCommand)?;

        self.status.update(SupervisorState::Starting);
        let ptys = PtySet::open()?;
        let stdio = ptys.child_stdio()?;

        let started = Instant::now();
        let child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr)
            .process_group(0) // New process group for clean kill
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(pid, "transfer subprocess started");
        self.status.set_child_pid(pid);
        self.status.update(SupervisorState::Running);

        let mut session = Session {
            child: ChildProcess {
                pgid: Pid::from_raw(pid as i32),
                child,
                status: None,
            },
            started,
            watchdog: WatchdogState::new(started),
            activity: ActivityState::new(started),
            assemblers: [LineAssembler::default(), LineAssembler::default()],
            escalation: ActivityAction::None,
            terminated_for: None,
            samples: 0,
        };

        let mut buf = vec![0u8; self.settings.read_chunk_bytes];
        let exit_status = loop {
            if self.shutdown.is_set() {
                return self.finish_interrupted(&mut session);
            }

            let readable = match self.wait_readable(&ptys) {
                Ok(readable) => readable,
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(SessionError::Poll { source }),
            };

            let now = Instant::now();
            let mut got_output = false;
            for (idx, (stream, master)) in ptys.output_masters().into_iter().enumerate() {
                if !readable[idx] {
                    continue;
                }
                let n = read_chunk(master, &mut buf)
                    .map_err(|source| SessionError::Read { stream, source })?;
                if n == 0 {
                    continue;
                }
                got_output = true;
                session.activity.record(now);
                session.escalation = ActivityAction::None;
                for line in session.assemblers[idx].push(&buf[..n]) {
                    self.handle_line(&mut session, &line, now)?;
                }
            }
            if got_output {
                continue;
            }

            // Nothing to read this tick.
            for idx in 0..session.assemblers.len() {
                if let Some(line) = session.assemblers[idx].flush() {
                    self.handle_line(&mut session, &line, now)?;
                }
            }
            if let Some(status) = session.child.try_wait()? {
                break status;
            }
            self.check_activity(&mut session, now)?;
        };

        let code = exit_code(exit_status);
        let duration = session.started.elapsed();
        info!(
            pid,
            exit_code = code,
            samples = session.samples,
            duration_secs = duration.as_secs(),
            "transfer subprocess exited"
        );
        self.status.set_exit_code(Some(code));
        self.status.update(SupervisorState::Exited);

        Ok(SessionResult {
            outcome: SessionOutcome::Exited { code },
            duration,
            pid,
            samples: session.samples,
            terminated_for: session.terminated_for,
        })
    }

    fn wait_readable(&self, ptys: &PtySet) -> nix::Result<[bool; 2]> {
        let [(_, out), (_, err)] = ptys.output_masters();
        let mut fds = [
            PollFd::new(out.as_fd(), PollFlags::POLLIN),
            PollFd::new(err.as_fd(), PollFlags::POLLIN),
        ];
        if poll(&mut fds, self.settings.poll_timeout())? == 0 {
            return Ok([false, false]);
        }
        Ok(fds.map(|fd| {
            fd.revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
        }))
    }

    fn handle_line(
        &mut self,
        session: &mut Session,
        line: &str,
        now: Instant,
    ) -> Result<(), SessionError> {
        if !session.watchdog.in_progress_run {
            self.sink.raw_line(line);
        }

        let sample = match parse_progress_line(line) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                session.watchdog.in_progress_run = false;
                session.watchdog.last_status_line = line.to_string();
                return Ok(());
            }
            Err(e) => {
                warn!(line, error = %e, "ignoring progress line with unusable rate");
                return Ok(());
            }
        };

        self.sink.progress(
            &sample,
            &session.watchdog.last_status_line,
            session.watchdog.in_progress_run,
        );
        session.watchdog.in_progress_run = true;
        session.samples += 1;
        self.status.set_last_sample(&sample);

        match self
            .settings
            .rate_policy
            .evaluate(&sample, &mut session.watchdog, now)
        {
            RateDecision::Healthy | RateDecision::Tolerated => {}
            RateDecision::Degraded { grace_remaining } => {
                self.sink.announce(&format!(
                    "Rate is too low!!! {:.2} seconds",
                    grace_remaining.as_secs_f64()
                ));
                session.watchdog.in_progress_run = false;
            }
            RateDecision::Terminate { stale_for } => {
                session.watchdog.in_progress_run = false;
                self.terminate(session, TerminationReason::LowRate, stale_for)?;
            }
        }
        Ok(())
    }

    fn check_activity(&mut self, session: &mut Session, now: Instant) -> Result<(), SessionError> {
        let action = self.settings.activity.check(&session.activity, now);
        if action <= session.escalation {
            return Ok(());
        }
        session.escalation = action;

        let silent_for = session.activity.silent_for(now);
        match action {
            ActivityAction::None => Ok(()),
            ActivityAction::Terminate => {
                self.terminate(session, TerminationReason::Silence, silent_for)
            }
            ActivityAction::Kill => self.kill(session, TerminationReason::Silence, silent_for),
        }
    }

    fn terminate(
        &mut self,
        session: &mut Session,
        reason: TerminationReason,
        elapsed: Duration,
    ) -> Result<(), SessionError> {
        let secs = elapsed.as_secs_f64();
        // An interrupt is announced once, by the runner.
        match reason {
            TerminationReason::LowRate => self.sink.announce(&format!(
                "Killing process as rate too low ({secs:.2} seconds since last acceptable rate)"
            )),
            TerminationReason::Silence => self.sink.announce(&format!(
                "No activity for {secs:.2} seconds, terminating transfer process"
            )),
            TerminationReason::Interrupt => {}
        }
        warn!(
            pid = session.child.pid(),
            %reason,
            elapsed_secs = format!("{secs:.2}"),
            "sending SIGTERM to transfer"
        );
        session.terminated_for.get_or_insert(reason);
        self.status.update(SupervisorState::Terminating);
        session.child.signal(Signal::SIGTERM)
    }

    fn kill(
        &mut self,
        session: &mut Session,
        reason: TerminationReason,
        elapsed: Duration,
    ) -> Result<(), SessionError> {
        let secs = elapsed.as_secs_f64();
        let cause = match reason {
            TerminationReason::LowRate => "rate too low",
            TerminationReason::Silence => "no activity",
            TerminationReason::Interrupt => "did not stop after keyboard interrupt",
        };
        self.sink.announce(&format!(
            "Killing transfer process after {secs:.2} seconds ({cause})"
        ));
        warn!(
            pid = session.child.pid(),
            %reason,
            elapsed_secs = format!("{secs:.2}"),
            "sending SIGKILL to transfer"
        );
        session.terminated_for.get_or_insert(reason);
        self.status.update(SupervisorState::Killing);
        session.child.signal(Signal::SIGKILL)
    }

    /// Stop the child after an operator interrupt: SIGTERM, wait up to
    /// `interrupt_grace`, then SIGKILL.
    fn finish_interrupted(&mut self, session: &mut Session) -> Result<SessionResult, SessionError> {
        let pid = session.child.pid();
        if session.child.try_wait()?.is_none() {
            let since_start = session.started.elapsed();
            self.terminate(session, TerminationReason::Interrupt, since_start)?;

            let deadline = Instant::now() + self.settings.interrupt_grace;
            while session.child.try_wait()?.is_none() {
                if Instant::now() >= deadline {
                    self.kill(session, TerminationReason::Interrupt, since_start)?;
                    session.child.wait()?;
                    break;
                }
                std::thread::sleep(REAP_INTERVAL);
            }
        }

        let code = session.child.status.map(exit_code);
        debug!(pid, exit_code = ?code, "transfer stopped after interrupt");
        self.status.set_exit_code(code);
        self.status.update(SupervisorState::Interrupted);

        Ok(SessionResult {
            outcome: SessionOutcome::Interrupted,
            duration: session.started.elapsed(),
            pid,
            samples: session.samples,
            terminated_for: session.terminated_for,
        })
    }
}

/// Read at most `buf.len()` bytes from a pty master that `poll` reported
/// readable. `EIO` (slave side gone) and `EINTR` read as zero bytes.
fn read_chunk(mut master: &File, buf: &mut [u8]) -> std::io::Result<usize> {
    match master.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(0),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ) =>
        {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// The child's exit code, or 128 + signal number if it was killed.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TelemetrySample;

    #[derive(Default)]
    struct RecordingSink {
        raw: Vec<String>,
        samples: Vec<(TelemetrySample, String, bool)>,
        announcements: Vec<String>,
        /// Request shutdown when this exact line is echoed.
        interrupt_on: Option<(String, ShutdownFlag)>,
    }

    impl ProgressSink for RecordingSink {
        fn raw_line(&mut self, line: &str) {
            if let Some((trigger, flag)) = &self.interrupt_on {
                if trigger == line {
                    flag.request();
                }
            }
            self.raw.push(line.to_string());
        }

        fn progress(&mut self, sample: &TelemetrySample, filename: &str, continuing_run: bool) {
            self.samples
                .push((sample.clone(), filename.to_string(), continuing_run));
        }

        fn announce(&mut self, message: &str) {
            self.announcements.push(message.to_string());
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_millis(10),
            ..SessionSettings::default()
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn run_with(
        settings: &SessionSettings,
        command: &[String],
        shutdown: ShutdownFlag,
    ) -> (Result<SessionResult, SessionError>, RecordingSink) {
        let mut sink = RecordingSink::default();
        let mut status = StatusTracker::disabled();
        let result = Supervisor::new(settings, &mut sink, &mut status, shutdown)
            .run(command, &BTreeMap::new());
        (result, sink)
    }

    fn run(settings: &SessionSettings, command: &[String]) -> (SessionResult, RecordingSink) {
        let (result, sink) = run_with(settings, command, ShutdownFlag::detached());
        (result.unwrap(), sink)
    }

    // --- LineAssembler ---

    #[test]
    fn test_assembler_splits_on_newline_and_carriage_return() {
        let mut lines = LineAssembler::default();
        assert_eq!(
            lines.push(b"file.iso\r\n  1,024  1%  1.00MB/s  0:00:09\r  2,048"),
            vec!["file.iso", "  1,024  1%  1.00MB/s  0:00:09"]
        );
        assert_eq!(lines.push(b"  2%\n"), vec!["  2,048  2%"]);
        assert_eq!(lines.flush(), None);
    }

    #[test]
    fn test_assembler_keeps_partial_line_until_flush() {
        let mut lines = LineAssembler::default();
        assert!(lines.push(b"partial").is_empty());
        assert_eq!(lines.flush(), Some("partial".to_string()));
        assert_eq!(lines.flush(), None);
    }

    #[test]
    fn test_assembler_drops_blank_lines() {
        let mut lines = LineAssembler::default();
        assert!(lines.push(b"\r\n   \n\n").is_empty());
    }

    #[test]
    fn test_assembler_caps_runaway_line() {
        let mut lines = LineAssembler::default();
        let out = lines.push(&vec![b'x'; MAX_PENDING_LINE + 10]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), MAX_PENDING_LINE);
        assert_eq!(lines.flush().map(|l| l.len()), Some(10));
    }

    #[test]
    fn test_assembler_rejoins_split_utf8() {
        let mut lines = LineAssembler::default();
        let bytes = "café.txt\n".as_bytes();
        assert!(lines.push(&bytes[..4]).is_empty());
        assert_eq!(lines.push(&bytes[4..]), vec!["café.txt"]);
    }

    // --- exit codes ---

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    // --- supervisor ---

    #[test]
    fn test_parses_progress_line_from_child() {
        let (result, sink) = run(
            &settings(),
            &sh("echo big.iso; printf ' 823,915,288  35%%   36.65MB/s    0:00:40\\n'"),
        );

        assert_eq!(result.outcome, SessionOutcome::Exited { code: 0 });
        assert_eq!(result.samples, 1);
        assert!(result.terminated_for.is_none());
        assert!(result.pid > 0);

        let (sample, filename, continuing) = &sink.samples[0];
        assert_eq!(sample.bytes_transferred, 823_915_288);
        assert_eq!(sample.percent_transferred, 35.0);
        assert_eq!(sample.transfer_rate, (36.65f64 * 1024.0 * 1024.0).round() as u64);
        assert_eq!(sample.eta, "0:00:40");
        assert_eq!(filename, "big.iso");
        assert!(!continuing);
        assert_eq!(sink.raw[0], "big.iso");
    }

    #[test]
    fn test_progress_burst_suppresses_raw_echo() {
        let (result, sink) = run(
            &settings(),
            &sh("echo a.bin; \
                 printf '1,000 10%% 1.00MB/s 0:00:05\\n'; \
                 printf '2,000 20%% 1.00MB/s 0:00:04\\n'; \
                 printf '3,000 30%% 1.00MB/s 0:00:03\\n'; \
                 echo b.bin"),
        );
        assert_eq!(result.samples, 3);
        // Only the first line of a burst is echoed; the line that ends the
        // burst becomes the filename for the next one.
        assert_eq!(sink.raw.len(), 2, "raw: {:?}", sink.raw);
        assert_eq!(sink.raw[0], "a.bin");
        assert!(sink.raw[1].starts_with("1,000 10%"));
        let continuing: Vec<bool> = sink.samples.iter().map(|s| s.2).collect();
        assert_eq!(continuing, vec![false, true, true]);
    }

    #[test]
    fn test_reads_stderr_too() {
        let (result, sink) = run(&settings(), &sh("echo oops >&2"));
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 0 });
        assert_eq!(sink.raw, vec!["oops"]);
    }

    #[test]
    fn test_nonzero_exit_is_reported() {
        let (result, _) = run(&settings(), &sh("exit 23"));
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 23 });
        assert_eq!(result.exit_code(), 23);
    }

    #[test]
    fn test_unknown_rate_unit_is_skipped() {
        let (result, sink) = run(
            &settings(),
            &sh("printf '1,000 5%% 5GB/s 0:00:01\\n'; echo next.txt"),
        );
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 0 });
        assert_eq!(result.samples, 0);
        assert!(sink.samples.is_empty());
        assert_eq!(sink.raw.last().map(String::as_str), Some("next.txt"));
    }

    #[test]
    fn test_environment_is_passed_to_child() {
        let mut sink = RecordingSink::default();
        let mut status = StatusTracker::disabled();
        let env = BTreeMap::from([("WATCHDOG_TEST_VALUE".to_string(), "xyzzy".to_string())]);
        let result = Supervisor::new(&settings(), &mut sink, &mut status, ShutdownFlag::detached())
            .run(&sh("echo $WATCHDOG_TEST_VALUE"), &env)
            .unwrap();
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 0 });
        assert_eq!(sink.raw, vec!["xyzzy"]);
    }

    #[test]
    fn test_sustained_low_rate_terminates_child() {
        let settings = SessionSettings {
            rate_policy: RatePolicy::new(100_000, Duration::from_millis(100)),
            ..settings()
        };
        let (result, sink) = run(
            &settings,
            &sh("for i in 1 2 3 4 5 6; do printf '1,000 1%% 1.00KB/s 0:10:00\\n'; sleep 0.1; done; \
                 sleep 10"),
        );

        assert_eq!(result.terminated_for, Some(TerminationReason::LowRate));
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 143 });
        assert!(result.duration < Duration::from_secs(5));
        assert!(sink
            .announcements
            .iter()
            .any(|m| m.starts_with("Killing process as rate too low")));
    }

    #[test]
    fn test_healthy_rate_is_left_alone() {
        let settings = SessionSettings {
            rate_policy: RatePolicy::new(100_000, Duration::from_millis(50)),
            ..settings()
        };
        let (result, sink) = run(
            &settings,
            &sh("for i in 1 2 3; do printf '1,000 1%% 5.00MB/s 0:00:10\\n'; sleep 0.1; done"),
        );
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 0 });
        assert_eq!(result.samples, 3);
        assert!(result.terminated_for.is_none());
        assert!(sink.announcements.is_empty());
    }

    #[test]
    fn test_silent_child_is_terminated() {
        let settings = SessionSettings {
            activity: ActivityMonitor::new(Duration::from_millis(200), Duration::from_secs(30)),
            ..settings()
        };
        let (result, sink) = run(&settings, &sh("sleep 10"));

        assert_eq!(result.terminated_for, Some(TerminationReason::Silence));
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 143 });
        assert!(result.duration < Duration::from_secs(5));
        assert_eq!(sink.announcements.len(), 1);
        assert!(sink.announcements[0].starts_with("No activity for"));
    }

    #[test]
    fn test_silent_child_ignoring_term_is_killed() {
        let settings = SessionSettings {
            activity: ActivityMonitor::new(Duration::from_millis(200), Duration::from_millis(600)),
            ..settings()
        };
        let (result, sink) = run(&settings, &sh("trap '' TERM; exec sleep 10"));

        assert_eq!(result.terminated_for, Some(TerminationReason::Silence));
        assert_eq!(result.outcome, SessionOutcome::Exited { code: 137 });
        assert!(result.duration >= Duration::from_millis(600));
        assert!(result.duration < Duration::from_secs(5));
        assert_eq!(sink.announcements.len(), 2, "{:?}", sink.announcements);
        assert!(sink.announcements[0].starts_with("No activity for"));
        assert!(sink.announcements[1].starts_with("Killing transfer process"));
        assert!(sink.announcements[1].ends_with("(no activity)"));
    }

    #[test]
    fn test_interrupt_stops_child_and_reports_interrupted() {
        let shutdown = ShutdownFlag::detached();
        shutdown.request();
        let (result, sink) = run_with(&settings(), &sh("sleep 10"), shutdown);
        let result = result.unwrap();

        assert_eq!(result.outcome, SessionOutcome::Interrupted);
        assert_eq!(result.exit_code(), INTERRUPTED_EXIT_CODE);
        assert!(result.duration < Duration::from_secs(5));
        assert!(sink.announcements.is_empty(), "{:?}", sink.announcements);
    }

    #[test]
    fn test_interrupt_kills_child_ignoring_term_after_grace() {
        let settings = SessionSettings {
            interrupt_grace: Duration::from_millis(200),
            ..settings()
        };
        let shutdown = ShutdownFlag::detached();
        let mut sink = RecordingSink {
            interrupt_on: Some(("ready".to_string(), shutdown)),
            ..RecordingSink::default()
        };
        let mut status = StatusTracker::disabled();
        let result = Supervisor::new(&settings, &mut sink, &mut status, shutdown)
            .run(&sh("trap '' TERM; echo ready; exec sleep 10"), &BTreeMap::new())
            .unwrap();

        assert_eq!(result.outcome, SessionOutcome::Interrupted);
        assert_eq!(result.terminated_for, Some(TerminationReason::Interrupt));
        assert!(result.duration < Duration::from_secs(5));
        assert_eq!(sink.announcements.len(), 1, "{:?}", sink.announcements);
        assert!(sink.announcements[0].starts_with("Killing transfer process"));
        assert!(sink.announcements[0].contains("keyboard interrupt"));
    }

    #[test]
    fn test_unusable_rate_does_not_touch_rate_state() {
        let settings = SessionSettings {
            rate_policy: RatePolicy::new(100_000, Duration::from_secs(60)),
            ..settings()
        };

        // low, bad, low: the bad line neither resets nor extends the streak,
        // so the second low sample is the consecutive one.
        let (result, sink) = run(
            &settings,
            &sh("printf '1,000 1%% 1.00KB/s 0:10:00\n';                  printf '2,000 2%% 5GB/s 0:00:01\n';                  printf '3,000 3%% 1.00KB/s 0:10:00\n'"),
        );
        assert_eq!(result.samples, 2);
        let warnings: Vec<_> = sink
            .announcements
            .iter()
            .filter(|m| m.starts_with("Rate is too low!!!"))
            .collect();
        assert_eq!(warnings.len(), 1, "{:?}", sink.announcements);

        // low, bad, high, low: only the high sample clears the streak.
        let (result, sink) = run(
            &settings,
            &sh("printf '1,000 1%% 1.00KB/s 0:10:00\n';                  printf '2,000 2%% 5GB/s 0:00:01\n';                  printf '3,000 3%% 5.00MB/s 0:00:01\n';                  printf '4,000 4%% 1.00KB/s 0:10:00\n'"),
        );
        assert_eq!(result.samples, 3);
        assert!(sink.announcements.is_empty(), "{:?}", sink.announcements);
    }

    #[test]
    fn test_child_sees_only_standard_descriptors() {
        // Two runs in a row: neither child inherits a pty of its own or an
        // earlier session.
        for _ in 0..2 {
            let (result, sink) = run(
                &settings(),
                &sh("n=3; while [ $n -lt 64 ]; do \
                       [ -e /proc/$$/fd/$n ] && printf '%s ' $n; n=$((n+1)); \
                     done; echo end"),
            );
            assert_eq!(result.outcome, SessionOutcome::Exited { code: 0 });
            assert_eq!(sink.raw, vec!["end"]);
        }
    }

    #[test]
    fn test_child_leads_its_own_process_group() {
        // Field 5 of /proc/<pid>/stat is the process group id.
        let (result, sink) = run(&settings(), &sh("cut -d' ' -f5 /proc/$$/stat"));
        assert_eq!(sink.raw, vec![result.pid.to_string()]);
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let (result, _) = run_with(&settings(), &[], ShutdownFlag::detached());
        assert!(matches!(result, Err(SessionError::EmptyCommand)));
    }

    #[test]
    fn test_spawn_failure() {
        let (result, _) = run_with(
            &settings(),
            &["nonexistent-binary-xyz".to_string()],
            ShutdownFlag::detached(),
        );
        let err = result.unwrap_err();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn nonexistent-binary-xyz"));
    }

    #[test]
    fn test_status_tracker_follows_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.status");
        let mut sink = RecordingSink::default();
        let mut status = StatusTracker::new(Some(path.clone()));
        status.begin_run("sh");
        Supervisor::new(&settings(), &mut sink, &mut status, ShutdownFlag::detached())
            .run(&sh("printf '1,000 1%% 5.00MB/s 0:00:10\\n'; exit 4"), &BTreeMap::new())
            .unwrap();

        assert_eq!(status.state(), SupervisorState::Exited);
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["state"], "exited");
        assert_eq!(parsed["last_exit_code"], 4);
        assert_eq!(parsed["last_sample"]["bytes_transferred"], 1000);
    }
}
