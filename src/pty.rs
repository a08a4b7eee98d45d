/// Pseudo-terminal plumbing for the transfer child.
///
/// rsync only prints live `--progress` updates when its output is a
/// terminal, so each standard stream of the child gets its own pty pair.
/// Requires a Unix host with `openpty(3)`.
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

/// Which standard stream of the child a pty pair serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    Stdin,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
            StreamKind::Stdin => write!(f, "stdin"),
        }
    }
}

/// Errors while acquiring or handing out pty descriptors.
#[derive(Debug)]
pub enum PtyError {
    /// `openpty` failed for the given stream.
    Allocate {
        stream: StreamKind,
        source: nix::Error,
    },
    /// Marking a fresh descriptor close-on-exec failed.
    CloseOnExec {
        stream: StreamKind,
        source: nix::Error,
    },
    /// Duplicating a slave descriptor for the child failed.
    Duplicate {
        stream: StreamKind,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::Allocate { stream, source } => {
                write!(f, "failed to allocate pty for {stream}: {source}")
            }
            PtyError::CloseOnExec { stream, source } => {
                write!(f, "failed to set close-on-exec on {stream} pty: {source}")
            }
            PtyError::Duplicate { stream, source } => {
                write!(f, "failed to duplicate {stream} pty slave: {source}")
            }
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::Allocate { source, .. } => Some(source),
            PtyError::CloseOnExec { source, .. } => Some(source),
            PtyError::Duplicate { source, .. } => Some(source),
        }
    }
}

/// One master/slave pair.
#[derive(Debug)]
pub struct PtyPair {
    pub master: File,
    pub slave: OwnedFd,
}

impl PtyPair {
    fn open(stream: StreamKind) -> Result<Self, PtyError> {
        let pty = openpty(None, None).map_err(|source| PtyError::Allocate { stream, source })?;
        // openpty descriptors are inheritable; only the dup2'd slaves may
        // reach the child.
        for fd in [&pty.master, &pty.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|source| PtyError::CloseOnExec { stream, source })?;
        }
        Ok(Self {
            master: File::from(pty.master),
            slave: pty.slave,
        })
    }

    /// A `Stdio` for the child backed by a duplicate of the slave end.
    fn child_stdio(&self, stream: StreamKind) -> Result<Stdio, PtyError> {
        let dup = self
            .slave
            .try_clone()
            .map_err(|source| PtyError::Duplicate { stream, source })?;
        Ok(Stdio::from(dup))
    }
}

/// The three pty pairs for one child invocation.
///
/// All six descriptors are owned here and closed when the set is dropped,
/// including when acquisition fails part-way through.
#[derive(Debug)]
pub struct PtySet {
    pub stdout: PtyPair,
    pub stderr: PtyPair,
    pub stdin: PtyPair,
}

/// `Stdio` handles to install as the child's standard streams.
pub struct ChildStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl PtySet {
    pub fn open() -> Result<Self, PtyError> {
        let stdout = PtyPair::open(StreamKind::Stdout)?;
        let stderr = PtyPair::open(StreamKind::Stderr)?;
        let stdin = PtyPair::open(StreamKind::Stdin)?;
        tracing::debug!("allocated stdout, stderr and stdin ptys");
        Ok(Self {
            stdout,
            stderr,
            stdin,
        })
    }

    pub fn child_stdio(&self) -> Result<ChildStdio, PtyError> {
        Ok(ChildStdio {
            stdin: self.stdin.child_stdio(StreamKind::Stdin)?,
            stdout: self.stdout.child_stdio(StreamKind::Stdout)?,
            stderr: self.stderr.child_stdio(StreamKind::Stderr)?,
        })
    }

    /// The masters the supervisor reads from, tagged by stream.
    pub fn output_masters(&self) -> [(StreamKind, &File); 2] {
        [
            (StreamKind::Stdout, &self.stdout.master),
            (StreamKind::Stderr, &self.stderr.master),
        ]
    }
}
