/// Signal handling for operator interrupts.
///
/// SIGINT (Ctrl-C) and SIGTERM set a process-wide flag. The supervisor loop
/// and the repeat wait both check it at every wake-up; `poll` returning
/// `EINTR` wakes the loop immediately. No further runs are scheduled once
/// the flag is set.
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static PROCESS_INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: nix::libc::c_int) {
    PROCESS_INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Errors from installing signal handlers.
#[derive(Debug)]
pub enum SignalError {
    Install { signal: Signal, source: nix::Error },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Install { signal, source } => {
                write!(f, "failed to install {signal} handler: {source}")
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Install { source, .. } => Some(source),
        }
    }
}

/// Handle to an interrupt flag.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownFlag {
    flag: &'static AtomicBool,
}

impl ShutdownFlag {
    /// Install SIGINT/SIGTERM handlers that set the process-wide flag.
    ///
    /// No `SA_RESTART`: a blocked `poll` must return `EINTR`.
    pub fn install() -> Result<Self, SignalError> {
        let action = SigAction::new(
            SigHandler::Handler(on_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only stores to an atomic, which is
            // async-signal-safe.
            unsafe { sigaction(signal, &action) }
                .map_err(|source| SignalError::Install { signal, source })?;
        }
        tracing::debug!("installed SIGINT/SIGTERM handlers");
        Ok(Self {
            flag: &PROCESS_INTERRUPTED,
        })
    }

    /// A flag not connected to any signal; set only through `request`.
    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_flag_starts_clear() {
        let flag = ShutdownFlag::detached();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_request_is_visible_through_copies() {
        let flag = ShutdownFlag::detached();
        let copy = flag;
        flag.request();
        assert!(copy.is_set());
    }

    #[test]
    fn test_detached_flags_are_independent() {
        let a = ShutdownFlag::detached();
        let b = ShutdownFlag::detached();
        a.request();
        assert!(!b.is_set());
    }

    #[test]
    fn test_install_error_display() {
        let err = SignalError::Install {
            signal: Signal::SIGINT,
            source: nix::errno::Errno::EINVAL,
        };
        assert!(err.to_string().contains("failed to install SIGINT handler"));
    }
}
