use std::fmt;

/// Advisory wall-clock signal raised by the execution backend once a command
/// has returned and the soft deadline has passed. It never interrupts an
/// in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("soft deadline exceeded")]
pub struct SoftDeadlineExceeded;

/// A substrate command that exited non-zero, with its captured output.
#[derive(Debug, thiserror::Error)]
#[error("command `{command}` exited with status {status}")]
pub struct CommandError {
    pub command: String,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Marks an error as already reported. The booted-context boundary checks for
/// this type to decide whether a failure still needs logging before the run
/// terminates.
#[derive(Debug)]
pub struct LoggedError(pub anyhow::Error);

impl LoggedError {
    /// Wrap `err` unless it is already a `LoggedError`.
    pub fn wrap(err: anyhow::Error) -> anyhow::Error {
        if err.is::<LoggedError>() {
            err
        } else {
            anyhow::Error::new(LoggedError(err))
        }
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl fmt::Display for LoggedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "already logged: {}", self.0)
    }
}

impl std::error::Error for LoggedError {}

/// Raised after a logged failure once diagnostics are on disk; the process
/// should exit non-zero without reporting the failure a second time.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("terminating after logged failure")]
pub struct Terminated;

/// True when `err` is caused by the soft-deadline signal, looking through
/// `LoggedError` wrappers.
pub fn is_soft_deadline(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if cause.is::<SoftDeadlineExceeded>() {
            return true;
        }
        if let Some(logged) = cause.downcast_ref::<LoggedError>() {
            if is_soft_deadline(&logged.0) {
                return true;
            }
        }
    }
    false
}

/// The first command failure in the chain of `err`, if any.
pub fn command_failure(err: &anyhow::Error) -> Option<&CommandError> {
    for cause in err.chain() {
        if let Some(command) = cause.downcast_ref::<CommandError>() {
            return Some(command);
        }
        if let Some(logged) = cause.downcast_ref::<LoggedError>() {
            if let Some(command) = command_failure(&logged.0) {
                return Some(command);
            }
        }
    }
    None
}
