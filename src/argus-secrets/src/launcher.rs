//! Process launch seam.
//!
//! The controller drives any [`ProcessLauncher`]; the production launcher
//! starts the backend under the restricted secret user and only exists on
//! Windows. Tests substitute their own launcher to exercise the controller
//! on every platform.

use argus_windows_spawn::SpawnError;
use os_pipe::{PipeReader, PipeWriter};
use std::fmt;
use std::io;
use std::path::Path;

/// Child-facing ends of the three stdio pipes.
///
/// The launcher reads the raw handles out of this; the controller drops
/// the struct right after launch, which is the "close after start" step
/// that lets the copy tasks see EOF when the child exits.
pub struct ChildStdio {
    /// Read end the child uses as stdin.
    pub stdin: PipeReader,
    /// Write end the child uses as stdout.
    pub stdout: PipeWriter,
    /// Write end the child uses as stderr.
    pub stderr: PipeWriter,
}

/// How a backend process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    code: Option<i32>,
}

impl ExitState {
    /// Exit with the given status code.
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Terminated without a status code (killed by a signal).
    pub fn killed() -> Self {
        Self { code: None }
    }

    /// True only for a clean zero exit.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The status code, if the process exited with one.
    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "killed"),
        }
    }
}

/// A started backend process.
///
/// `wait` and `kill` may be called from different tasks; `kill` must be
/// safe to call at any point, including after the process has exited.
pub trait ChildProcess: Send + Sync {
    /// Block until the process exits and report how it finished.
    fn wait(&self) -> io::Result<ExitState>;

    /// Forcibly terminate the process. A no-op if it already exited.
    fn kill(&self) -> io::Result<()>;

    /// OS process id, for logging.
    fn pid(&self) -> u32;
}

/// Starts a backend executable wired to the given stdio pipes.
///
/// `launch` may block on OS calls (a registry read, the process-wide
/// inheritance lock); the controller calls it from a blocking thread.
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        program: &Path,
        args: &[String],
        stdio: &ChildStdio,
    ) -> Result<Box<dyn ChildProcess>, SpawnError>;
}

#[cfg(windows)]
pub use windows_impl::LogonLauncher;

#[cfg(windows)]
mod windows_impl {
    use super::{ChildProcess, ChildStdio, ExitState, ProcessLauncher};
    use argus_windows_spawn::{fetch_credential, spawn_as_user, SpawnError, StdioHandles};
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::path::Path;

    /// Launches the backend under the restricted secret user via a
    /// registry-provisioned credential.
    pub struct LogonLauncher;

    impl ProcessLauncher for LogonLauncher {
        fn launch(
            &self,
            program: &Path,
            args: &[String],
            stdio: &ChildStdio,
        ) -> Result<Box<dyn ChildProcess>, SpawnError> {
            let credential = fetch_credential()?;
            let handles = StdioHandles {
                stdin: stdio.stdin.as_raw_handle(),
                stdout: stdio.stdout.as_raw_handle(),
                stderr: stdio.stderr.as_raw_handle(),
            };
            let child = spawn_as_user(&credential, program, args, handles)?;
            Ok(Box::new(LogonChild(child)))
        }
    }

    struct LogonChild(argus_windows_spawn::SpawnedProcess);

    impl ChildProcess for LogonChild {
        fn wait(&self) -> io::Result<ExitState> {
            let code = self.0.wait()?;
            Ok(ExitState::from_code(code as i32))
        }

        fn kill(&self) -> io::Result<()> {
            self.0.kill()
        }

        fn pid(&self) -> u32 {
            self.0.pid()
        }
    }
}

/// Launcher for platforms without secret user support; every launch
/// reports that the feature is unavailable.
#[cfg(not(windows))]
pub struct UnavailableLauncher;

#[cfg(not(windows))]
impl ProcessLauncher for UnavailableLauncher {
    fn launch(
        &self,
        _program: &Path,
        _args: &[String],
        _stdio: &ChildStdio,
    ) -> Result<Box<dyn ChildProcess>, SpawnError> {
        Err(SpawnError::NotAvailable)
    }
}

/// The launcher used by [`crate::exec::execute`] on this platform.
#[cfg(windows)]
pub fn default_launcher() -> impl ProcessLauncher {
    LogonLauncher
}

/// The launcher used by [`crate::exec::execute`] on this platform.
#[cfg(not(windows))]
pub fn default_launcher() -> impl ProcessLauncher {
    UnavailableLauncher
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_state_success_only_for_zero() {
        assert!(ExitState::from_code(0).success());
        assert!(!ExitState::from_code(1).success());
        assert!(!ExitState::from_code(-1).success());
        assert!(!ExitState::killed().success());
    }

    #[test]
    fn exit_state_display() {
        assert_eq!(ExitState::from_code(3).to_string(), "exit code 3");
        assert_eq!(ExitState::killed().to_string(), "killed");
    }
}
