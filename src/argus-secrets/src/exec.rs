//! Runs the secrets backend executable and captures its output.
//!
//! One invocation is one process: the payload goes in on stdin, stdout
//! comes back bounded, stderr is kept for diagnostics, and a watchdog
//! kills the backend if it outlives its deadline.

use crate::error::{ExecError, Result};
use crate::launcher::{default_launcher, ChildProcess, ChildStdio, ExitState, ProcessLauncher};
use crate::output::BoundedBuffer;
use crate::relay;
use crate::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT};
use argus_windows_spawn::SpawnError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for one secrets backend executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCommand {
    /// Path to the backend executable.
    pub command: PathBuf,
    /// Arguments passed to the backend on every invocation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Deadline for one invocation, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Cap on captured bytes for each of stdout and stderr.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

impl BackendCommand {
    /// A command with default deadline and output cap and no arguments.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn display_name(&self) -> String {
        self.command.display().to_string()
    }
}

/// Check that the configured backend executable is protected from the
/// account it will run as.
///
/// Called once when a backend command is configured, not per invocation.
pub fn check_command_rights(command: &Path) -> Result<()> {
    warn!(
        "executable rights check for '{}' is not implemented on this platform",
        command.display()
    );
    Ok(())
}

/// Run the backend with the platform launcher and return its stdout.
pub async fn execute(command: &BackendCommand, payload: &str) -> Result<Vec<u8>> {
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(default_launcher());
    execute_with_launcher(launcher, command, payload).await
}

/// Run the backend through a specific [`ProcessLauncher`].
///
/// Feeds `payload` to the backend's stdin, enforces the deadline, and
/// returns captured stdout on a clean zero exit. stderr is captured only
/// for diagnostics and never part of the result.
pub async fn execute_with_launcher(
    launcher: Arc<dyn ProcessLauncher>,
    command: &BackendCommand,
    payload: &str,
) -> Result<Vec<u8>> {
    let command_name = command.display_name();

    let stdout = BoundedBuffer::new(command.max_output_bytes);
    let stderr = BoundedBuffer::new(command.max_output_bytes);

    let (stdin_child, stdin_task) = relay::input_relay(payload.as_bytes().to_vec())
        .map_err(|e| pipe_creation(&command_name, e))?;
    let (stdout_child, stdout_task) = relay::output_relay("stdout", stdout.clone())
        .map_err(|e| pipe_creation(&command_name, e))?;
    let (stderr_child, stderr_task) = relay::output_relay("stderr", stderr.clone())
        .map_err(|e| pipe_creation(&command_name, e))?;
    debug!("created stdio pipes for '{}'", command_name);

    let child_ends = ChildStdio {
        stdin: stdin_child,
        stdout: stdout_child,
        stderr: stderr_child,
    };

    // The launch blocks on a registry read and on the process-wide
    // inheritance lock, so it runs off the async workers. The child-facing
    // pipe ends travel with it and close as soon as it resolves: on
    // success the child owns duplicates and the copies can only see EOF
    // once these are gone; on failure the unbegun copy tasks out here
    // drop as well, closing the other side of every pipe.
    let program = command.command.clone();
    let args = command.args.clone();
    let launched = tokio::task::spawn_blocking(move || {
        let child = launcher.launch(&program, &args, &child_ends);
        drop(child_ends);
        child
    })
    .await;
    let child = match launched {
        Ok(result) => result?,
        Err(e) => {
            return Err(ExecError::Spawn(SpawnError::Io(io::Error::other(format!(
                "launch task failed: {e}"
            )))));
        }
    };
    debug!("backend '{}' started with pid {}", command_name, child.pid());

    let copies = [stdin_task.begin(), stdout_task.begin(), stderr_task.begin()];

    let child: Arc<dyn ChildProcess> = Arc::from(child);
    let finished = CancellationToken::new();
    let watcher = spawn_timeout_watcher(
        Arc::clone(&child),
        command_name.clone(),
        command.timeout(),
        finished.clone(),
    );

    let wait_child = Arc::clone(&child);
    let join_result = tokio::task::spawn_blocking(move || wait_child.wait()).await;

    // Stand the watchdog down and learn whether it fired. Exactly one of
    // the two outcomes happens, even when the deadline and the exit race.
    finished.cancel();
    let timed_out = watcher.await.unwrap_or(false);

    // The child is gone and its pipe ends are closed, so each copy
    // finishes on its own.
    let mut copy_outcomes = Vec::with_capacity(copies.len());
    for copy in copies {
        copy_outcomes.push((copy.stream, flatten_join("relay", copy.handle.await)));
    }

    let outcome = RunOutcome {
        timed_out,
        wait: flatten_join("wait", join_result),
        copy_error: retain_first_copy_error(&command_name, copy_outcomes),
    };
    classify_run(command_name, outcome, &stdout, &stderr)
}

fn pipe_creation(command: &str, source: io::Error) -> ExecError {
    ExecError::PipeCreation {
        command: command.to_string(),
        source,
    }
}

/// A panicked or aborted worker surfaces as an IO error on the affected
/// operation instead of tearing down the whole call.
fn flatten_join<T>(
    what: &str,
    join: std::result::Result<io::Result<T>, JoinError>,
) -> io::Result<T> {
    match join {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(format!("{what} task failed: {e}"))),
    }
}

/// Keep the first non-benign relay failure; later ones carry no extra
/// signal and are only logged.
fn retain_first_copy_error(
    command_name: &str,
    outcomes: Vec<(&'static str, io::Result<()>)>,
) -> Option<(&'static str, io::Error)> {
    let mut retained: Option<(&'static str, io::Error)> = None;
    for (stream, result) in outcomes {
        if let Err(e) = result {
            if retained.is_none() {
                retained = Some((stream, e));
            } else {
                warn!(
                    "additional {} copy error for '{}': {}",
                    stream, command_name, e
                );
            }
        }
    }
    retained
}

/// Facts about a finished run, ready for classification.
struct RunOutcome {
    timed_out: bool,
    wait: io::Result<ExitState>,
    copy_error: Option<(&'static str, io::Error)>,
}

/// Classify a finished run. The deadline having fired explains every
/// other outcome; a wait failure means the exit status is unknown; a
/// failure status is the backend rejecting the request; a copy error on
/// an otherwise clean run still fails it, since capture is incomplete.
fn classify_run(
    command_name: String,
    outcome: RunOutcome,
    stdout: &BoundedBuffer,
    stderr: &BoundedBuffer,
) -> Result<Vec<u8>> {
    if outcome.timed_out {
        return Err(ExecError::Timeout {
            command: command_name,
        });
    }

    let state = match outcome.wait {
        Ok(state) => state,
        Err(e) => {
            return Err(ExecError::Wait {
                command: command_name,
                source: e,
            });
        }
    };

    if !state.success() {
        let diagnostics = stderr.contents();
        if !diagnostics.is_empty() {
            debug!(
                "backend '{}' stderr: {}",
                command_name,
                String::from_utf8_lossy(&diagnostics)
            );
        }
        return Err(ExecError::NonZeroExit {
            command: command_name,
            state,
        });
    }

    if let Some((stream, source)) = outcome.copy_error {
        return Err(ExecError::Copy {
            command: command_name,
            stream,
            source,
        });
    }

    if stdout.truncated() {
        warn!(
            "backend '{}' wrote {} bytes on stdout; kept the first {}",
            command_name,
            stdout.total_written(),
            stdout.len()
        );
    }
    Ok(stdout.contents())
}

/// Kills the backend when the deadline passes, unless `finished` is
/// cancelled first. Resolves to whether the kill path fired.
fn spawn_timeout_watcher(
    child: Arc<dyn ChildProcess>,
    command_name: String,
    timeout: Duration,
    finished: CancellationToken,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        tokio::select! {
            _ = finished.cancelled() => false,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    "backend '{}' still running after {}s, killing pid {}",
                    command_name,
                    timeout.as_secs(),
                    child.pid()
                );
                if let Err(e) = child.kill() {
                    warn!("failed to kill backend pid {}: {}", child.pid(), e);
                }
                true
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn backend_command_serde_fills_in_defaults() {
        let parsed: BackendCommand =
            serde_json::from_str(r#"{"command": "/opt/argus/backend"}"#).unwrap();
        assert_eq!(parsed.command, PathBuf::from("/opt/argus/backend"));
        assert!(parsed.args.is_empty());
        assert_eq!(parsed.timeout_secs, 5);
        assert_eq!(parsed.max_output_bytes, 1024 * 1024);
    }

    #[test]
    fn backend_command_new_uses_defaults() {
        let command = BackendCommand::new("/usr/bin/true");
        assert_eq!(command.timeout_secs, DEFAULT_TIMEOUT.as_secs());
        assert_eq!(command.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(command.args.is_empty());
    }

    #[test]
    fn rights_check_passes_for_now() {
        assert!(check_command_rights(Path::new("/opt/argus/backend")).is_ok());
    }

    fn filled(bytes: &[u8]) -> BoundedBuffer {
        let mut buffer = BoundedBuffer::new(1024);
        buffer.write_all(bytes).unwrap();
        buffer
    }

    fn empty() -> BoundedBuffer {
        BoundedBuffer::new(1024)
    }

    #[test]
    fn first_copy_error_is_retained() {
        let outcomes: Vec<(&'static str, io::Result<()>)> = vec![
            ("stdin", Ok(())),
            ("stdout", Err(io::Error::from(io::ErrorKind::UnexpectedEof))),
            ("stderr", Err(io::Error::from(io::ErrorKind::PermissionDenied))),
        ];
        let (stream, error) = retain_first_copy_error("backend", outcomes).unwrap();
        assert_eq!(stream, "stdout");
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn clean_copies_retain_nothing() {
        let outcomes: Vec<(&'static str, io::Result<()>)> =
            vec![("stdin", Ok(())), ("stdout", Ok(())), ("stderr", Ok(()))];
        assert!(retain_first_copy_error("backend", outcomes).is_none());
    }

    #[test]
    fn copy_error_fails_an_otherwise_clean_run() {
        let outcome = RunOutcome {
            timed_out: false,
            wait: Ok(ExitState::from_code(0)),
            copy_error: Some(("stdout", io::Error::from(io::ErrorKind::UnexpectedEof))),
        };
        let err = classify_run("backend".to_string(), outcome, &filled(b"partial"), &empty())
            .unwrap_err();
        match &err {
            ExecError::Copy { stream, .. } => assert_eq!(*stream, "stdout"),
            other => panic!("expected Copy, got: {other}"),
        }
        assert!(err.to_string().contains("copying stdout"), "got: {err}");
    }

    #[test]
    fn exit_status_outranks_a_copy_error() {
        let outcome = RunOutcome {
            timed_out: false,
            wait: Ok(ExitState::from_code(7)),
            copy_error: Some(("stderr", io::Error::from(io::ErrorKind::UnexpectedEof))),
        };
        let err = classify_run("backend".to_string(), outcome, &empty(), &empty()).unwrap_err();
        match err {
            ExecError::NonZeroExit { state, .. } => assert_eq!(state.code(), Some(7)),
            other => panic!("expected NonZeroExit, got: {other}"),
        }
    }

    #[test]
    fn wait_failure_outranks_a_copy_error() {
        let outcome = RunOutcome {
            timed_out: false,
            wait: Err(io::Error::other("wait task failed")),
            copy_error: Some(("stdin", io::Error::from(io::ErrorKind::UnexpectedEof))),
        };
        let err = classify_run("backend".to_string(), outcome, &empty(), &empty()).unwrap_err();
        assert!(matches!(err, ExecError::Wait { .. }), "got: {err}");
    }

    #[test]
    fn deadline_outranks_everything_else() {
        let outcome = RunOutcome {
            timed_out: true,
            wait: Ok(ExitState::from_code(1)),
            copy_error: Some(("stdout", io::Error::from(io::ErrorKind::UnexpectedEof))),
        };
        let err = classify_run("backend".to_string(), outcome, &empty(), &empty()).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }), "got: {err}");
    }

    #[test]
    fn clean_run_returns_captured_stdout() {
        let outcome = RunOutcome {
            timed_out: false,
            wait: Ok(ExitState::from_code(0)),
            copy_error: None,
        };
        let output = classify_run(
            "backend".to_string(),
            outcome,
            &filled(b"resolved secret"),
            &empty(),
        )
        .unwrap();
        assert_eq!(output, b"resolved secret");
    }

    #[tokio::test]
    async fn panicked_worker_flattens_to_an_io_error() {
        let join =
            tokio::task::spawn_blocking(|| -> io::Result<()> { panic!("copy blew up") }).await;
        let err = flatten_join("relay", join).unwrap_err();
        assert!(err.to_string().contains("relay task failed"), "got: {err}");
    }
}
