//! Secrets backend execution for the Argus agent.
//!
//! Resolving a secret means running an operator-configured executable that
//! receives a JSON request on stdin and answers on stdout. The agent runs
//! with broad privileges, so the backend is started as a dedicated
//! low-privilege user, with a hard timeout and a cap on captured output;
//! this crate owns the pipes, the process lifecycle, and the result
//! classification. The payload itself is never interpreted here.
//!
//! [`execute`] is the entry point. The per-platform spawn primitives live
//! in `argus-windows-spawn` behind the [`ProcessLauncher`] seam, which is
//! also how tests drive the controller with an ordinary subprocess.

pub mod error;
pub mod exec;
pub mod launcher;
pub mod output;
mod relay;

pub use error::{ExecError, Result};
pub use exec::{check_command_rights, execute, execute_with_launcher, BackendCommand};
pub use launcher::{default_launcher, ChildProcess, ChildStdio, ExitState, ProcessLauncher};
pub use output::BoundedBuffer;

use std::time::Duration;

/// Default wall-clock budget for one backend invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on bytes captured from each of stdout and stderr.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
