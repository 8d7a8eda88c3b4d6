//! Error taxonomy for backend execution.
//!
//! Everything that can go wrong before the process starts aborts the call
//! immediately; failures after start are collected and classified once the
//! process is gone, with the timeout taking priority over whatever the
//! wait reported.

use crate::launcher::ExitState;
use argus_windows_spawn::SpawnError;
use thiserror::Error;

/// Errors produced while running the secrets backend.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Launching failed before the backend ran (credentials, handle
    /// duplication, process creation).
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// An stdio pipe pair could not be created.
    #[error("unable to create pipes for '{command}': {source}")]
    PipeCreation {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A relay copy failed with a non-benign IO error.
    #[error("error while copying {stream} of '{command}': {source}")]
    Copy {
        command: String,
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The backend ran past its deadline and was killed.
    #[error("error while running '{command}': command timeout")]
    Timeout { command: String },

    /// Waiting on the backend process failed.
    #[error("error while running '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend exited with a failure status.
    #[error("'{command}' exited with failure status ({state})")]
    NonZeroExit { command: String, state: ExitState },
}

/// Result type for backend execution.
pub type Result<T> = std::result::Result<T, ExecError>;
