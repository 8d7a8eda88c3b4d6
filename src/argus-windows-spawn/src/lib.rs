//! Privilege-dropping process creation for the Argus secrets backend.
//!
//! The agent usually runs elevated, so the operator-configured secrets
//! backend is never executed with the agent's own identity. This crate
//! starts it as a dedicated low-privilege account instead, using:
//! - `CreateProcessWithLogonW` for the identity switch
//! - a machine-local registry value for the account's password
//! - inheritable stdio handle duplicates, created under a process-wide lock
//!
//! Command-line escaping lives in [`cmdline`] and is portable; everything
//! else is Windows-only, with a [`stub`] surface elsewhere.

pub mod cmdline;

#[cfg(windows)]
pub mod credentials;
#[cfg(windows)]
pub mod process;

#[cfg(not(windows))]
pub mod stub;

#[cfg(windows)]
pub use credentials::{fetch_credential, Credential};
#[cfg(windows)]
pub use process::{spawn_as_user, SpawnedProcess, StdioHandles};

#[cfg(not(windows))]
pub use stub::*;

use thiserror::Error;

/// Account the secrets backend runs under. Provisioned at install time,
/// never created by this crate.
pub const SECRET_USER: &str = "argus_secretuser";

/// Registry path under `HKEY_LOCAL_MACHINE` holding the secret user's
/// password, keyed by [`SECRET_USER`].
pub const SECRET_USER_KEY_PATH: &str = r"SOFTWARE\Argus\Argus Agent\secrets";

/// Errors that can occur while launching the secrets backend.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// Running the backend as the secret user is not supported here.
    #[error("secret user execution not available on this platform")]
    NotAvailable,

    /// No password is provisioned for the execution user.
    #[error("password for '{0}' not found in the registry")]
    CredentialNotFound(String),

    /// The password entry exists but could not be read.
    #[error("failed to read the secret user password: {0}")]
    CredentialRead(String),

    /// A string could not be re-encoded for the platform APIs.
    #[error("failed to encode {0} as UTF-16")]
    Encoding(String),

    /// A stdio handle could not be duplicated for inheritance.
    #[error("failed to duplicate {0} handle: {1}")]
    HandleDuplication(&'static str, String),

    /// The OS rejected the create-process request.
    #[error("failed to create process as the secret user: {0}")]
    ProcessCreation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for spawn operations.
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Check whether privilege-dropping execution is available on this platform.
pub fn is_available() -> bool {
    cfg!(windows)
}
