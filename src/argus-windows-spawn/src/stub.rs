//! Stub implementation for non-Windows platforms.
//!
//! These types exist so callers can reference the spawn surface without
//! conditional compilation at every use site; every operation reports that
//! privilege-dropping execution is unavailable here.

use crate::{Result, SpawnError};
use std::path::Path;

/// Identity and password for the restricted execution user (stub).
pub struct Credential {
    _private: (),
}

/// Read the secret user's password (always fails off Windows).
pub fn fetch_credential() -> Result<Credential> {
    Err(SpawnError::NotAvailable)
}

/// Child-facing stdio handles (stub).
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioHandles;

/// Running backend process (stub).
pub struct SpawnedProcess {
    _private: (),
}

impl SpawnedProcess {
    /// Process identifier (unreachable off Windows).
    pub fn pid(&self) -> u32 {
        0
    }

    /// Block until exit (unreachable off Windows).
    pub fn wait(&self) -> std::io::Result<u32> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }

    /// Force-terminate (unreachable off Windows).
    pub fn kill(&self) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

/// Start the backend as the secret user (always fails off Windows).
pub fn spawn_as_user(
    _credential: &Credential,
    _program: &Path,
    _args: &[String],
    _stdio: StdioHandles,
) -> Result<SpawnedProcess> {
    Err(SpawnError::NotAvailable)
}
