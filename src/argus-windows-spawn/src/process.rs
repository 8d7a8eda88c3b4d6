//! Create the backend process as the restricted user.
//!
//! `CreateProcessWithLogonW` takes one flat command line plus stdio handles
//! the child inherits. A duplicated handle is inheritable by *every* child
//! spawned from this program while it exists, not only ours, so the
//! duplicate-then-create sequence runs under a process-wide lock and each
//! duplicate is closed the moment creation returns.

use crate::cmdline::build_command_line;
use crate::credentials::Credential;
use crate::{Result, SpawnError};
use std::os::windows::io::RawHandle;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, WAIT_FAILED, WAIT_OBJECT_0,
};
use windows::Win32::System::Threading::{
    CreateProcessWithLogonW, GetCurrentProcess, GetExitCodeProcess, TerminateProcess,
    WaitForSingleObject, CREATE_PROCESS_LOGON_FLAGS, CREATE_UNICODE_ENVIRONMENT, INFINITE,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
};
use zeroize::Zeroize;

/// Serializes every duplicate-then-create sequence in this process; the
/// inheritable window is process-global state.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Child-facing stdio handles, in stdin/stdout/stderr order.
///
/// The caller keeps ownership; the handles only need to stay open until
/// [`spawn_as_user`] returns, since the child receives duplicates.
#[derive(Debug, Clone, Copy)]
pub struct StdioHandles {
    /// Read end the child uses as stdin.
    pub stdin: RawHandle,
    /// Write end the child uses as stdout.
    pub stdout: RawHandle,
    /// Write end the child uses as stderr.
    pub stderr: RawHandle,
}

/// Start `program` as the restricted user with the given stdio handles.
///
/// The child receives the secret user's own profile environment, not the
/// agent's. On success the returned process can be waited on and killed;
/// its thread handle is already closed.
pub fn spawn_as_user(
    credential: &Credential,
    program: &Path,
    args: &[String],
    stdio: StdioHandles,
) -> Result<SpawnedProcess> {
    let program_str = program
        .to_str()
        .ok_or_else(|| SpawnError::Encoding("command path".to_string()))?;
    let command_line = build_command_line(program_str, args);
    debug!(
        "starting '{}' as '{}'",
        command_line, credential.user
    );

    let user_wide = to_wide(&credential.user, "user name")?;
    let domain_wide = to_wide(".", "logon domain")?;
    let program_wide = to_wide(program_str, "command path")?;
    let command_line_wide = to_wide(&command_line, "command line")?;
    let mut password_wide = to_wide(&credential.password, "password")?;

    let spawned = create_as_user(
        &user_wide,
        &domain_wide,
        &password_wide,
        &program_wide,
        command_line_wide,
        stdio,
    );
    // The conversion buffer holds the plaintext password.
    password_wide.zeroize();

    let spawned = spawned?;
    debug!("backend started with pid {}", spawned.pid);
    Ok(spawned)
}

fn create_as_user(
    user: &[u16],
    domain: &[u16],
    password: &[u16],
    program: &[u16],
    mut command_line: Vec<u16>,
    stdio: StdioHandles,
) -> Result<SpawnedProcess> {
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let stdin = InheritableHandle::duplicate_from(stdio.stdin, "stdin")?;
        let stdout = InheritableHandle::duplicate_from(stdio.stdout, "stdout")?;
        let stderr = InheritableHandle::duplicate_from(stdio.stderr, "stderr")?;

        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        startup.dwFlags = STARTF_USESTDHANDLES;
        startup.hStdInput = stdin.0;
        startup.hStdOutput = stdout.0;
        startup.hStdError = stderr.0;

        // Null environment block: the child gets the secret user's profile
        // environment rather than ours.
        unsafe {
            CreateProcessWithLogonW(
                PCWSTR::from_raw(user.as_ptr()),
                PCWSTR::from_raw(domain.as_ptr()),
                PCWSTR::from_raw(password.as_ptr()),
                CREATE_PROCESS_LOGON_FLAGS(0),
                PCWSTR::from_raw(program.as_ptr()),
                PWSTR::from_raw(command_line.as_mut_ptr()),
                CREATE_UNICODE_ENVIRONMENT,
                None,
                PCWSTR::null(),
                &startup,
                &mut info,
            )
        }
        .map_err(|e| SpawnError::ProcessCreation(format!("CreateProcessWithLogonW: {e}")))?;

        // Duplicates close here, ending the inheritable window before the
        // lock is released.
    }

    // Only the process handle is ever used.
    let _ = unsafe { CloseHandle(info.hThread) };

    Ok(SpawnedProcess {
        process: info.hProcess,
        pid: info.dwProcessId,
    })
}

/// NUL-terminated UTF-16 conversion; `what` names the string in errors.
fn to_wide(s: &str, what: &'static str) -> Result<Vec<u16>> {
    if s.contains('\0') {
        return Err(SpawnError::Encoding(what.to_string()));
    }
    Ok(s.encode_utf16().chain(std::iter::once(0)).collect())
}

/// Inheritable duplicate of a stdio handle, closed on drop.
struct InheritableHandle(HANDLE);

impl InheritableHandle {
    fn duplicate_from(raw: RawHandle, which: &'static str) -> Result<Self> {
        let current = unsafe { GetCurrentProcess() };
        let mut duplicated = HANDLE::default();
        unsafe {
            DuplicateHandle(
                current,
                HANDLE(raw),
                current,
                &mut duplicated,
                0,
                true,
                DUPLICATE_SAME_ACCESS,
            )
        }
        .map_err(|e| SpawnError::HandleDuplication(which, format!("DuplicateHandle: {e}")))?;
        Ok(Self(duplicated))
    }
}

impl Drop for InheritableHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            let _ = unsafe { CloseHandle(self.0) };
        }
    }
}

/// Running backend process. The handle is closed on drop.
pub struct SpawnedProcess {
    process: HANDLE,
    pid: u32,
}

impl SpawnedProcess {
    /// Process identifier, for diagnostics.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the process exits and return its exit code.
    pub fn wait(&self) -> std::io::Result<u32> {
        let event = unsafe { WaitForSingleObject(self.process, INFINITE) };
        if event == WAIT_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        if event != WAIT_OBJECT_0 {
            return Err(std::io::Error::other(format!(
                "WaitForSingleObject returned {:?}",
                event
            )));
        }
        let mut code: u32 = 0;
        unsafe { GetExitCodeProcess(self.process, &mut code) }
            .map_err(|e| std::io::Error::other(format!("GetExitCodeProcess: {e}")))?;
        Ok(code)
    }

    /// Force-terminate the process.
    ///
    /// Termination races natural exit; a process that is already gone is
    /// reported as success.
    pub fn kill(&self) -> std::io::Result<()> {
        if let Err(e) = unsafe { TerminateProcess(self.process, 1) } {
            if self.has_exited() {
                return Ok(());
            }
            return Err(std::io::Error::other(format!("TerminateProcess: {e}")));
        }
        Ok(())
    }

    /// A signaled process object means the process already exited.
    fn has_exited(&self) -> bool {
        unsafe { WaitForSingleObject(self.process, 0) } == WAIT_OBJECT_0
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        if !self.process.is_invalid() {
            let _ = unsafe { CloseHandle(self.process) };
        }
    }
}

// Safety: process handles can be used from any thread.
unsafe impl Send for SpawnedProcess {}
unsafe impl Sync for SpawnedProcess {}
