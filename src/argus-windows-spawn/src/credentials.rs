//! Registry-backed credential retrieval for the secret execution user.
//!
//! The password for [`SECRET_USER`](crate::SECRET_USER) is provisioned at
//! install time as a string value under a fixed machine-local registry
//! path. It is read fresh on every backend invocation, never cached, and
//! wiped from memory when the credential is dropped.

use crate::{Result, SpawnError, SECRET_USER, SECRET_USER_KEY_PATH};
use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Foundation::ERROR_FILE_NOT_FOUND;
use windows::Win32::System::Registry::{
    RegCloseKey, RegOpenKeyExW, RegQueryValueExW, HKEY, HKEY_LOCAL_MACHINE, KEY_READ,
    REG_EXPAND_SZ, REG_SZ, REG_VALUE_TYPE,
};
use zeroize::Zeroizing;

/// Identity and password for the restricted execution user.
///
/// Exists only for the duration of a single spawn; the password is zeroed
/// when the credential is dropped.
pub struct Credential {
    /// Account name the backend runs as.
    pub user: String,
    /// Account password, wiped on drop.
    pub password: Zeroizing<String>,
}

/// Read the secret user's password from the registry.
///
/// "Not provisioned" ([`SpawnError::CredentialNotFound`]) is reported
/// separately from any other registry failure
/// ([`SpawnError::CredentialRead`]): the former is a setup problem, the
/// latter may be tampering or a transient OS fault.
pub fn fetch_credential() -> Result<Credential> {
    let password = read_password_value(SECRET_USER_KEY_PATH, SECRET_USER)?;
    debug!("loaded password for '{}' from the registry", SECRET_USER);
    Ok(Credential {
        user: SECRET_USER.to_string(),
        password,
    })
}

/// Open `key_path` under HKLM and read the string value named `value_name`.
fn read_password_value(key_path: &str, value_name: &str) -> Result<Zeroizing<String>> {
    let wide_path: Vec<u16> = key_path.encode_utf16().chain(std::iter::once(0)).collect();
    let wide_name: Vec<u16> = value_name
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    let mut raw_key = HKEY::default();
    let status = unsafe {
        RegOpenKeyExW(
            HKEY_LOCAL_MACHINE,
            PCWSTR::from_raw(wide_path.as_ptr()),
            0,
            KEY_READ,
            &mut raw_key,
        )
    };
    if status == ERROR_FILE_NOT_FOUND {
        return Err(SpawnError::CredentialNotFound(value_name.to_string()));
    }
    status
        .ok()
        .map_err(|e| SpawnError::CredentialRead(format!("RegOpenKeyExW: {e}")))?;
    let key = RegKey(raw_key);

    // First call sizes the value, second reads it. The buffer and the
    // decoded string both hold the plaintext password, so both are zeroed.
    let mut value_type = REG_VALUE_TYPE::default();
    let mut data_len: u32 = 0;
    let status = unsafe {
        RegQueryValueExW(
            key.0,
            PCWSTR::from_raw(wide_name.as_ptr()),
            None,
            Some(&mut value_type),
            None,
            Some(&mut data_len),
        )
    };
    if status == ERROR_FILE_NOT_FOUND {
        return Err(SpawnError::CredentialNotFound(value_name.to_string()));
    }
    status
        .ok()
        .map_err(|e| SpawnError::CredentialRead(format!("RegQueryValueExW: {e}")))?;
    // Either string type is fine; an expandable string is used as-is,
    // never expanded.
    if value_type != REG_SZ && value_type != REG_EXPAND_SZ {
        return Err(SpawnError::CredentialRead(format!(
            "unexpected value type {} for '{}'",
            value_type.0, value_name
        )));
    }

    let mut buf: Zeroizing<Vec<u16>> =
        Zeroizing::new(vec![0u16; (data_len as usize).div_ceil(2)]);
    let mut read_len = data_len;
    let status = unsafe {
        RegQueryValueExW(
            key.0,
            PCWSTR::from_raw(wide_name.as_ptr()),
            None,
            Some(&mut value_type),
            Some(buf.as_mut_ptr().cast::<u8>()),
            Some(&mut read_len),
        )
    };
    status
        .ok()
        .map_err(|e| SpawnError::CredentialRead(format!("RegQueryValueExW: {e}")))?;

    let mut units = &buf[..(read_len as usize) / 2];
    if let Some((&0, rest)) = units.split_last() {
        units = rest;
    }
    let password = String::from_utf16(units)
        .map_err(|_| SpawnError::CredentialRead("password value is not valid UTF-16".to_string()))?;
    Ok(Zeroizing::new(password))
}

/// Open registry key, closed on drop.
struct RegKey(HKEY);

impl Drop for RegKey {
    fn drop(&mut self) {
        let _ = unsafe { RegCloseKey(self.0) };
    }
}
