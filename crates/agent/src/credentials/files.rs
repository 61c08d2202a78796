// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk credential plumbing.
//!
//! Each role gets a JSON cache file in credential-process format, a small
//! shell script that prints it, and an AWS-style profile entry pointing at
//! the script in the target user's `~/.aws/config` and `~/.aws/credentials`.
//! Cache files are `0600` (`0640` when a different session OS user must read
//! them); scripts are `0700`/`0750`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use farmhand_api::models::PosixUser;
use tracing::warn;

use super::{CredentialsFileError, FileCredentials, TemporaryCredentials};

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Write the credential cache file for a role.
pub fn write_credentials_file(
    path: &Path,
    credentials: &TemporaryCredentials,
    group_readable: bool,
) -> Result<(), CredentialsFileError> {
    let body = serde_json::to_string_pretty(&credentials.to_file_format())?;
    fs::write(path, body)?;
    set_mode(path, if group_readable { 0o640 } else { 0o600 })?;
    Ok(())
}

pub fn read_credentials_file(path: &Path) -> Result<TemporaryCredentials, CredentialsFileError> {
    let body = fs::read_to_string(path)?;
    let file: FileCredentials = serde_json::from_str(&body)?;
    TemporaryCredentials::from_file_format(&file)
}

/// The shell wrapper installed as the profile's credential process.
pub fn credential_process_script(credentials_path: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         # Prints the cached role credentials in credential-process format.\n\
         cat '{}'\n",
        credentials_path.display()
    )
}

pub fn write_credential_process_script(
    script_path: &Path,
    credentials_path: &Path,
    group_executable: bool,
) -> io::Result<()> {
    fs::write(script_path, credential_process_script(credentials_path))?;
    set_mode(script_path, if group_executable { 0o750 } else { 0o700 })
}

/// Home directory whose AWS profile files should carry the profile entry.
pub fn home_for_user(os_user: Option<&PosixUser>) -> Option<PathBuf> {
    match os_user {
        // Session subprocesses run as this user; their SDKs read the profile
        // from that user's home.
        Some(user) => Some(PathBuf::from("/home").join(&user.user)),
        None => dirs::home_dir(),
    }
}

/// Manages profile entries in one home directory's `.aws/config` and
/// `.aws/credentials`.
pub struct AwsProfiles {
    home: PathBuf,
}

impl AwsProfiles {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    fn config_path(&self) -> PathBuf {
        self.home.join(".aws").join("config")
    }

    fn credentials_path(&self) -> PathBuf {
        self.home.join(".aws").join("credentials")
    }

    /// Add (or replace) the profile entry in both files.
    pub fn install(&self, profile_name: &str, script_path: &Path) -> io::Result<()> {
        fs::create_dir_all(self.home.join(".aws"))?;
        let body = format!("credential_process = {}", script_path.display());
        upsert_section(&self.config_path(), &format!("[profile {profile_name}]"), &body)?;
        upsert_section(&self.credentials_path(), &format!("[{profile_name}]"), &body)?;
        Ok(())
    }

    pub fn remove(&self, profile_name: &str) -> io::Result<()> {
        remove_section(&self.config_path(), &format!("[profile {profile_name}]"))?;
        remove_section(&self.credentials_path(), &format!("[{profile_name}]"))?;
        Ok(())
    }
}

fn upsert_section(path: &Path, header: &str, body: &str) -> io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
        Err(error) => return Err(error),
    };
    let mut content = strip_section(&existing, header);
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(header);
    content.push('\n');
    content.push_str(body);
    content.push('\n');
    fs::write(path, content)?;
    set_mode(path, 0o600)
}

fn remove_section(path: &Path, header: &str) -> io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => {
            warn!(path = %path.display(), %error, "could not read profile file for cleanup");
            return Err(error);
        }
    };
    fs::write(path, strip_section(&existing, header))
}

/// Remove a `[section]` and its keys, leaving every other section intact.
fn strip_section(content: &str, header: &str) -> String {
    let mut out = String::new();
    let mut skipping = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            skipping = trimmed == header;
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
#[path = "files_tests.rs"]
mod tests;
