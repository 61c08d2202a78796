// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Role-credential handling.
//!
//! Temporary credentials obtained from the dispatch service are held in a
//! [`CredentialSlot`] (reads always observe one coherent triple from a
//! single refresh), persisted to disk in credential-process format, and kept
//! fresh by the [`refresher`] while in use.

pub mod files;
pub mod queue;
pub mod refresher;
pub mod worker;

use chrono::{DateTime, NaiveDateTime, Utc};
use farmhand_api::models::RoleCredentials;
use farmhand_api::RequestError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use queue::QueueCredentials;
pub use refresher::{CredentialsRefresher, RefreshFailure, RefresherConfig};
pub use worker::WorkerCredentials;

const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),
}

/// One coherent set of temporary role credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiry: DateTime<Utc>,
}

impl TemporaryCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry
    }

    /// The on-disk credential-process shape. Sub-second precision is dropped;
    /// the expiry is always rendered in UTC.
    pub fn to_file_format(&self) -> FileCredentials {
        FileCredentials {
            version: 1,
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
            expiration: self.expiry.format(EXPIRY_FORMAT).to_string(),
        }
    }

    pub fn from_file_format(file: &FileCredentials) -> Result<Self, CredentialsFileError> {
        if file.version != 1 {
            return Err(CredentialsFileError::BadVersion(file.version));
        }
        let required = |name: &'static str, value: &str| {
            if value.is_empty() {
                Err(CredentialsFileError::EmptyField(name))
            } else {
                Ok(value.to_string())
            }
        };
        let expiry = NaiveDateTime::parse_from_str(&file.expiration, EXPIRY_FORMAT)
            .map_err(|_| CredentialsFileError::BadExpiration(file.expiration.clone()))?
            .and_utc();
        Ok(Self {
            access_key_id: required("AccessKeyId", &file.access_key_id)?,
            secret_access_key: required("SecretAccessKey", &file.secret_access_key)?,
            session_token: required("SessionToken", &file.session_token)?,
            expiry,
        })
    }
}

impl From<RoleCredentials> for TemporaryCredentials {
    fn from(credentials: RoleCredentials) -> Self {
        Self {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            session_token: credentials.session_token,
            expiry: credentials.expiration,
        }
    }
}

/// The JSON shape a credential process prints and our cache files store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCredentials {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "SessionToken")]
    pub session_token: String,
    /// ISO-8601 UTC, whole seconds.
    #[serde(rename = "Expiration")]
    pub expiration: String,
}

#[derive(Debug, Error)]
pub enum CredentialsFileError {
    #[error("credential file Version must be 1, got {0}")]
    BadVersion(u32),
    #[error("credential file field {0} is empty")]
    EmptyField(&'static str),
    #[error("credential file Expiration {0:?} is not an ISO-8601 UTC timestamp")]
    BadExpiration(String),
    #[error("credential file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Holder of the live credentials. `snapshot` returns the full triple from
/// one refresh; readers can never observe a torn update.
#[derive(Debug)]
pub struct CredentialSlot {
    inner: Mutex<TemporaryCredentials>,
}

impl CredentialSlot {
    pub fn new(credentials: TemporaryCredentials) -> Self {
        Self { inner: Mutex::new(credentials) }
    }

    pub fn snapshot(&self) -> TemporaryCredentials {
        self.inner.lock().clone()
    }

    pub fn store(&self, credentials: TemporaryCredentials) {
        *self.inner.lock() = credentials;
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.inner.lock().expiry
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
