// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fleet-role credentials for the worker itself.
//!
//! On startup a still-valid cache file is reused to avoid an AssumeFleetRole
//! call on every restart; otherwise fresh credentials are fetched. Refreshes
//! rewrite the cache file.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmhand_api::models::WorkerIdentity;
use farmhand_api::{assume_fleet_role, DispatchService, RequestError};
use farmhand_core::Interrupt;
use tracing::{debug, warn};

use super::files::{read_credentials_file, write_credentials_file};
use super::refresher::RefreshableCredentials;
use super::{CredentialSlot, CredentialsError, TemporaryCredentials};

pub struct WorkerCredentials {
    identity: WorkerIdentity,
    service: Arc<dyn DispatchService>,
    slot: CredentialSlot,
    cache_path: PathBuf,
    interrupt: Interrupt,
}

impl WorkerCredentials {
    pub async fn new(
        service: Arc<dyn DispatchService>,
        identity: WorkerIdentity,
        persistence_dir: &std::path::Path,
        interrupt: Interrupt,
    ) -> Result<Self, CredentialsError> {
        let cache_dir = persistence_dir.join("credentials");
        fs::create_dir_all(&cache_dir)?;
        let cache_path = cache_dir.join(format!("{}.json", identity.worker_id));

        let cached = if cache_path.exists() {
            match read_credentials_file(&cache_path) {
                Ok(credentials) if !credentials.is_expired(Utc::now()) => {
                    debug!(worker_id = %identity.worker_id, "reusing cached worker credentials");
                    Some(credentials)
                }
                Ok(_) => None,
                Err(error) => {
                    warn!(path = %cache_path.display(), %error, "ignoring unreadable credential cache");
                    None
                }
            }
        } else {
            None
        };

        let credentials = match cached {
            Some(credentials) => credentials,
            None => {
                let fresh =
                    assume_fleet_role(&*service, &identity, Some(&interrupt)).await?;
                TemporaryCredentials::from(fresh)
            }
        };

        let this = Self {
            slot: CredentialSlot::new(credentials),
            identity,
            service,
            cache_path,
            interrupt,
        };
        this.persist()?;
        Ok(this)
    }

    fn persist(&self) -> Result<(), CredentialsError> {
        write_credentials_file(&self.cache_path, &self.slot.snapshot(), false)
            .map_err(|error| CredentialsError::Io(std::io::Error::other(error.to_string())))
    }

    pub fn snapshot(&self) -> TemporaryCredentials {
        self.slot.snapshot()
    }

    pub async fn refresh_now(&self) -> Result<(), RequestError> {
        let fresh =
            assume_fleet_role(&*self.service, &self.identity, Some(&self.interrupt)).await?;
        self.slot.store(fresh.into());
        self.persist().map_err(|error| {
            RequestError::Unrecoverable(farmhand_api::ServiceException::Transport {
                message: format!("failed to persist refreshed worker credentials: {error}"),
            })
        })
    }
}

#[async_trait]
impl RefreshableCredentials for WorkerCredentials {
    fn expiry(&self) -> DateTime<Utc> {
        self.slot.expiry()
    }

    async fn refresh(&self) -> Result<(), RequestError> {
        self.refresh_now().await
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
