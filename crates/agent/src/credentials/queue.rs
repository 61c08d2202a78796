// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-queue role credentials.
//!
//! Fetched with AssumeQueueRole and installed on disk so that session
//! subprocesses can pick them up through the `deadline-<queue_id>` AWS
//! profile and its credential-process script. Refreshes rewrite the cache
//! file in place, so running subprocesses observe new credentials on their
//! next read.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmhand_api::models::{PosixUser, WorkerIdentity};
use farmhand_api::{assume_queue_role, DispatchService, RequestError};
use farmhand_core::{Interrupt, QueueId};
use tracing::{debug, warn};

use super::files::{write_credential_process_script, write_credentials_file, AwsProfiles};
use super::refresher::RefreshableCredentials;
use super::{CredentialSlot, CredentialsError, TemporaryCredentials};

pub struct QueueCredentials {
    queue_id: QueueId,
    identity: WorkerIdentity,
    service: Arc<dyn DispatchService>,
    slot: CredentialSlot,
    profile_name: String,
    credential_dir: PathBuf,
    credentials_path: PathBuf,
    script_path: PathBuf,
    profiles: Option<AwsProfiles>,
    shares_with_session_user: bool,
    interrupt: Interrupt,
}

impl QueueCredentials {
    /// Fetch the initial credentials and install the on-disk plumbing.
    ///
    /// `profile_home` is the home directory whose `.aws` files get the
    /// profile entry; `files::home_for_user` resolves it for a session user.
    pub async fn new(
        service: Arc<dyn DispatchService>,
        identity: WorkerIdentity,
        queue_id: QueueId,
        os_user: Option<&PosixUser>,
        persistence_dir: &std::path::Path,
        profile_home: Option<PathBuf>,
        interrupt: Interrupt,
    ) -> Result<Self, CredentialsError> {
        let credentials =
            assume_queue_role(&*service, &identity, &queue_id, Some(&interrupt)).await?;

        let credential_dir = persistence_dir.join("queues").join(queue_id.as_str());
        let this = Self {
            profile_name: format!("deadline-{queue_id}"),
            credentials_path: credential_dir.join("credentials.json"),
            script_path: credential_dir.join("get_aws_credentials.sh"),
            credential_dir,
            profiles: profile_home.map(AwsProfiles::new),
            shares_with_session_user: os_user.is_some(),
            slot: CredentialSlot::new(credentials.into()),
            queue_id,
            identity,
            service,
            interrupt,
        };
        this.install()?;
        Ok(this)
    }

    fn install(&self) -> Result<(), CredentialsError> {
        fs::create_dir_all(&self.credential_dir)?;
        write_credentials_file(
            &self.credentials_path,
            &self.slot.snapshot(),
            self.shares_with_session_user,
        )
        .map_err(|error| {
            CredentialsError::Io(std::io::Error::other(error.to_string()))
        })?;
        write_credential_process_script(
            &self.script_path,
            &self.credentials_path,
            self.shares_with_session_user,
        )?;
        if let Some(profiles) = &self.profiles {
            profiles.install(&self.profile_name, &self.script_path)?;
        }
        debug!(
            queue_id = %self.queue_id,
            profile = %self.profile_name,
            "installed queue credentials"
        );
        Ok(())
    }

    /// The AWS profile name session subprocesses should use.
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn snapshot(&self) -> TemporaryCredentials {
        self.slot.snapshot()
    }

    /// Fetch fresh credentials and rewrite the cache file.
    pub async fn refresh_now(&self) -> Result<(), RequestError> {
        let credentials = assume_queue_role(
            &*self.service,
            &self.identity,
            &self.queue_id,
            Some(&self.interrupt),
        )
        .await?;
        self.slot.store(credentials.into());
        write_credentials_file(
            &self.credentials_path,
            &self.slot.snapshot(),
            self.shares_with_session_user,
        )
        .map_err(|error| {
            RequestError::Unrecoverable(farmhand_api::ServiceException::Transport {
                message: format!("failed to persist refreshed queue credentials: {error}"),
            })
        })
    }

    /// Remove the on-disk plumbing. Called when the queue is no longer
    /// referenced by any assigned session.
    pub fn cleanup(&self) {
        if let Some(profiles) = &self.profiles {
            if let Err(error) = profiles.remove(&self.profile_name) {
                warn!(queue_id = %self.queue_id, %error, "failed to remove queue credential profile");
            }
        }
        if let Err(error) = fs::remove_dir_all(&self.credential_dir) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(queue_id = %self.queue_id, %error, "failed to remove queue credential directory");
            }
        }
    }
}

#[async_trait]
impl RefreshableCredentials for QueueCredentials {
    fn expiry(&self) -> DateTime<Utc> {
        self.slot.expiry()
    }

    async fn refresh(&self) -> Result<(), RequestError> {
        self.refresh_now().await
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
