// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker identity bootstrap.
//!
//! The worker id is assigned once by CreateWorker and persisted so restarts
//! reuse it. When the service later reports the identity unknown, the outer
//! worker discards the file and bootstraps again.

use std::fs;
use std::path::Path;

use farmhand_api::models::{Capabilities, HostProperties, WorkerIdentity, WorkerStatus};
use farmhand_api::{create_worker, update_worker, DispatchService, RequestError};
use farmhand_core::WorkerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::log_sync::worker_log_target;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to read or write the worker state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker state file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Contents of the persisted worker state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPersistenceInfo {
    pub worker_id: WorkerId,
}

impl WorkerPersistenceInfo {
    /// Read the state file if present. Keys this agent version does not know
    /// are ignored with a warning so the file can round-trip through other
    /// agent versions.
    pub fn load(path: &Path) -> Result<Option<Self>, BootstrapError> {
        if !path.is_file() {
            return Ok(None);
        }
        let body = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        let Some(object) = value.as_object() else {
            warn!(path = %path.display(), "worker state file is not a JSON object; ignoring it");
            return Ok(None);
        };
        let unknown: Vec<&str> =
            object.keys().filter(|key| *key != "worker_id").map(String::as_str).collect();
        if !unknown.is_empty() {
            warn!(
                path = %path.display(),
                keys = ?unknown,
                "ignoring unknown keys in worker state file"
            );
        }
        match object.get("worker_id").and_then(serde_json::Value::as_str) {
            Some(worker_id) => Ok(Some(Self { worker_id: WorkerId::new(worker_id) })),
            None => {
                warn!(path = %path.display(), "worker state file has no worker_id; ignoring it");
                Ok(None)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BootstrapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        set_owner_only(path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Reuse the persisted worker identity, or register a fresh one.
pub async fn bootstrap_worker(
    service: &dyn DispatchService,
    config: &AgentConfig,
    host_properties: &HostProperties,
) -> Result<WorkerIdentity, BootstrapError> {
    let state_file = config.worker_state_file();
    if let Some(persisted) = WorkerPersistenceInfo::load(&state_file)? {
        info!(worker_id = %persisted.worker_id, "reusing persisted worker identity");
        return Ok(WorkerIdentity {
            farm_id: config.farm_id.clone(),
            fleet_id: config.fleet_id.clone(),
            worker_id: persisted.worker_id,
        });
    }

    let worker_id =
        create_worker(service, &config.farm_id, &config.fleet_id, host_properties).await?;
    WorkerPersistenceInfo { worker_id: worker_id.clone() }.save(&state_file)?;
    info!(%worker_id, "registered new worker");
    Ok(WorkerIdentity {
        farm_id: config.farm_id.clone(),
        fleet_id: config.fleet_id.clone(),
        worker_id,
    })
}

/// Transition the worker to STARTED at the service and return its own log
/// destination, when the service provides a usable one.
pub async fn start_worker(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
    capabilities: Option<&Capabilities>,
) -> Result<Option<(String, String)>, RequestError> {
    let response =
        update_worker(service, identity, WorkerStatus::Started, capabilities, None).await?;
    info!(worker_id = %identity.worker_id, "worker status set to STARTED");
    Ok(response.log.as_ref().and_then(worker_log_target))
}

/// Forget a persisted identity the service reported unknown; the next
/// bootstrap registers a fresh worker.
pub fn discard_worker_identity(config: &AgentConfig) -> std::io::Result<()> {
    let state_file = config.worker_state_file();
    match fs::remove_file(&state_file) {
        Ok(()) => {
            info!(path = %state_file.display(), "discarded persisted worker identity");
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod tests;
