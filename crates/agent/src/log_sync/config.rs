// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session log provisioning.
//!
//! The service dictates where a session's log goes. Only the `awslogs`
//! driver is understood; for sessions anything else is a provisioning error
//! that fails the whole assignment up front, while the worker's own log
//! configuration degrades to local-only logging with a warning.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use farmhand_api::models::LogConfiguration;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use super::stream::{spawn_log_stream, LogStreamHandle};
use super::{RemoteLogClient, SessionLogger};

pub const LOG_DRIVER_AWSLOGS: &str = "awslogs";
const OPTION_GROUP_NAME: &str = "logGroupName";
const OPTION_STREAM_NAME: &str = "logStreamName";

/// The session cannot be started because its log destination cannot be set
/// up. All of the session's actions are failed with this message.
#[derive(Debug, Clone, Error)]
pub enum LogProvisioningError {
    #[error("no log configuration was provided for the session")]
    Missing,
    #[error("unsupported log driver {0:?}; this agent supports only \"awslogs\"")]
    UnsupportedDriver(String),
    #[error("service reported a log configuration error: {0}")]
    Service(String),
    #[error("log configuration is missing the {0:?} option")]
    MissingOption(&'static str),
}

/// A session's validated log destination.
pub struct SessionLogConfig {
    group: String,
    stream: String,
    parameters: Mutex<HashMap<String, String>>,
    local_path: Option<PathBuf>,
}

impl SessionLogConfig {
    /// Validate the assignment's log configuration.
    pub fn from_assignment(
        log: Option<&LogConfiguration>,
        local_path: Option<PathBuf>,
    ) -> Result<Self, LogProvisioningError> {
        let Some(log) = log else {
            return Err(LogProvisioningError::Missing);
        };
        if let Some(error) = &log.error {
            return Err(LogProvisioningError::Service(error.clone()));
        }
        if log.log_driver != LOG_DRIVER_AWSLOGS {
            return Err(LogProvisioningError::UnsupportedDriver(log.log_driver.clone()));
        }
        let group = log
            .options
            .get(OPTION_GROUP_NAME)
            .filter(|value| !value.is_empty())
            .ok_or(LogProvisioningError::MissingOption(OPTION_GROUP_NAME))?;
        let stream = log
            .options
            .get(OPTION_STREAM_NAME)
            .filter(|value| !value.is_empty())
            .ok_or(LogProvisioningError::MissingOption(OPTION_STREAM_NAME))?;
        Ok(Self {
            group: group.clone(),
            stream: stream.clone(),
            parameters: Mutex::new(log.parameters.clone()),
            local_path,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Replace the runtime logging parameters from a fresh assignment.
    pub fn update_parameters(&self, parameters: HashMap<String, String>) {
        *self.parameters.lock() = parameters;
    }

    pub fn parameters(&self) -> HashMap<String, String> {
        self.parameters.lock().clone()
    }

    /// Open the local log file (if configured) and spawn the upload task.
    pub fn attach(
        &self,
        client: Arc<dyn RemoteLogClient>,
    ) -> std::io::Result<(SessionLogger, LogStreamHandle)> {
        let local = match &self.local_path {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        let handle = spawn_log_stream(client, self.group.clone(), self.stream.clone());
        let logger = SessionLogger::new(handle.sender(), local);
        Ok((logger, handle))
    }
}

/// Parse the worker's own log destination from an UpdateWorker response.
/// Unlike sessions, an unusable configuration degrades to local-only
/// logging.
pub fn worker_log_target(log: &LogConfiguration) -> Option<(String, String)> {
    if let Some(error) = &log.error {
        warn!(%error, "service reported an error with the worker log configuration");
    }
    if log.log_driver != LOG_DRIVER_AWSLOGS {
        warn!(
            driver = %log.log_driver,
            "worker log driver is not supported; logging will only be local"
        );
        return None;
    }
    let group = log.options.get(OPTION_GROUP_NAME);
    let stream = log.options.get(OPTION_STREAM_NAME);
    match (group, stream) {
        (Some(group), Some(stream)) if !group.is_empty() && !stream.is_empty() => {
            Some((group.clone(), stream.clone()))
        }
        _ => {
            warn!("worker log configuration options are missing; logging will only be local");
            None
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
