// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent configuration.
//!
//! Only the handful of settings the execution core needs; full configuration
//! surfaces (files, CLI) belong to the distribution that embeds this crate.

use std::path::PathBuf;

use farmhand_core::{FarmId, FleetId};
use thiserror::Error;

use crate::scheduler::SchedulerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("could not determine a state directory; set FARMHAND_PERSISTENCE_DIR")]
    NoStateDir,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub farm_id: FarmId,
    pub fleet_id: FleetId,
    /// Root for persisted worker state (identity file, credential caches,
    /// per-queue credential directories).
    pub persistence_dir: PathBuf,
    /// Base directory for local session log files; `None` disables them.
    pub worker_logs_dir: Option<PathBuf>,
    /// Base directory for session working directories.
    pub sessions_dir: PathBuf,
}

impl AgentConfig {
    /// Assemble the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &'static str| {
            std::env::var(name).ok().filter(|value| !value.is_empty())
        };
        let farm_id = var("FARMHAND_FARM_ID").ok_or(ConfigError::MissingVar("FARMHAND_FARM_ID"))?;
        let fleet_id =
            var("FARMHAND_FLEET_ID").ok_or(ConfigError::MissingVar("FARMHAND_FLEET_ID"))?;
        let persistence_dir = match var("FARMHAND_PERSISTENCE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .ok_or(ConfigError::NoStateDir)?
                .join("farmhand"),
        };
        Ok(Self {
            farm_id: FarmId::new(farm_id),
            fleet_id: FleetId::new(fleet_id),
            worker_logs_dir: Some(persistence_dir.join("logs")),
            sessions_dir: persistence_dir.join("sessions"),
            persistence_dir,
        })
    }

    pub fn worker_state_file(&self) -> PathBuf {
        self.persistence_dir.join("worker.json")
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            persistence_dir: self.persistence_dir.clone(),
            worker_logs_dir: self.worker_logs_dir.clone(),
            sessions_dir: self.sessions_dir.clone(),
        }
    }
}
