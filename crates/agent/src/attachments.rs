// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interface to the external attachment engine.
//!
//! The engine performs content-addressed file sync between the queue's bucket
//! and a session's working directory. Input sync reports progress (including
//! the observed transfer rate) through a callback that can cancel the
//! transfer; it returns the path-mapping rules the downloaded roots were
//! mapped with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmhand_api::models::{AttachmentSettings, ManifestProperties, PathMapping, PosixUser};
use farmhand_core::{ActionId, StepId, TaskId};
use thiserror::Error;

/// A progress callback invocation during a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// Percent complete in `[0, 100]`.
    pub progress: f32,
    /// Observed transfer rate in bytes per second.
    pub transfer_rate: f64,
    pub message: String,
}

/// Aggregate statistics for one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSummary {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone)]
pub struct InputSyncRequest {
    pub settings: AttachmentSettings,
    pub manifests: Vec<ManifestProperties>,
    pub file_system: Option<String>,
    /// When non-empty, only these steps' dependencies are synced.
    pub step_dependencies: Vec<StepId>,
    pub session_dir: PathBuf,
    /// source path -> destination path, from the job's existing rules.
    pub path_mappings: HashMap<String, String>,
    pub os_user: Option<PosixUser>,
    pub env: HashMap<String, String>,
}

/// Outcome of a successful input sync.
#[derive(Debug, Clone, Default)]
pub struct InputSyncOutcome {
    pub summary: TransferSummary,
    /// Rules for the roots the engine materialized; appended to the
    /// session's rule set.
    pub path_mappings: Vec<PathMapping>,
}

#[derive(Debug, Clone)]
pub struct OutputSyncRequest {
    pub settings: AttachmentSettings,
    pub manifests: Vec<ManifestProperties>,
    pub file_system: Option<String>,
    pub step_id: StepId,
    pub task_id: TaskId,
    pub action_id: ActionId,
    pub started_at: DateTime<Utc>,
    pub session_dir: PathBuf,
    pub path_mappings: HashMap<String, String>,
}

/// Returns `false` to cancel the transfer.
pub type ProgressCallback = Box<dyn FnMut(ProgressReport) -> bool + Send>;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("transfer canceled")]
    Canceled,
    #[error("attachment transfer failed: {0}")]
    Failed(String),
}

/// Content-addressed file synchronization between the bucket and the
/// session working directory.
#[async_trait]
pub trait AttachmentEngine: Send + Sync {
    async fn sync_inputs(
        &self,
        request: InputSyncRequest,
        on_progress: ProgressCallback,
    ) -> Result<InputSyncOutcome, AttachmentError>;

    async fn sync_outputs(
        &self,
        request: OutputSyncRequest,
        on_progress: ProgressCallback,
    ) -> Result<TransferSummary, AttachmentError>;

    /// Remove the engine's materialized data for the session directory.
    async fn cleanup_session(&self, session_dir: &Path) -> Result<(), AttachmentError>;
}
