// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request and response shapes for the dispatch service.
//!
//! Field names follow the service's camelCase wire format; the structs here
//! are the only place that mapping lives.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use farmhand_core::{ActionId, EnvironmentId, FarmId, FleetId, JobId, QueueId, SessionId, StepId, TaskId, WorkerId};
use serde::{Deserialize, Serialize};

/// Service-side limit on the length of a progress message in an
/// UpdateWorkerSchedule request.
pub const UPDATE_SCHEDULE_MAX_MESSAGE_CHARS: usize = 4096;

/// The identity this worker registered with the service.
///
/// Created once at bootstrap, persisted locally, and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub farm_id: FarmId,
    pub fleet_id: FleetId,
    pub worker_id: WorkerId,
}

/// Worker status as reported to (and tracked by) the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Online and ready to take work.
    Started,
    /// A drain is in progress; the service must not assign new work.
    Stopping,
    /// Offline.
    Stopped,
}

/// The only desired status the service ever pushes to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredWorkerStatus {
    Stopped,
}

/// Terminal status of a session action, as reported in the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletedStatus {
    Succeeded,
    Failed,
    Interrupted,
    Canceled,
    NeverAttempted,
}

/// A task parameter value, tagged by type on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskParameter {
    String(String),
    Path(String),
    Int(String),
    Float(String),
}

/// One action in a session's assigned action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum SessionActionSpec {
    EnvEnter {
        session_action_id: ActionId,
        environment_id: EnvironmentId,
    },
    EnvExit {
        session_action_id: ActionId,
        environment_id: EnvironmentId,
    },
    TaskRun {
        session_action_id: ActionId,
        step_id: StepId,
        task_id: TaskId,
        #[serde(default)]
        parameters: HashMap<String, TaskParameter>,
    },
    SyncInputJobAttachments {
        session_action_id: ActionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
    },
}

impl SessionActionSpec {
    pub fn action_id(&self) -> &ActionId {
        match self {
            Self::EnvEnter { session_action_id, .. }
            | Self::EnvExit { session_action_id, .. }
            | Self::TaskRun { session_action_id, .. }
            | Self::SyncInputJobAttachments { session_action_id, .. } => session_action_id,
        }
    }

    /// Env-exit actions survive cancel-all so entered environments always get
    /// a chance to unwind.
    pub fn is_env_exit(&self) -> bool {
        matches!(self, Self::EnvExit { .. })
    }
}

/// The session log destination dictated by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogConfiguration {
    pub log_driver: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One session assignment from the heartbeat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedSession {
    pub queue_id: QueueId,
    pub job_id: JobId,
    pub session_actions: Vec<SessionActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_configuration: Option<LogConfiguration>,
}

/// Response body of the UpdateWorkerSchedule heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleResponse {
    #[serde(default)]
    pub assigned_sessions: HashMap<SessionId, AssignedSession>,
    #[serde(default)]
    pub cancel_session_actions: HashMap<SessionId, Vec<ActionId>>,
    pub update_interval_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_worker_status: Option<DesiredWorkerStatus>,
}

/// One per-action update carried in the heartbeat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedActionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_status: Option<CompletedStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f32>,
}

/// A path mapping rule as the service transmits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMapping {
    pub source_path_format: String,
    pub source_path: String,
    pub destination_path: String,
}

impl PathMapping {
    /// Number of components in the source path. Rule lists are kept sorted by
    /// descending component count so the longest prefix wins lookups.
    pub fn source_component_count(&self) -> usize {
        std::path::Path::new(&self.source_path).components().count()
    }
}

/// Job-attachment bucket settings declared on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSettings {
    pub s3_bucket_name: String,
    pub root_prefix: String,
}

impl AttachmentSettings {
    pub fn is_empty(&self) -> bool {
        self.s3_bucket_name.is_empty() && self.root_prefix.is_empty()
    }
}

/// One content-addressed manifest attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestProperties {
    pub root_path: String,
    pub root_path_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system_location_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_manifest_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_manifest_hash: Option<String>,
    #[serde(default)]
    pub output_relative_directories: Vec<String>,
}

/// The full attachment manifest set for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentManifests {
    #[serde(default)]
    pub manifests: Vec<ManifestProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
}

/// The OS user that session subprocesses run as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixUser {
    pub user: String,
    pub group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunAs {
    QueueConfiguredUser,
    WorkerAgentUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunAsUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix: Option<PosixUser>,
    pub run_as: RunAs,
}

/// Temporary role credentials as the service returns them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

/// Host facts reported at registration and status updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_v4_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_v6_addresses: Vec<String>,
}

/// Declared worker capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub amounts: HashMap<String, f64>,
    #[serde(default)]
    pub attributes: HashMap<String, Vec<String>>,
}

/// Response body of UpdateWorker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfiguration>,
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
