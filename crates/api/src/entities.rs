// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job-entity shapes for the BatchGetJobEntity operation.
//!
//! Identifiers, data, and per-entity errors are all tagged unions keyed by
//! the entity kind. [`EntityKey`] is the canonical cache key shared by all
//! three.

use std::collections::HashMap;

use farmhand_core::{EnvironmentId, JobId, StepId};
use serde::{Deserialize, Serialize};

use crate::models::{AttachmentManifests, AttachmentSettings, JobRunAsUser, PathMapping, TaskParameter};

/// Canonical cache key for a job entity.
///
/// Environment and step ids are unique within a job, so they key directly;
/// job-level entities key off the job id, with attachment details given a
/// distinct namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema version carried by every entity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "jobtemplate-2023-09")]
    JobTemplate2023_09,
    #[serde(untagged)]
    Unknown(String),
}

impl SchemaVersion {
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::JobTemplate2023_09 => "jobtemplate-2023-09",
            Self::Unknown(v) => v,
        }
    }
}

/// Identifies one entity to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EntityIdentifier {
    JobDetails { job_id: JobId },
    StepDetails { job_id: JobId, step_id: StepId },
    EnvironmentDetails { job_id: JobId, environment_id: EnvironmentId },
    JobAttachmentDetails { job_id: JobId },
}

impl EntityIdentifier {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::JobDetails { job_id } => EntityKey(job_id.to_string()),
            Self::StepDetails { step_id, .. } => EntityKey(step_id.to_string()),
            Self::EnvironmentDetails { environment_id, .. } => EntityKey(environment_id.to_string()),
            Self::JobAttachmentDetails { job_id } => EntityKey(format!("attachments({job_id})")),
        }
    }
}

/// Job-level details payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetailsData {
    pub job_id: JobId,
    pub schema_version: SchemaVersion,
    pub log_group_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, TaskParameter>,
    #[serde(default)]
    pub path_mapping_rules: Vec<PathMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_attachment_settings: Option<AttachmentSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_run_as_user: Option<JobRunAsUser>,
}

/// Step details payload; `template` stays opaque to the agent and is handed
/// to the action runner as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDetailsData {
    pub job_id: JobId,
    pub step_id: StepId,
    pub schema_version: SchemaVersion,
    pub template: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
}

/// Environment details payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDetailsData {
    pub job_id: JobId,
    pub environment_id: EnvironmentId,
    pub schema_version: SchemaVersion,
    pub template: serde_json::Value,
}

/// Attachment manifest payload for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttachmentDetailsData {
    pub job_id: JobId,
    pub attachments: AttachmentManifests,
}

/// A successfully fetched entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobEntity {
    JobDetails(JobDetailsData),
    StepDetails(StepDetailsData),
    EnvironmentDetails(EnvironmentDetailsData),
    JobAttachmentDetails(JobAttachmentDetailsData),
}

impl JobEntity {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::JobDetails(data) => EntityKey(data.job_id.to_string()),
            Self::StepDetails(data) => EntityKey(data.step_id.to_string()),
            Self::EnvironmentDetails(data) => EntityKey(data.environment_id.to_string()),
            Self::JobAttachmentDetails(data) => EntityKey(format!("attachments({})", data.job_id)),
        }
    }
}

/// A per-entity failure from the batch response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EntityError {
    JobDetails {
        job_id: JobId,
        code: String,
        message: String,
    },
    StepDetails {
        job_id: JobId,
        step_id: StepId,
        code: String,
        message: String,
    },
    EnvironmentDetails {
        job_id: JobId,
        environment_id: EnvironmentId,
        code: String,
        message: String,
    },
    JobAttachmentDetails {
        job_id: JobId,
        code: String,
        message: String,
    },
}

impl EntityError {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::JobDetails { job_id, .. } => EntityKey(job_id.to_string()),
            Self::StepDetails { step_id, .. } => EntityKey(step_id.to_string()),
            Self::EnvironmentDetails { environment_id, .. } => {
                EntityKey(environment_id.to_string())
            }
            Self::JobAttachmentDetails { job_id, .. } => {
                EntityKey(format!("attachments({job_id})"))
            }
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::JobDetails { code, .. }
            | Self::StepDetails { code, .. }
            | Self::EnvironmentDetails { code, .. }
            | Self::JobAttachmentDetails { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::JobDetails { message, .. }
            | Self::StepDetails { message, .. }
            | Self::EnvironmentDetails { message, .. }
            | Self::JobAttachmentDetails { message, .. } => message,
        }
    }
}

/// Response body of BatchGetJobEntity. Successes and failures are reported
/// side by side; an identifier may appear in neither when the response hit
/// its payload cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntityResponse {
    #[serde(default)]
    pub entities: Vec<JobEntity>,
    #[serde(default)]
    pub errors: Vec<EntityError>,
}

#[cfg(test)]
#[path = "entities_tests.rs"]
mod tests;
