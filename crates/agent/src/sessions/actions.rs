// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entity-resolved session actions.
//!
//! The queue stores actions as the service transmitted them
//! ([`farmhand_api::SessionActionSpec`]); dequeuing resolves the referenced
//! job entities and produces one of these runnable definitions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use farmhand_api::models::TaskParameter;
use farmhand_api::{EnvironmentDetailsData, JobAttachmentDetailsData, StepDetailsData};
use farmhand_core::{ActionId, EnvironmentId, StepId, TaskId};
use tokio_util::sync::CancellationToken;

/// A dequeued action, ready to hand to the runner or attachment engine.
#[derive(Debug, Clone)]
pub enum SessionAction {
    EnterEnv {
        id: ActionId,
        environment: EnvironmentDetailsData,
    },
    ExitEnv {
        id: ActionId,
        environment_id: EnvironmentId,
    },
    RunTask {
        id: ActionId,
        step: StepDetailsData,
        task_id: TaskId,
        parameters: HashMap<String, TaskParameter>,
    },
    SyncInput {
        id: ActionId,
        attachments: Option<JobAttachmentDetailsData>,
        step: Option<StepDetailsData>,
        cancel: CancellationToken,
    },
}

impl SessionAction {
    pub fn id(&self) -> &ActionId {
        match self {
            Self::EnterEnv { id, .. }
            | Self::ExitEnv { id, .. }
            | Self::RunTask { id, .. }
            | Self::SyncInput { id, .. } => id,
        }
    }

    pub fn is_env_exit(&self) -> bool {
        matches!(self, Self::ExitEnv { .. })
    }

    /// Short human-readable description for logs and fail messages.
    pub fn human_readable(&self) -> String {
        match self {
            Self::EnterEnv { environment, .. } => {
                format!("ENV_ENTER({})", environment.environment_id)
            }
            Self::ExitEnv { environment_id, .. } => format!("ENV_EXIT({environment_id})"),
            Self::RunTask { step, task_id, .. } => {
                format!("TASK_RUN({}, {})", step.step_id, task_id)
            }
            Self::SyncInput { step: Some(step), .. } => {
                format!("SYNC_INPUT_JOB_ATTACHMENTS({})", step.step_id)
            }
            Self::SyncInput { .. } => "SYNC_INPUT_JOB_ATTACHMENTS".to_string(),
        }
    }
}

/// An environment that has been entered and not yet exited. The stack of
/// these is strictly LIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEnvironment {
    pub handle: crate::runner::EnvironmentHandle,
    pub environment_id: EnvironmentId,
}

/// Task identity carried by a running TASK_RUN, used for the bundled output
/// sync after the task succeeds.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub step_id: StepId,
    pub task_id: TaskId,
}

/// The at-most-one in-flight action of a session.
#[derive(Debug, Clone)]
pub struct CurrentAction {
    pub id: ActionId,
    pub human: String,
    pub start_time: DateTime<Utc>,
    /// Set for TASK_RUN actions.
    pub task: Option<TaskInfo>,
    /// Set for SYNC_INPUT_JOB_ATTACHMENTS actions; cancels the transfer.
    pub sync_cancel: Option<CancellationToken>,
}
