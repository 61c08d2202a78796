// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interface to the external action runner.
//!
//! The runner owns the sandboxed subprocess lifecycle for one session: it
//! executes environment enter/exit scripts and task commands under the
//! session's OS user, and reports progress and completion through a status
//! channel. At most one invocation is in flight per session.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use farmhand_api::models::{CompletedStatus, TaskParameter};
use farmhand_api::{EnvironmentDetailsData, StepDetailsData};
use farmhand_core::TaskId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Lifecycle state the runner reports for the in-flight invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Running,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// The terminal status reported to the service, if this state is terminal.
    /// Timeouts are reported as failures.
    pub fn completed_status(self) -> Option<CompletedStatus> {
        match self {
            Self::Running => None,
            Self::Success => Some(CompletedStatus::Succeeded),
            Self::Failed | Self::TimedOut => Some(CompletedStatus::Failed),
            Self::Canceled => Some(CompletedStatus::Canceled),
        }
    }
}

/// One status callback from the runner.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionStatus {
    pub state: ActionState,
    pub progress: Option<f32>,
    pub exit_code: Option<i32>,
    pub status_message: Option<String>,
    pub fail_message: Option<String>,
}

impl Default for ActionState {
    fn default() -> Self {
        Self::Running
    }
}

impl ActionStatus {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn success() -> Self {
        Self { state: ActionState::Success, ..Self::default() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { state: ActionState::Failed, fail_message: Some(message.into()), ..Self::default() }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self { state: ActionState::Canceled, fail_message: Some(message.into()), ..Self::default() }
    }
}

/// Identifies an entered environment within the runner so it can be exited
/// later. Allocated by the session; unique within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentHandle(pub String);

impl std::fmt::Display for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The OS environment bag injected into every subprocess of an invocation.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub env: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("another invocation is already in flight")]
    Busy,
    #[error("unknown environment handle {0}")]
    UnknownEnvironment(EnvironmentHandle),
    #[error("runner failure: {0}")]
    Failed(String),
}

/// Sandboxed subprocess executor for one session.
///
/// The `enter_environment`/`exit_environment`/`run_task` methods return as
/// soon as the invocation is accepted; progress and the terminal state arrive
/// on the `updates` channel. Implementations run subprocesses under the
/// session's OS user and working directory.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    fn enter_environment(
        &self,
        handle: EnvironmentHandle,
        environment: EnvironmentDetailsData,
        context: ActionContext,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError>;

    fn exit_environment(
        &self,
        handle: EnvironmentHandle,
        context: ActionContext,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError>;

    fn run_task(
        &self,
        step: StepDetailsData,
        task_id: TaskId,
        parameters: HashMap<String, TaskParameter>,
        context: ActionContext,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError>;

    /// Cancel the in-flight invocation. The runner notifies the subprocess
    /// first and force-terminates it if it outlives `time_limit` (or the
    /// runner's own notify period when no limit is given).
    async fn cancel_current(&self, time_limit: Option<Duration>) -> Result<(), RunnerError>;

    /// Wait until no invocation is in flight. Returns false on timeout.
    async fn wait_idle(&self, timeout: Option<Duration>) -> bool;

    /// Tear down the runner's working state for the session.
    async fn cleanup(&self) -> Result<(), RunnerError>;
}
