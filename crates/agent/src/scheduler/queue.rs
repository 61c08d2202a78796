// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-session action queue.
//!
//! An ordered list of pending actions in exactly the order the service
//! assigned them; there is no priority within a session. Each record carries
//! a private cancel token that survives [`SessionActionQueue::replace`] so an
//! in-flight lazy entity fetch observes cancellation. Dequeuing resolves the
//! action's job entities through the session's entity cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use farmhand_api::models::CompletedStatus;
use farmhand_api::{EntityIdentifier, SessionActionSpec};
use farmhand_core::{ActionId, QueueId, SessionId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::runner::{ActionState, ActionStatus};
use crate::scheduler::updates::{PendingUpdates, SessionActionStatus};
use crate::sessions::actions::SessionAction;
use crate::sessions::entities::{EntityFetchError, JobEntityCache};
use crate::sessions::errors::SessionActionError;

/// How a cancelled queue entry is reported to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    NeverAttempted,
    Failed,
}

impl CancelOutcome {
    fn completed_status(self) -> CompletedStatus {
        match self {
            Self::NeverAttempted => CompletedStatus::NeverAttempted,
            Self::Failed => CompletedStatus::Failed,
        }
    }
}

#[derive(Debug)]
struct ActionRecord {
    spec: SessionActionSpec,
    cancel: CancellationToken,
}

pub struct SessionActionQueue {
    session_id: SessionId,
    queue_id: QueueId,
    entities: Arc<JobEntityCache>,
    records: Mutex<Vec<ActionRecord>>,
}

impl SessionActionQueue {
    pub fn new(session_id: SessionId, queue_id: QueueId, entities: Arc<JobEntityCache>) -> Self {
        Self { session_id, queue_id, entities, records: Mutex::new(Vec::new()) }
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Replace the queue contents with `actions`, preserving the records (and
    /// cancel tokens) of ids that are already queued. Order follows the
    /// incoming list.
    pub fn replace(&self, actions: &[SessionActionSpec]) {
        let mut records = self.records.lock();
        let mut added: Vec<ActionId> = Vec::new();
        let mut next: Vec<ActionRecord> = Vec::with_capacity(actions.len());
        for spec in actions {
            let existing = records
                .iter()
                .position(|record| record.spec.action_id() == spec.action_id());
            match existing {
                Some(index) => next.push(records.swap_remove(index)),
                None => {
                    added.push(spec.action_id().clone());
                    next.push(ActionRecord {
                        spec: spec.clone(),
                        cancel: CancellationToken::new(),
                    });
                }
            }
        }
        *records = next;
        if !added.is_empty() {
            info!(
                session_id = %self.session_id,
                queue_id = %self.queue_id,
                added = ?added,
                queued = records.len(),
                "appended session actions"
            );
        }
    }

    /// Cancel one queued action: remove it, fire its cancel token, and post
    /// the terminal update. Timestamps are reported only for FAILED outcomes.
    pub fn cancel(
        &self,
        pending: &mut PendingUpdates,
        id: &ActionId,
        outcome: CancelOutcome,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let record = {
            let mut records = self.records.lock();
            let Some(index) = records.iter().position(|record| record.spec.action_id() == id)
            else {
                return false;
            };
            records.remove(index)
        };
        record.cancel.cancel();

        let timestamp = (outcome == CancelOutcome::Failed).then_some(now);
        pending.post(SessionActionStatus {
            id: id.clone(),
            status: Some(ActionStatus {
                state: ActionState::Failed,
                fail_message: message.map(str::to_string),
                ..ActionStatus::default()
            }),
            start_time: timestamp,
            end_time: timestamp,
            update_time: None,
            completed_status: Some(outcome.completed_status()),
        });
        true
    }

    /// Cancel every queued action, optionally keeping ENV_EXIT actions so
    /// entered environments still unwind.
    pub fn cancel_all(
        &self,
        pending: &mut PendingUpdates,
        outcome: CancelOutcome,
        message: Option<&str>,
        ignore_env_exits: bool,
        now: DateTime<Utc>,
    ) {
        let targets: Vec<ActionId> = {
            let records = self.records.lock();
            records
                .iter()
                .filter(|record| !(ignore_env_exits && record.spec.is_env_exit()))
                .map(|record| record.spec.action_id().clone())
                .collect()
        };
        for id in &targets {
            self.cancel(pending, id, outcome, message, now);
        }
        if !targets.is_empty() {
            info!(
                session_id = %self.session_id,
                queue_id = %self.queue_id,
                removed = ?targets,
                queued = self.records.lock().len(),
                "removed session actions"
            );
        }
    }

    /// Entity identifiers for every queued action, for cache warm-up.
    pub fn list_identifiers(&self) -> Vec<EntityIdentifier> {
        let job_id = self.entities.job_id().clone();
        self.records
            .lock()
            .iter()
            .map(|record| match &record.spec {
                SessionActionSpec::EnvEnter { environment_id, .. }
                | SessionActionSpec::EnvExit { environment_id, .. } => {
                    EntityIdentifier::EnvironmentDetails {
                        job_id: job_id.clone(),
                        environment_id: environment_id.clone(),
                    }
                }
                SessionActionSpec::TaskRun { step_id, .. } => EntityIdentifier::StepDetails {
                    job_id: job_id.clone(),
                    step_id: step_id.clone(),
                },
                SessionActionSpec::SyncInputJobAttachments { step_id: Some(step_id), .. } => {
                    EntityIdentifier::StepDetails { job_id: job_id.clone(), step_id: step_id.clone() }
                }
                SessionActionSpec::SyncInputJobAttachments { step_id: None, .. } => {
                    EntityIdentifier::JobAttachmentDetails { job_id: job_id.clone() }
                }
            })
            .collect()
    }

    /// Pop the head of the queue, resolving its job entities.
    ///
    /// The queue lock is not held across the fetch; if the head is cancelled
    /// or replaced while the fetch is in flight, the result is discarded and
    /// the new head is tried instead.
    pub async fn dequeue(&self) -> Result<Option<SessionAction>, SessionActionError> {
        loop {
            let (spec, cancel) = {
                let records = self.records.lock();
                let Some(head) = records.first() else {
                    return Ok(None);
                };
                (head.spec.clone(), head.cancel.clone())
            };

            let resolved = self.resolve(&spec, &cancel).await?;

            let mut records = self.records.lock();
            let head_unchanged = records
                .first()
                .is_some_and(|head| head.spec.action_id() == spec.action_id());
            if head_unchanged && !cancel.is_cancelled() {
                records.remove(0);
                return Ok(Some(resolved));
            }
            // The queue changed during the fetch; try again from the top.
        }
    }

    async fn resolve(
        &self,
        spec: &SessionActionSpec,
        cancel: &CancellationToken,
    ) -> Result<SessionAction, SessionActionError> {
        let action_id = spec.action_id().clone();
        let details_error = |error: EntityFetchError| match error {
            EntityFetchError::UnsupportedSchema(schema_version) => {
                SessionActionError::UnsupportedSchema { action_id: action_id.clone(), schema_version }
            }
            other => SessionActionError::Details {
                action_id: action_id.clone(),
                message: other.to_string(),
            },
        };

        match spec {
            SessionActionSpec::EnvEnter { environment_id, .. } => {
                let environment = self
                    .entities
                    .environment_details(environment_id)
                    .await
                    .map_err(details_error)?;
                Ok(SessionAction::EnterEnv { id: action_id, environment })
            }
            SessionActionSpec::EnvExit { environment_id, .. } => {
                // Resolution confirms the entity is fetchable and its schema
                // supported before the exit is attempted.
                self.entities
                    .environment_details(environment_id)
                    .await
                    .map_err(details_error)?;
                Ok(SessionAction::ExitEnv { id: action_id, environment_id: environment_id.clone() })
            }
            SessionActionSpec::TaskRun { step_id, task_id, parameters, .. } => {
                let step = self.entities.step_details(step_id).await.map_err(details_error)?;
                Ok(SessionAction::RunTask {
                    id: action_id,
                    step,
                    task_id: task_id.clone(),
                    parameters: parameters.clone(),
                })
            }
            SessionActionSpec::SyncInputJobAttachments { step_id: Some(step_id), .. } => {
                let step = self.entities.step_details(step_id).await.map_err(details_error)?;
                Ok(SessionAction::SyncInput {
                    id: action_id,
                    attachments: None,
                    step: Some(step),
                    cancel: cancel.clone(),
                })
            }
            SessionActionSpec::SyncInputJobAttachments { step_id: None, .. } => {
                let attachments =
                    self.entities.job_attachment_details().await.map_err(details_error)?;
                Ok(SessionAction::SyncInput {
                    id: action_id,
                    attachments: Some(attachments),
                    step: None,
                    cancel: cancel.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
