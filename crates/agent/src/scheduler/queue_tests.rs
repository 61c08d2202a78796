// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use farmhand_api::models::CompletedStatus;
use farmhand_api::{EnvironmentDetailsData, SchemaVersion, StepDetailsData};
use farmhand_core::{EnvironmentId, JobId, TaskId};

use crate::scheduler::updates::ActionUpdates;
use crate::testing::{test_identity, FakeDispatch};

use super::*;

fn env_enter(id: &str, env: &str) -> SessionActionSpec {
    SessionActionSpec::EnvEnter {
        session_action_id: ActionId::new(id),
        environment_id: EnvironmentId::new(env),
    }
}

fn env_exit(id: &str, env: &str) -> SessionActionSpec {
    SessionActionSpec::EnvExit {
        session_action_id: ActionId::new(id),
        environment_id: EnvironmentId::new(env),
    }
}

fn task_run(id: &str, step: &str) -> SessionActionSpec {
    SessionActionSpec::TaskRun {
        session_action_id: ActionId::new(id),
        step_id: farmhand_core::StepId::new(step),
        task_id: TaskId::new("task-1"),
        parameters: Default::default(),
    }
}

fn seeded_service() -> Arc<FakeDispatch> {
    let service = Arc::new(FakeDispatch::new());
    service.insert_entity(farmhand_api::JobEntity::EnvironmentDetails(EnvironmentDetailsData {
        job_id: JobId::new("job-1"),
        environment_id: EnvironmentId::new("env-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
    }));
    service.insert_entity(farmhand_api::JobEntity::StepDetails(StepDetailsData {
        job_id: JobId::new("job-1"),
        step_id: farmhand_core::StepId::new("step-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
        dependencies: vec![],
    }));
    service
}

fn queue_with(service: Arc<FakeDispatch>) -> SessionActionQueue {
    let entities = Arc::new(JobEntityCache::new(service, test_identity(), JobId::new("job-1")));
    SessionActionQueue::new(SessionId::new("session-1"), QueueId::new("queue-1"), entities)
}

#[tokio::test]
async fn dequeue_returns_actions_in_assignment_order() {
    let queue = queue_with(seeded_service());
    queue.replace(&[env_enter("sessionaction-1", "env-1"), task_run("sessionaction-2", "step-1")]);

    let first = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(first.id(), &ActionId::new("sessionaction-1"));
    assert!(matches!(first, SessionAction::EnterEnv { .. }));

    let second = queue.dequeue().await.unwrap().unwrap();
    assert!(matches!(second, SessionAction::RunTask { .. }));

    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn replace_is_idempotent_and_preserves_cancel_tokens() {
    let queue = queue_with(seeded_service());
    let actions = vec![env_enter("sessionaction-1", "env-1"), task_run("sessionaction-2", "step-1")];
    queue.replace(&actions);

    // Grab the head's token indirectly: cancel it, then replace again with
    // the same list. A fresh record would have a fresh (uncancelled) token
    // and the dequeue would return the action.
    let updates = ActionUpdates::new();
    {
        let mut pending = updates.lock();
        assert!(queue.cancel(
            &mut pending,
            &ActionId::new("sessionaction-1"),
            CancelOutcome::NeverAttempted,
            Some("canceled"),
            chrono::Utc::now(),
        ));
    }
    queue.replace(&actions);
    queue.replace(&actions);

    // sessionaction-1 was re-added by replace (it had been removed), so it
    // dequeues fresh; sessionaction-2's record survived both replaces.
    let head = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(head.id(), &ActionId::new("sessionaction-1"));
}

#[tokio::test]
async fn replace_drops_absent_ids() {
    let queue = queue_with(seeded_service());
    queue.replace(&[env_enter("sessionaction-1", "env-1"), task_run("sessionaction-2", "step-1")]);
    queue.replace(&[task_run("sessionaction-2", "step-1")]);

    let head = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(head.id(), &ActionId::new("sessionaction-2"));
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_posts_terminal_update_with_failed_timestamps() {
    let queue = queue_with(seeded_service());
    queue.replace(&[task_run("sessionaction-1", "step-1")]);
    let updates = ActionUpdates::new();
    let now = chrono::Utc::now();

    {
        let mut pending = updates.lock();
        queue.cancel(
            &mut pending,
            &ActionId::new("sessionaction-1"),
            CancelOutcome::Failed,
            Some("fatal"),
            now,
        );
    }

    let (wire, _) = updates.snapshot();
    let info = &wire[&ActionId::new("sessionaction-1")];
    assert_eq!(info.completed_status, Some(CompletedStatus::Failed));
    assert_eq!(info.started_at, Some(now));
    assert_eq!(info.ended_at, Some(now));
    assert_eq!(info.progress_message.as_deref(), Some("fatal"));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn cancel_never_attempted_omits_timestamps() {
    let queue = queue_with(seeded_service());
    queue.replace(&[task_run("sessionaction-1", "step-1")]);
    let updates = ActionUpdates::new();

    {
        let mut pending = updates.lock();
        queue.cancel(
            &mut pending,
            &ActionId::new("sessionaction-1"),
            CancelOutcome::NeverAttempted,
            None,
            chrono::Utc::now(),
        );
    }

    let (wire, _) = updates.snapshot();
    let info = &wire[&ActionId::new("sessionaction-1")];
    assert_eq!(info.completed_status, Some(CompletedStatus::NeverAttempted));
    assert!(info.started_at.is_none());
    assert!(info.ended_at.is_none());
}

#[tokio::test]
async fn cancel_all_spares_env_exits() {
    let queue = queue_with(seeded_service());
    queue.replace(&[
        task_run("sessionaction-1", "step-1"),
        env_exit("sessionaction-2", "env-1"),
        task_run("sessionaction-3", "step-1"),
    ]);
    let updates = ActionUpdates::new();

    {
        let mut pending = updates.lock();
        queue.cancel_all(
            &mut pending,
            CancelOutcome::NeverAttempted,
            Some("draining"),
            true,
            chrono::Utc::now(),
        );
    }

    let (wire, _) = updates.snapshot();
    assert_eq!(wire.len(), 2);
    assert!(wire.contains_key(&ActionId::new("sessionaction-1")));
    assert!(wire.contains_key(&ActionId::new("sessionaction-3")));

    // The env exit is still queued and runnable.
    let remaining = queue.dequeue().await.unwrap().unwrap();
    assert!(remaining.is_env_exit());
}

#[tokio::test]
async fn dequeue_schema_error_carries_the_action_id() {
    let service = Arc::new(FakeDispatch::new());
    service.insert_entity(farmhand_api::JobEntity::StepDetails(StepDetailsData {
        job_id: JobId::new("job-1"),
        step_id: farmhand_core::StepId::new("step-1"),
        schema_version: SchemaVersion::Unknown("jobtemplate-2031-01".into()),
        template: serde_json::json!({}),
        dependencies: vec![],
    }));
    let queue = queue_with(service);
    queue.replace(&[task_run("sessionaction-1", "step-1")]);

    let error = queue.dequeue().await.unwrap_err();
    assert_eq!(error.action_id(), &ActionId::new("sessionaction-1"));
    assert!(error.to_string().contains("does not support schema version"));
}

#[tokio::test]
async fn list_identifiers_covers_every_queued_action() {
    let queue = queue_with(seeded_service());
    queue.replace(&[
        env_enter("sessionaction-1", "env-1"),
        task_run("sessionaction-2", "step-1"),
        SessionActionSpec::SyncInputJobAttachments {
            session_action_id: ActionId::new("sessionaction-3"),
            step_id: None,
        },
    ]);
    let identifiers = queue.list_identifiers();
    assert_eq!(identifiers.len(), 3);
    assert!(matches!(identifiers[0], EntityIdentifier::EnvironmentDetails { .. }));
    assert!(matches!(identifiers[1], EntityIdentifier::StepDetails { .. }));
    assert!(matches!(identifiers[2], EntityIdentifier::JobAttachmentDetails { .. }));
}
