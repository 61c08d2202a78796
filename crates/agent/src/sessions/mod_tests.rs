// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use farmhand_api::models::{AttachmentManifests, AttachmentSettings};
use farmhand_api::{EnvironmentDetailsData, JobEntity, SchemaVersion, StepDetailsData};
use farmhand_core::{FakeClock, StepId, SystemClock};
use yare::parameterized;

use crate::attachments::AttachmentEngine;
use crate::scheduler::queue::SessionActionQueue;
use crate::sessions::entities::JobEntityCache;
use crate::testing::{
    test_identity, FakeAttachmentEngine, FakeDispatch, FakeRunner, RunnerCall,
    StallingAttachmentEngine,
};

use super::*;

fn job_details(with_attachments: bool) -> JobDetailsData {
    JobDetailsData {
        job_id: JobId::new("job-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        log_group_name: "/farms/farm-1/queues/queue-1".into(),
        parameters: HashMap::new(),
        path_mapping_rules: vec![],
        queue_role_arn: None,
        job_attachment_settings: with_attachments.then(|| AttachmentSettings {
            s3_bucket_name: "bucket".into(),
            root_prefix: "prefix".into(),
        }),
        job_run_as_user: None,
    }
}

fn seeded_service() -> Arc<FakeDispatch> {
    let service = Arc::new(FakeDispatch::new());
    service.insert_entity(JobEntity::EnvironmentDetails(EnvironmentDetailsData {
        job_id: JobId::new("job-1"),
        environment_id: EnvironmentId::new("env-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
    }));
    service.insert_entity(JobEntity::StepDetails(StepDetailsData {
        job_id: JobId::new("job-1"),
        step_id: StepId::new("step-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
        dependencies: vec![],
    }));
    service.insert_entity(JobEntity::JobAttachmentDetails(
        farmhand_api::JobAttachmentDetailsData {
            job_id: JobId::new("job-1"),
            attachments: AttachmentManifests::default(),
        },
    ));
    service
}

struct Harness {
    session: Arc<Session<SystemClock>>,
    updates: Arc<ActionUpdates>,
    runner: Arc<FakeRunner>,
}

fn harness(
    actions: &[SessionActionSpec],
    attachments: Option<Arc<dyn AttachmentEngine>>,
    with_attachment_settings: bool,
) -> Harness {
    let service = seeded_service();
    let entities =
        Arc::new(JobEntityCache::new(service, test_identity(), JobId::new("job-1")));
    let queue = SessionActionQueue::new(
        SessionId::new("session-1"),
        QueueId::new("queue-1"),
        Arc::clone(&entities),
    );
    queue.replace(actions);
    let updates = Arc::new(ActionUpdates::new());
    let runner = Arc::new(FakeRunner::new());
    let session = Arc::new(Session::new(
        SessionConfig {
            id: SessionId::new("session-1"),
            queue_id: QueueId::new("queue-1"),
            job_id: JobId::new("job-1"),
            job_details: job_details(with_attachment_settings),
            os_user: None,
            working_dir: PathBuf::from("/tmp/session-1"),
            extra_env: HashMap::new(),
            logger: None,
        },
        &test_identity(),
        queue,
        entities,
        Arc::clone(&updates),
        runner.clone(),
        attachments,
        SystemClock,
    ));
    Harness { session, updates, runner }
}

fn env_enter(id: &str) -> SessionActionSpec {
    SessionActionSpec::EnvEnter {
        session_action_id: ActionId::new(id),
        environment_id: EnvironmentId::new("env-1"),
    }
}

fn env_exit(id: &str) -> SessionActionSpec {
    SessionActionSpec::EnvExit {
        session_action_id: ActionId::new(id),
        environment_id: EnvironmentId::new("env-1"),
    }
}

fn task_run(id: &str) -> SessionActionSpec {
    SessionActionSpec::TaskRun {
        session_action_id: ActionId::new(id),
        step_id: StepId::new("step-1"),
        task_id: farmhand_core::TaskId::new("task-1"),
        parameters: HashMap::new(),
    }
}

fn sync_input(id: &str) -> SessionActionSpec {
    SessionActionSpec::SyncInputJobAttachments {
        session_action_id: ActionId::new(id),
        step_id: None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn completed(updates: &ActionUpdates, id: &str) -> Option<CompletedStatus> {
    let (wire, _) = updates.snapshot();
    wire.get(&ActionId::new(id)).and_then(|info| info.completed_status)
}

#[tokio::test]
async fn happy_path_runs_all_actions_in_order() {
    let harness = harness(
        &[env_enter("sessionaction-1"), task_run("sessionaction-2"), env_exit("sessionaction-3")],
        None,
        false,
    );
    let run = tokio::spawn(Arc::clone(&harness.session).run());

    let updates = Arc::clone(&harness.updates);
    wait_until(|| {
        completed(&updates, "sessionaction-3") == Some(CompletedStatus::Succeeded)
    })
    .await;

    assert_eq!(completed(&harness.updates, "sessionaction-1"), Some(CompletedStatus::Succeeded));
    assert_eq!(completed(&harness.updates, "sessionaction-2"), Some(CompletedStatus::Succeeded));
    assert!(harness.session.is_idle());
    assert!(harness.session.active_environments().is_empty());

    let calls = harness.runner.calls.lock().clone();
    assert!(matches!(calls[0], RunnerCall::EnterEnvironment { .. }));
    assert!(matches!(calls[1], RunnerCall::RunTask { .. }));
    assert!(matches!(calls[2], RunnerCall::ExitEnvironment { .. }));

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn enter_and_exit_share_the_environment_handle() {
    let harness =
        harness(&[env_enter("sessionaction-1"), env_exit("sessionaction-2")], None, false);
    let run = tokio::spawn(Arc::clone(&harness.session).run());

    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-2") == Some(CompletedStatus::Succeeded)).await;

    let calls = harness.runner.calls.lock().clone();
    let entered = calls.iter().find_map(|call| match call {
        RunnerCall::EnterEnvironment { handle, .. } => Some(handle.clone()),
        _ => None,
    });
    let exited = calls.iter().find_map(|call| match call {
        RunnerCall::ExitEnvironment { handle, .. } => Some(handle.clone()),
        _ => None,
    });
    assert_eq!(entered, exited);

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn task_failure_cascades_but_env_exit_still_runs() {
    let harness = harness(
        &[
            env_enter("sessionaction-1"),
            task_run("sessionaction-2"),
            task_run("sessionaction-3"),
            env_exit("sessionaction-4"),
        ],
        None,
        false,
    );
    harness.runner.script("sessionaction-2", vec![ActionStatus::failed("render crashed")]);

    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-4") == Some(CompletedStatus::Succeeded)).await;

    assert_eq!(completed(&harness.updates, "sessionaction-2"), Some(CompletedStatus::Failed));
    assert_eq!(
        completed(&harness.updates, "sessionaction-3"),
        Some(CompletedStatus::NeverAttempted)
    );

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn timeout_is_reported_as_failure_with_timeout_message() {
    let harness = harness(&[task_run("sessionaction-1")], None, false);
    harness.runner.script(
        "sessionaction-1",
        vec![ActionStatus { state: ActionState::TimedOut, ..ActionStatus::default() }],
    );

    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-1").is_some()).await;

    let (wire, _) = harness.updates.snapshot();
    let info = &wire[&ActionId::new("sessionaction-1")];
    assert_eq!(info.completed_status, Some(CompletedStatus::Failed));
    assert!(info.progress_message.as_deref().is_some_and(|message| message.contains("timed out")));

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn stop_reports_interrupted_and_suppresses_late_callbacks() {
    let harness = harness(
        &[task_run("sessionaction-1"), task_run("sessionaction-2"), env_exit("sessionaction-3")],
        None,
        false,
    );
    harness.runner.hold("sessionaction-1");

    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let runner = harness.runner.clone();
    wait_until(move || {
        runner.calls.lock().iter().any(|call| matches!(call, RunnerCall::RunTask { .. }))
    })
    .await;

    harness.session.stop(
        StopCurrentActionResult::Interrupted,
        Some(Duration::from_secs(2)),
        Some("drain".into()),
    );
    run.await.unwrap();

    assert_eq!(
        completed(&harness.updates, "sessionaction-1"),
        Some(CompletedStatus::Interrupted)
    );
    assert_eq!(
        completed(&harness.updates, "sessionaction-2"),
        Some(CompletedStatus::NeverAttempted)
    );
    let (wire, _) = harness.updates.snapshot();
    assert_eq!(
        wire[&ActionId::new("sessionaction-1")].progress_message.as_deref(),
        Some("drain")
    );
    // The held task's Canceled callback arrived after the stop status and
    // must not have overwritten INTERRUPTED.
    assert_eq!(
        completed(&harness.updates, "sessionaction-1"),
        Some(CompletedStatus::Interrupted)
    );
}

#[tokio::test]
async fn cleanup_exits_environments_in_reverse_order() {
    let service = seeded_service();
    service.insert_entity(JobEntity::EnvironmentDetails(EnvironmentDetailsData {
        job_id: JobId::new("job-1"),
        environment_id: EnvironmentId::new("env-2"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
    }));
    let entities =
        Arc::new(JobEntityCache::new(service, test_identity(), JobId::new("job-1")));
    let queue = SessionActionQueue::new(
        SessionId::new("session-1"),
        QueueId::new("queue-1"),
        Arc::clone(&entities),
    );
    queue.replace(&[
        env_enter("sessionaction-1"),
        SessionActionSpec::EnvEnter {
            session_action_id: ActionId::new("sessionaction-2"),
            environment_id: EnvironmentId::new("env-2"),
        },
    ]);
    let updates = Arc::new(ActionUpdates::new());
    let runner = Arc::new(FakeRunner::new());
    let session = Arc::new(Session::new(
        SessionConfig {
            id: SessionId::new("session-1"),
            queue_id: QueueId::new("queue-1"),
            job_id: JobId::new("job-1"),
            job_details: job_details(false),
            os_user: None,
            working_dir: PathBuf::from("/tmp/session-1"),
            extra_env: HashMap::new(),
            logger: None,
        },
        &test_identity(),
        queue,
        entities,
        Arc::clone(&updates),
        runner.clone(),
        None,
        SystemClock,
    ));

    let run = tokio::spawn(Arc::clone(&session).run());
    wait_until(|| {
        completed(&updates, "sessionaction-2") == Some(CompletedStatus::Succeeded)
    })
    .await;
    assert_eq!(session.active_environments().len(), 2);

    session.stop(StopCurrentActionResult::Interrupted, Some(Duration::from_secs(5)), None);
    run.await.unwrap();

    let exits: Vec<String> = runner
        .calls
        .lock()
        .iter()
        .filter_map(|call| match call {
            RunnerCall::ExitEnvironment { handle, .. } => Some(handle.clone()),
            _ => None,
        })
        .collect();
    let enters: Vec<String> = runner
        .calls
        .lock()
        .iter()
        .filter_map(|call| match call {
            RunnerCall::EnterEnvironment { handle, .. } => Some(handle.clone()),
            _ => None,
        })
        .collect();
    let reversed: Vec<String> = enters.into_iter().rev().collect();
    assert_eq!(exits, reversed);
    assert!(session.active_environments().is_empty());
}

#[tokio::test]
async fn exit_of_non_top_environment_fails_the_action() {
    let harness = harness(
        &[
            env_enter("sessionaction-1"),
            SessionActionSpec::EnvExit {
                session_action_id: ActionId::new("sessionaction-2"),
                environment_id: EnvironmentId::new("env-other"),
            },
        ],
        None,
        false,
    );
    // env-other details must resolve for the dequeue to reach the LIFO check.
    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-2").is_some()).await;

    // env-other is not in the entity map, so the action fails at dequeue
    // time; either way it must not succeed and enter stays active.
    assert_eq!(completed(&harness.updates, "sessionaction-2"), Some(CompletedStatus::Failed));
    assert_eq!(harness.session.active_environments().len(), 1);

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn task_success_with_attachments_syncs_outputs_once() {
    let engine = Arc::new(FakeAttachmentEngine::new());
    let harness = harness(
        &[sync_input("sessionaction-1"), task_run("sessionaction-2")],
        Some(engine.clone() as Arc<dyn AttachmentEngine>),
        true,
    );
    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-2") == Some(CompletedStatus::Succeeded)).await;

    assert_eq!(engine.input_calls.lock().len(), 1);
    assert_eq!(engine.output_calls.lock().len(), 1);
    let output = &engine.output_calls.lock()[0];
    assert_eq!(output.action_id, ActionId::new("sessionaction-2"));
    assert_eq!(output.task_id, farmhand_core::TaskId::new("task-1"));

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();

    // Cleanup tears down the attachment working directory.
    assert_eq!(engine.cleanups.lock().len(), 1);
}

#[tokio::test]
async fn failed_output_sync_fails_the_task_action() {
    let engine = Arc::new(FakeAttachmentEngine::new());
    *engine.output_result.lock() =
        Some(Err(crate::attachments::AttachmentError::Failed("upload broke".into())));
    let harness = harness(
        &[sync_input("sessionaction-1"), task_run("sessionaction-2")],
        Some(engine.clone() as Arc<dyn AttachmentEngine>),
        true,
    );
    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-2").is_some()).await;

    let (wire, _) = harness.updates.snapshot();
    let info = &wire[&ActionId::new("sessionaction-2")];
    assert_eq!(info.completed_status, Some(CompletedStatus::Failed));
    assert!(info
        .progress_message
        .as_deref()
        .is_some_and(|message| message.contains("Failed to sync job output attachments")));

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn sustained_low_transfer_rate_cancels_and_fails_input_sync() {
    let engine = Arc::new(StallingAttachmentEngine {
        transfer_rate: LOW_TRANSFER_RATE_THRESHOLD / 2.0,
        input_calls: Mutex::new(0),
    });
    let harness = harness(&[sync_input("sessionaction-1")], Some(engine as Arc<dyn AttachmentEngine>), true);
    let run = tokio::spawn(Arc::clone(&harness.session).run());

    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-1").is_some()).await;

    let (wire, _) = harness.updates.snapshot();
    let info = &wire[&ActionId::new("sessionaction-1")];
    assert_eq!(info.completed_status, Some(CompletedStatus::Failed));
    let message = info.progress_message.as_deref().unwrap_or_default();
    assert!(message.contains("successive low transfer rates"), "message: {message}");
    assert!(message.contains("10 KB/s"), "message: {message}");
    assert!(message.contains("5 minutes"), "message: {message}");

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[tokio::test]
async fn input_sync_appends_and_sorts_path_mappings() {
    let engine = Arc::new(FakeAttachmentEngine::new());
    *engine.input_result.lock() = Some(Ok(crate::attachments::InputSyncOutcome {
        summary: Default::default(),
        path_mappings: vec![
            PathMapping {
                source_path_format: "posix".into(),
                source_path: "/assets".into(),
                destination_path: "/tmp/session-1/assets".into(),
            },
            PathMapping {
                source_path_format: "posix".into(),
                source_path: "/assets/textures/shared".into(),
                destination_path: "/tmp/session-1/tex".into(),
            },
        ],
    }));
    let harness = harness(&[sync_input("sessionaction-1")], Some(engine as Arc<dyn AttachmentEngine>), true);
    let run = tokio::spawn(Arc::clone(&harness.session).run());
    let updates = Arc::clone(&harness.updates);
    wait_until(|| completed(&updates, "sessionaction-1") == Some(CompletedStatus::Succeeded)).await;

    let rules = harness.session.path_mappings();
    assert_eq!(rules.len(), 2);
    // Longest source prefix first.
    assert_eq!(rules[0].source_path, "/assets/textures/shared");
    assert_eq!(rules[1].source_path, "/assets");

    harness.session.stop(StopCurrentActionResult::Interrupted, None, None);
    run.await.unwrap();
}

#[parameterized(
    zero = { 0, "0 seconds" },
    one_second = { 1, "1 second" },
    thirty = { 30, "30 seconds" },
    one_minute = { 60, "1 minute" },
    one_minute_one = { 61, "1 minute 1 second" },
    ninety = { 90, "1 minute 30 seconds" },
    five_minutes = { 300, "5 minutes" },
)]
fn seconds_to_minutes_strings(seconds: u32, expected: &str) {
    assert_eq!(seconds_to_minutes_str(seconds), expected);
}

#[test]
fn fake_clock_is_usable_for_session_generics() {
    // Session is generic over Clock; make sure the fake satisfies the bound.
    fn assert_clock<C: Clock>(_clock: C) {}
    assert_clock(FakeClock::new());
}
