// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use farmhand_api::models::CompletedStatus;
use farmhand_api::{ServiceException, SessionActionSpec};
use farmhand_core::{EnvironmentId, StepId, SystemClock, TaskId};

use crate::testing::{
    assignment, schedule_response, seed_job_entities, test_identity, FakeBackends, FakeDispatch,
    FakeRemoteLog,
};

use super::*;

struct Harness {
    scheduler: Arc<WorkerScheduler<SystemClock>>,
    service: Arc<FakeDispatch>,
    backends: Arc<FakeBackends>,
    _dirs: tempfile::TempDir,
}

fn harness(worker_logs: bool) -> Harness {
    let dirs = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(FakeDispatch::new());
    let backends = Arc::new(FakeBackends::new());
    let config = SchedulerConfig {
        persistence_dir: dirs.path().join("persist"),
        worker_logs_dir: worker_logs.then(|| dirs.path().join("logs")),
        sessions_dir: dirs.path().join("sessions"),
    };
    let scheduler = Arc::new(WorkerScheduler::new(
        Arc::clone(&service) as Arc<dyn DispatchService>,
        test_identity(),
        Arc::clone(&backends) as Arc<dyn SessionBackends>,
        Some(Arc::new(FakeRemoteLog::new()) as Arc<dyn RemoteLogClient>),
        config,
        SystemClock,
    ));
    Harness { scheduler, service, backends, _dirs: dirs }
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
        task_id: TaskId::new("task-1"),
        parameters: HashMap::new(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn assignment_becomes_a_session_and_reports_success() {
    let harness = harness(true);
    seed_job_entities(&harness.service, "job-1");
    harness.service.push_schedule_times(
        schedule_response(
            vec![(
                "session-1",
                assignment(
                    "queue-1",
                    "job-1",
                    vec![
                        env_enter("sessionaction-1"),
                        task_run("sessionaction-2"),
                        env_exit("sessionaction-3"),
                    ],
                ),
            )],
            1,
        ),
        20,
    );

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });

    let service = Arc::clone(&harness.service);
    wait_until(move || {
        service.completed_statuses("sessionaction-3").contains(&CompletedStatus::Succeeded)
    })
    .await;

    assert!(harness
        .service
        .completed_statuses("sessionaction-1")
        .contains(&CompletedStatus::Succeeded));
    assert!(harness
        .service
        .completed_statuses("sessionaction-2")
        .contains(&CompletedStatus::Succeeded));
    assert_eq!(harness.backends.runner_specs.lock().as_slice(), ["session-1"]);

    harness.scheduler.shutdown(Some(Duration::from_secs(1)), None);
    run.await.expect("join").expect("graceful drain");
}

#[tokio::test]
async fn session_local_log_file_is_provisioned() {
    let harness = harness(true);
    seed_job_entities(&harness.service, "job-1");
    harness.service.push_schedule_times(
        schedule_response(
            vec![("session-1", assignment("queue-1", "job-1", vec![task_run("sessionaction-1")]))],
            1,
        ),
        10,
    );

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });
    let service = Arc::clone(&harness.service);
    wait_until(move || !service.completed_statuses("sessionaction-1").is_empty()).await;

    let log_file = harness._dirs.path().join("logs/queue-1/session-1.log");
    assert!(log_file.is_file(), "expected session log at {}", log_file.display());

    harness.scheduler.shutdown(None, None);
    run.await.expect("join").expect("drain");
}

#[tokio::test]
async fn sessions_no_longer_assigned_are_removed() {
    let harness = harness(false);
    seed_job_entities(&harness.service, "job-1");
    harness.service.push_schedule_times(
        schedule_response(
            vec![("session-1", assignment("queue-1", "job-1", vec![task_run("sessionaction-1")]))],
            1,
        ),
        3,
    );
    // Once the scripted responses run out, heartbeats assign nothing: the
    // session must be torn down.

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });

    let service = Arc::clone(&harness.service);
    wait_until(move || {
        service.completed_statuses("sessionaction-1").contains(&CompletedStatus::Succeeded)
    })
    .await;
    let scheduler = Arc::clone(&harness.scheduler);
    wait_until(move || scheduler.session_count() == 0).await;

    harness.scheduler.shutdown(None, None);
    run.await.expect("join").expect("drain");
}

#[tokio::test]
async fn missing_job_details_fail_the_whole_assignment() {
    let harness = harness(false);
    // No entities seeded: job details cannot resolve.
    harness.service.push_schedule(schedule_response(
        vec![(
            "session-1",
            assignment(
                "queue-1",
                "job-1",
                vec![task_run("sessionaction-1"), env_exit("sessionaction-2")],
            ),
        )],
        1,
    ));

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });

    let service = Arc::clone(&harness.service);
    wait_until(move || !service.completed_statuses("sessionaction-1").is_empty()).await;

    assert!(harness
        .service
        .completed_statuses("sessionaction-1")
        .contains(&CompletedStatus::Failed));
    assert!(harness
        .service
        .completed_statuses("sessionaction-2")
        .contains(&CompletedStatus::NeverAttempted));
    assert_eq!(harness.scheduler.session_count(), 0);

    harness.scheduler.shutdown(None, None);
    run.await.expect("join").expect("drain");
}

#[tokio::test]
async fn unsupported_log_driver_fails_the_assignment() {
    let harness = harness(false);
    seed_job_entities(&harness.service, "job-1");
    let mut assigned = assignment("queue-1", "job-1", vec![task_run("sessionaction-1")]);
    if let Some(log) = assigned.log_configuration.as_mut() {
        log.log_driver = "journald".into();
    }
    harness.service.push_schedule(schedule_response(vec![("session-1", assigned)], 1));

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });

    let service = Arc::clone(&harness.service);
    wait_until(move || {
        service.completed_statuses("sessionaction-1").contains(&CompletedStatus::Failed)
    })
    .await;

    harness.scheduler.shutdown(None, None);
    run.await.expect("join").expect("drain");
}

#[tokio::test]
async fn worker_not_found_is_fatal() {
    let harness = harness(false);
    harness
        .service
        .push_schedule_error(ServiceException::ResourceNotFound { message: "gone".into() });

    let result = harness.scheduler.run().await;
    assert!(matches!(
        result,
        Err(SchedulerError::Request(RequestError::WorkerNotFound(_)))
    ));
}

#[tokio::test]
async fn service_requested_stop_surfaces_as_service_shutdown() {
    let harness = harness(false);
    let mut response = FakeDispatch::empty_schedule(1);
    response.desired_worker_status = Some(DesiredWorkerStatus::Stopped);
    harness.service.push_schedule(response);

    let result = harness.scheduler.run().await;
    assert!(matches!(result, Err(SchedulerError::ServiceShutdown)));
}

#[tokio::test]
async fn drain_transitions_to_stopping_and_flushes_interrupted_updates() {
    let harness = harness(false);
    seed_job_entities(&harness.service, "job-1");
    harness.backends.runner.hold("sessionaction-1");
    harness.service.push_schedule_times(
        schedule_response(
            vec![("session-1", assignment("queue-1", "job-1", vec![task_run("sessionaction-1")]))],
            1,
        ),
        30,
    );

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });

    // Wait for the task to be in flight.
    let backends = Arc::clone(&harness.backends);
    wait_until(move || !backends.runner.calls.lock().is_empty()).await;

    harness.scheduler.shutdown(Some(Duration::from_secs(2)), Some("drain".into()));
    run.await.expect("join").expect("graceful drain");

    let statuses = harness.service.state.lock().worker_statuses.clone();
    assert!(statuses.contains(&WorkerStatus::Stopping), "statuses: {statuses:?}");
    assert!(harness
        .service
        .completed_statuses("sessionaction-1")
        .contains(&CompletedStatus::Interrupted));
    // The INTERRUPTED update went out with the final flush.
    let reports = harness.service.state.lock().reported_updates.clone();
    let last_with_action = reports
        .iter()
        .rev()
        .find(|updates| updates.contains_key(&ActionId::new("sessionaction-1")))
        .expect("interrupted update must have been reported");
    assert_eq!(
        last_with_action[&ActionId::new("sessionaction-1")].progress_message.as_deref(),
        Some("drain")
    );
}
