// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use async_trait::async_trait;
use farmhand_api::models::{CompletedStatus, DesiredWorkerStatus, WorkerStatus};
use farmhand_api::{DispatchService, ServiceException};
use farmhand_core::SystemClock;
use parking_lot::Mutex;

use crate::hostmeta::SpotInstanceAction;
use crate::log_sync::RemoteLogClient;
use crate::scheduler::{SchedulerConfig, SessionBackends};
use crate::testing::{
    assignment, schedule_response, seed_job_entities, test_identity, FakeBackends, FakeDispatch,
    FakeRemoteLog,
};

use super::*;

struct Harness {
    worker: Worker<SystemClock>,
    service: Arc<FakeDispatch>,
    backends: Arc<FakeBackends>,
    _dirs: tempfile::TempDir,
}

async fn harness(host_metadata: Option<Arc<dyn HostMetadataClient>>) -> Harness {
    let dirs = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(FakeDispatch::new());
    let backends = Arc::new(FakeBackends::new());
    let scheduler = Arc::new(WorkerScheduler::new(
        Arc::clone(&service) as Arc<dyn DispatchService>,
        test_identity(),
        Arc::clone(&backends) as Arc<dyn SessionBackends>,
        Some(Arc::new(FakeRemoteLog::new()) as Arc<dyn RemoteLogClient>),
        SchedulerConfig {
            persistence_dir: dirs.path().join("persist"),
            worker_logs_dir: None,
            sessions_dir: dirs.path().join("sessions"),
        },
        SystemClock,
    ));
    let credentials = Arc::new(
        WorkerCredentials::new(
            Arc::clone(&service) as Arc<dyn DispatchService>,
            test_identity(),
            dirs.path(),
            Interrupt::new(),
        )
        .await
        .expect("worker credentials"),
    );
    Harness {
        worker: Worker::new(scheduler, credentials, host_metadata),
        service,
        backends,
        _dirs: dirs,
    }
}

struct ScriptedMetadata {
    spot: Mutex<Option<SpotInstanceAction>>,
}

#[async_trait]
impl HostMetadataClient for ScriptedMetadata {
    async fn fetch_token(&self) -> Option<String> {
        Some("token".into())
    }

    async fn spot_instance_action(&self, _token: &str) -> Option<SpotInstanceAction> {
        self.spot.lock().clone()
    }

    async fn autoscaling_lifecycle_state(&self, _token: &str) -> Option<String> {
        Some("InService".into())
    }
}

#[tokio::test]
async fn service_requested_stop_exits_cleanly() {
    let harness = harness(None).await;
    let mut response = FakeDispatch::empty_schedule(1);
    response.desired_worker_status = Some(DesiredWorkerStatus::Stopped);
    harness.service.push_schedule(response);

    let result = harness.worker.run().await;
    assert!(matches!(
        result,
        Err(WorkerError::Scheduler(SchedulerError::ServiceShutdown))
    ));
    assert_eq!(exit_code_for(&result), 0);
}

#[tokio::test]
async fn spot_interruption_drains_running_work() {
    let metadata = Arc::new(ScriptedMetadata { spot: Mutex::new(None) });
    let harness = harness(Some(Arc::clone(&metadata) as Arc<dyn HostMetadataClient>)).await;
    seed_job_entities(&harness.service, "job-1");
    harness.backends.runner.hold("sessionaction-1");
    harness.service.push_schedule_times(
        schedule_response(
            vec![(
                "session-1",
                assignment(
                    "queue-1",
                    "job-1",
                    vec![farmhand_api::SessionActionSpec::TaskRun {
                        session_action_id: farmhand_core::ActionId::new("sessionaction-1"),
                        step_id: farmhand_core::StepId::new("step-1"),
                        task_id: farmhand_core::TaskId::new("task-1"),
                        parameters: Default::default(),
                    }],
                ),
            )],
            1,
        ),
        30,
    );

    let worker_run = async { harness.worker.run().await };
    let run = tokio::spawn({
        let backends = Arc::clone(&harness.backends);
        let metadata = Arc::clone(&metadata);
        async move {
            // Inject the interruption once the task is running.
            loop {
                if !backends.runner.calls.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            *metadata.spot.lock() = Some(SpotInstanceAction {
                action: "terminate".into(),
                time: Some(Utc::now() + chrono::Duration::seconds(20)),
            });
        }
    });

    let result = worker_run.await;
    run.await.expect("injector");
    assert!(result.is_ok(), "drain should complete cleanly: {result:?}");

    assert!(harness
        .service
        .completed_statuses("sessionaction-1")
        .contains(&CompletedStatus::Interrupted));
    let statuses = harness.service.state.lock().worker_statuses.clone();
    assert!(statuses.contains(&WorkerStatus::Stopping));
    let reports = harness.service.state.lock().reported_updates.clone();
    let message = reports
        .iter()
        .rev()
        .find_map(|updates| {
            updates
                .get(&farmhand_core::ActionId::new("sessionaction-1"))
                .and_then(|info| info.progress_message.clone())
        })
        .unwrap_or_default();
    assert!(message.contains("spot interruption"), "message: {message}");
}

#[tokio::test]
async fn worker_not_found_is_reported_for_reregistration() {
    let harness = harness(None).await;
    harness
        .service
        .push_schedule_error(ServiceException::ResourceNotFound { message: "gone".into() });

    let result = harness.worker.run().await;
    assert!(Worker::<SystemClock>::identity_unknown(&result));
    assert_ne!(exit_code_for(&result), 0);
}

#[tokio::test]
async fn exit_codes_match_the_contract() {
    assert_eq!(exit_code_for(&Ok(())), 0);
    assert_eq!(
        exit_code_for(&Err(WorkerError::Config(crate::config::ConfigError::MissingVar(
            "FARMHAND_FARM_ID"
        )))),
        1
    );
    assert_eq!(
        exit_code_for(&Err(WorkerError::Internal("panicked".into()))),
        2
    );
}
