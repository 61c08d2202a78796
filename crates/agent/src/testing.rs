// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake collaborators for tests.
//!
//! Scriptable stand-ins for the dispatch service, the action runner, the
//! attachment engine, and the remote log sink.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use farmhand_api::models::{
    Capabilities, HostProperties, RoleCredentials, TaskParameter, UpdateScheduleResponse,
    UpdateWorkerResponse, UpdatedActionInfo, WorkerIdentity, WorkerStatus,
};
use farmhand_api::{
    BatchEntityResponse, DispatchService, EntityError, EntityIdentifier, EntityKey,
    EnvironmentDetailsData, JobEntity, ServiceException, StepDetailsData,
};
use farmhand_core::{ActionId, FarmId, FleetId, QueueId, TaskId, WorkerId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::attachments::{
    AttachmentEngine, AttachmentError, InputSyncOutcome, InputSyncRequest, OutputSyncRequest,
    ProgressCallback, ProgressReport, TransferSummary,
};
use crate::credentials::QueueCredentials;
use crate::log_sync::{LogEntry, RemoteLogClient, RemoteLogError};
use crate::runner::{
    ActionContext, ActionRunner, ActionStatus, EnvironmentHandle, RunnerError,
};
use crate::scheduler::{RunnerSpec, SessionBackends};

pub fn test_identity() -> WorkerIdentity {
    WorkerIdentity {
        farm_id: FarmId::new("farm-1"),
        fleet_id: FleetId::new("fleet-1"),
        worker_id: WorkerId::new("worker-1"),
    }
}

pub fn test_credentials(valid_for: ChronoDuration) -> RoleCredentials {
    RoleCredentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "secret".into(),
        session_token: "token".into(),
        expiration: Utc::now() + valid_for,
    }
}

/// Scriptable dispatch service.
///
/// Heartbeat responses are consumed from a queue; once it runs dry an empty
/// schedule is returned. Entities resolve from an in-memory map.
#[derive(Default)]
pub struct FakeDispatch {
    pub state: Mutex<FakeDispatchState>,
}

pub struct FakeDispatchState {
    pub schedule_responses: VecDeque<Result<UpdateScheduleResponse, ServiceException>>,
    /// Every updatedSessionActions map received, in call order.
    pub reported_updates: Vec<HashMap<ActionId, UpdatedActionInfo>>,
    pub entities: HashMap<EntityKey, JobEntity>,
    pub entity_errors: HashMap<EntityKey, EntityError>,
    /// Keys that fail once with MaxPayloadSizeExceeded, then resolve.
    pub payload_limited_once: HashSet<EntityKey>,
    pub batch_requests: Vec<Vec<EntityIdentifier>>,
    pub queue_role_results: VecDeque<Result<RoleCredentials, ServiceException>>,
    pub fleet_role_results: VecDeque<Result<RoleCredentials, ServiceException>>,
    pub worker_statuses: Vec<WorkerStatus>,
    pub created_workers: usize,
    pub max_batch: usize,
    /// Action ids whose terminal status has been reported; the service
    /// prunes them from subsequent assignments, and so does this fake.
    pub acknowledged_actions: HashSet<ActionId>,
}

impl Default for FakeDispatchState {
    fn default() -> Self {
        Self {
            schedule_responses: VecDeque::new(),
            reported_updates: Vec::new(),
            entities: HashMap::new(),
            entity_errors: HashMap::new(),
            payload_limited_once: HashSet::new(),
            batch_requests: Vec::new(),
            queue_role_results: VecDeque::new(),
            fleet_role_results: VecDeque::new(),
            worker_statuses: Vec::new(),
            created_workers: 0,
            max_batch: 25,
            acknowledged_actions: HashSet::new(),
        }
    }
}

impl FakeDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_schedule(&self, response: UpdateScheduleResponse) {
        self.state.lock().schedule_responses.push_back(Ok(response));
    }

    /// Queue the same response for `count` consecutive heartbeats; completed
    /// actions are pruned from each per the acknowledgement bookkeeping.
    pub fn push_schedule_times(&self, response: UpdateScheduleResponse, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.schedule_responses.push_back(Ok(response.clone()));
        }
    }

    pub fn push_schedule_error(&self, error: ServiceException) {
        self.state.lock().schedule_responses.push_back(Err(error));
    }

    pub fn insert_entity(&self, entity: JobEntity) {
        self.state.lock().entities.insert(entity.key(), entity);
    }

    pub fn insert_entity_error(&self, error: EntityError) {
        self.state.lock().entity_errors.insert(error.key(), error);
    }

    /// Terminal statuses reported so far for the given action.
    pub fn completed_statuses(&self, action_id: &str) -> Vec<farmhand_api::models::CompletedStatus> {
        let id = ActionId::new(action_id);
        self.state
            .lock()
            .reported_updates
            .iter()
            .filter_map(|updates| updates.get(&id).and_then(|info| info.completed_status))
            .collect()
    }

    pub fn empty_schedule(interval: u64) -> UpdateScheduleResponse {
        UpdateScheduleResponse {
            assigned_sessions: HashMap::new(),
            cancel_session_actions: HashMap::new(),
            update_interval_seconds: interval,
            desired_worker_status: None,
        }
    }
}

#[async_trait]
impl DispatchService for FakeDispatch {
    async fn create_worker(
        &self,
        _farm_id: &FarmId,
        _fleet_id: &FleetId,
        _host_properties: &HostProperties,
    ) -> Result<WorkerId, ServiceException> {
        let mut state = self.state.lock();
        state.created_workers += 1;
        Ok(WorkerId::new(format!("worker-{}", state.created_workers)))
    }

    async fn delete_worker(&self, _identity: &WorkerIdentity) -> Result<(), ServiceException> {
        Ok(())
    }

    async fn update_worker(
        &self,
        _identity: &WorkerIdentity,
        status: WorkerStatus,
        _capabilities: Option<&Capabilities>,
        _host_properties: Option<&HostProperties>,
    ) -> Result<UpdateWorkerResponse, ServiceException> {
        self.state.lock().worker_statuses.push(status);
        Ok(UpdateWorkerResponse::default())
    }

    async fn assume_fleet_role(
        &self,
        _identity: &WorkerIdentity,
    ) -> Result<RoleCredentials, ServiceException> {
        let mut state = self.state.lock();
        state
            .fleet_role_results
            .pop_front()
            .unwrap_or_else(|| Ok(test_credentials(ChronoDuration::hours(1))))
    }

    async fn assume_queue_role(
        &self,
        _identity: &WorkerIdentity,
        _queue_id: &QueueId,
    ) -> Result<RoleCredentials, ServiceException> {
        let mut state = self.state.lock();
        state
            .queue_role_results
            .pop_front()
            .unwrap_or_else(|| Ok(test_credentials(ChronoDuration::hours(1))))
    }

    async fn batch_get_job_entities(
        &self,
        _identity: &WorkerIdentity,
        identifiers: &[EntityIdentifier],
    ) -> Result<BatchEntityResponse, ServiceException> {
        let mut state = self.state.lock();
        state.batch_requests.push(identifiers.to_vec());
        let mut response = BatchEntityResponse::default();
        for identifier in identifiers {
            let key = identifier.key();
            if state.payload_limited_once.remove(&key) {
                response.errors.push(payload_limited_error(identifier));
                continue;
            }
            if let Some(error) = state.entity_errors.get(&key) {
                response.errors.push(error.clone());
                continue;
            }
            if let Some(entity) = state.entities.get(&key) {
                response.entities.push(entity.clone());
            }
            // Absent entities are simply missing from the response, like a
            // payload-capped batch.
        }
        Ok(response)
    }

    async fn update_worker_schedule(
        &self,
        _identity: &WorkerIdentity,
        updated_actions: &HashMap<ActionId, UpdatedActionInfo>,
    ) -> Result<UpdateScheduleResponse, ServiceException> {
        let mut state = self.state.lock();
        state.reported_updates.push(updated_actions.clone());
        for (action_id, info) in updated_actions {
            if info.completed_status.is_some() {
                state.acknowledged_actions.insert(action_id.clone());
            }
        }
        let mut response = state
            .schedule_responses
            .pop_front()
            .unwrap_or_else(|| Ok(FakeDispatch::empty_schedule(15)));
        if let Ok(response) = &mut response {
            for assigned in response.assigned_sessions.values_mut() {
                assigned
                    .session_actions
                    .retain(|action| !state.acknowledged_actions.contains(action.action_id()));
            }
        }
        response
    }

    fn max_entity_batch_size(&self) -> usize {
        self.state.lock().max_batch
    }
}

fn payload_limited_error(identifier: &EntityIdentifier) -> EntityError {
    let code = "MaxPayloadSizeExceeded".to_string();
    let message = "response payload limit reached".to_string();
    match identifier {
        EntityIdentifier::JobDetails { job_id } => {
            EntityError::JobDetails { job_id: job_id.clone(), code, message }
        }
        EntityIdentifier::StepDetails { job_id, step_id } => EntityError::StepDetails {
            job_id: job_id.clone(),
            step_id: step_id.clone(),
            code,
            message,
        },
        EntityIdentifier::EnvironmentDetails { job_id, environment_id } => {
            EntityError::EnvironmentDetails {
                job_id: job_id.clone(),
                environment_id: environment_id.clone(),
                code,
                message,
            }
        }
        EntityIdentifier::JobAttachmentDetails { job_id } => {
            EntityError::JobAttachmentDetails { job_id: job_id.clone(), code, message }
        }
    }
}

/// What the fake runner was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    EnterEnvironment { action_id: Option<String>, environment_id: String, handle: String },
    ExitEnvironment { action_id: Option<String>, handle: String },
    RunTask { action_id: Option<String>, task_id: String },
    CancelCurrent { time_limit: Option<Duration> },
    Cleanup,
}

/// Scriptable action runner.
///
/// Outcomes are keyed by the `SESSION_ACTION_ID` environment value of the
/// invocation; unscripted invocations succeed immediately. A held action
/// emits RUNNING and then stays in flight until `cancel_current`.
pub struct FakeRunner {
    env_key: String,
    scripts: Mutex<HashMap<String, Vec<ActionStatus>>>,
    held: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<RunnerCall>>,
    current: Mutex<Option<mpsc::UnboundedSender<ActionStatus>>>,
    busy: watch::Sender<bool>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            env_key: "DEADLINE_SESSIONACTION_ID".to_string(),
            scripts: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            busy,
        }
    }

    /// Script the statuses emitted for an action id.
    pub fn script(&self, action_id: &str, statuses: Vec<ActionStatus>) {
        self.scripts.lock().insert(action_id.to_string(), statuses);
    }

    /// Keep the action in flight (RUNNING) until cancelled.
    pub fn hold(&self, action_id: &str) {
        self.held.lock().insert(action_id.to_string());
    }

    fn begin(
        &self,
        call: RunnerCall,
        action_id: Option<String>,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError> {
        self.calls.lock().push(call);
        let _ = self.busy.send(true);
        *self.current.lock() = Some(updates.clone());

        if action_id.as_deref().is_some_and(|id| self.held.lock().contains(id)) {
            let _ = updates.send(ActionStatus::running());
            return Ok(());
        }

        let statuses = action_id
            .and_then(|id| self.scripts.lock().remove(&id))
            .unwrap_or_else(|| vec![ActionStatus::success()]);
        let busy = self.busy.clone();
        tokio::spawn(async move {
            for status in statuses {
                let terminal = status.state.is_terminal();
                let _ = updates.send(status);
                if terminal {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            let _ = busy.send(false);
        });
        Ok(())
    }

    fn action_id(&self, context: &ActionContext) -> Option<String> {
        context.env.get(&self.env_key).cloned()
    }
}

#[async_trait]
impl ActionRunner for FakeRunner {
    fn enter_environment(
        &self,
        handle: EnvironmentHandle,
        environment: EnvironmentDetailsData,
        context: ActionContext,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError> {
        let action_id = self.action_id(&context);
        self.begin(
            RunnerCall::EnterEnvironment {
                action_id: action_id.clone(),
                environment_id: environment.environment_id.to_string(),
                handle: handle.to_string(),
            },
            action_id,
            updates,
        )
    }

    fn exit_environment(
        &self,
        handle: EnvironmentHandle,
        context: ActionContext,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError> {
        let action_id = self.action_id(&context);
        self.begin(
            RunnerCall::ExitEnvironment { action_id: action_id.clone(), handle: handle.to_string() },
            action_id,
            updates,
        )
    }

    fn run_task(
        &self,
        _step: StepDetailsData,
        task_id: TaskId,
        _parameters: HashMap<String, TaskParameter>,
        context: ActionContext,
        updates: mpsc::UnboundedSender<ActionStatus>,
    ) -> Result<(), RunnerError> {
        let action_id = self.action_id(&context);
        self.begin(
            RunnerCall::RunTask { action_id: action_id.clone(), task_id: task_id.to_string() },
            action_id,
            updates,
        )
    }

    async fn cancel_current(&self, time_limit: Option<Duration>) -> Result<(), RunnerError> {
        self.calls.lock().push(RunnerCall::CancelCurrent { time_limit });
        if let Some(updates) = self.current.lock().take() {
            let _ = updates.send(ActionStatus::canceled("Canceled"));
        }
        let _ = self.busy.send(false);
        Ok(())
    }

    async fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let mut receiver = self.busy.subscribe();
        let wait = async {
            loop {
                if !*receiver.borrow() {
                    return;
                }
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    async fn cleanup(&self) -> Result<(), RunnerError> {
        self.calls.lock().push(RunnerCall::Cleanup);
        Ok(())
    }
}

/// Scriptable attachment engine.
pub struct FakeAttachmentEngine {
    /// Progress reports fed through the callback before completing.
    pub progress_script: Mutex<Vec<ProgressReport>>,
    pub input_result: Mutex<Option<Result<InputSyncOutcome, AttachmentError>>>,
    pub output_result: Mutex<Option<Result<TransferSummary, AttachmentError>>>,
    pub input_calls: Mutex<Vec<InputSyncRequest>>,
    pub output_calls: Mutex<Vec<OutputSyncRequest>>,
    pub cleanups: Mutex<Vec<PathBuf>>,
}

impl Default for FakeAttachmentEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAttachmentEngine {
    pub fn new() -> Self {
        Self {
            progress_script: Mutex::new(Vec::new()),
            input_result: Mutex::new(None),
            output_result: Mutex::new(None),
            input_calls: Mutex::new(Vec::new()),
            output_calls: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AttachmentEngine for FakeAttachmentEngine {
    async fn sync_inputs(
        &self,
        request: InputSyncRequest,
        mut on_progress: ProgressCallback,
    ) -> Result<InputSyncOutcome, AttachmentError> {
        self.input_calls.lock().push(request);
        let reports: Vec<ProgressReport> = self.progress_script.lock().drain(..).collect();
        for report in reports {
            if !on_progress(report) {
                return Err(AttachmentError::Canceled);
            }
        }
        self.input_result.lock().take().unwrap_or_else(|| Ok(InputSyncOutcome::default()))
    }

    async fn sync_outputs(
        &self,
        request: OutputSyncRequest,
        _on_progress: ProgressCallback,
    ) -> Result<TransferSummary, AttachmentError> {
        self.output_calls.lock().push(request);
        self.output_result.lock().take().unwrap_or_else(|| Ok(TransferSummary::default()))
    }

    async fn cleanup_session(&self, session_dir: &Path) -> Result<(), AttachmentError> {
        self.cleanups.lock().push(session_dir.to_path_buf());
        Ok(())
    }
}

/// Records every batch put; can be scripted to fail a number of times.
#[derive(Default)]
pub struct FakeRemoteLog {
    pub batches: Mutex<Vec<Vec<LogEntry>>>,
    pub failures_remaining: Mutex<usize>,
}

impl FakeRemoteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock() = count;
    }

    pub fn total_events(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl RemoteLogClient for FakeRemoteLog {
    async fn put_log_events(
        &self,
        _group: &str,
        _stream: &str,
        events: &[LogEntry],
    ) -> Result<(), RemoteLogError> {
        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(RemoteLogError::new("scripted failure"));
            }
        }
        self.batches.lock().push(events.to_vec());
        Ok(())
    }
}

/// Session-collaborator factory handing out one shared fake runner and
/// attachment engine.
pub struct FakeBackends {
    pub runner: Arc<FakeRunner>,
    pub engine: Arc<FakeAttachmentEngine>,
    pub runner_specs: Mutex<Vec<String>>,
}

impl Default for FakeBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackends {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(FakeRunner::new()),
            engine: Arc::new(FakeAttachmentEngine::new()),
            runner_specs: Mutex::new(Vec::new()),
        }
    }
}

impl SessionBackends for FakeBackends {
    fn action_runner(&self, spec: &RunnerSpec) -> Arc<dyn ActionRunner> {
        self.runner_specs.lock().push(spec.session_id.to_string());
        Arc::clone(&self.runner) as Arc<dyn ActionRunner>
    }

    fn attachment_engine(
        &self,
        _queue_id: &QueueId,
        _credentials: &Arc<QueueCredentials>,
    ) -> Arc<dyn AttachmentEngine> {
        Arc::clone(&self.engine) as Arc<dyn AttachmentEngine>
    }
}

/// A valid `awslogs` log configuration for assignments.
pub fn awslogs_configuration() -> farmhand_api::models::LogConfiguration {
    farmhand_api::models::LogConfiguration {
        log_driver: "awslogs".into(),
        options: HashMap::from([
            ("logGroupName".to_string(), "/farms/farm-1/queues/queue-1".to_string()),
            ("logStreamName".to_string(), "session-1".to_string()),
        ]),
        parameters: HashMap::new(),
        error: None,
    }
}

/// An assignment for `queue_id`/`job_id` with a valid log configuration.
pub fn assignment(
    queue_id: &str,
    job_id: &str,
    actions: Vec<farmhand_api::SessionActionSpec>,
) -> farmhand_api::models::AssignedSession {
    farmhand_api::models::AssignedSession {
        queue_id: QueueId::new(queue_id),
        job_id: farmhand_core::JobId::new(job_id),
        session_actions: actions,
        log_configuration: Some(awslogs_configuration()),
    }
}

/// A schedule response assigning the given sessions.
pub fn schedule_response(
    sessions: Vec<(&str, farmhand_api::models::AssignedSession)>,
    interval: u64,
) -> UpdateScheduleResponse {
    UpdateScheduleResponse {
        assigned_sessions: sessions
            .into_iter()
            .map(|(id, assigned)| (farmhand_core::SessionId::new(id), assigned))
            .collect(),
        cancel_session_actions: HashMap::new(),
        update_interval_seconds: interval,
        desired_worker_status: None,
    }
}

/// Seed the minimal entity set for a job: its details (no queue role, no
/// attachments), environment `env-1`, and step `step-1`.
pub fn seed_job_entities(service: &FakeDispatch, job_id: &str) {
    use farmhand_api::{
        EnvironmentDetailsData, JobDetailsData, JobEntity, SchemaVersion, StepDetailsData,
    };
    let job = farmhand_core::JobId::new(job_id);
    service.insert_entity(JobEntity::JobDetails(JobDetailsData {
        job_id: job.clone(),
        schema_version: SchemaVersion::JobTemplate2023_09,
        log_group_name: "/farms/farm-1/queues/queue-1".into(),
        parameters: HashMap::new(),
        path_mapping_rules: vec![],
        queue_role_arn: None,
        job_attachment_settings: None,
        job_run_as_user: None,
    }));
    service.insert_entity(JobEntity::EnvironmentDetails(EnvironmentDetailsData {
        job_id: job.clone(),
        environment_id: farmhand_core::EnvironmentId::new("env-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
    }));
    service.insert_entity(JobEntity::StepDetails(StepDetailsData {
        job_id: job,
        step_id: farmhand_core::StepId::new("step-1"),
        schema_version: SchemaVersion::JobTemplate2023_09,
        template: serde_json::json!({}),
        dependencies: vec![],
    }));
}

/// An attachment engine whose sync_inputs reports a fixed transfer rate on
/// every poll until cancelled, for low-transfer-rate tests.
pub struct StallingAttachmentEngine {
    pub transfer_rate: f64,
    pub input_calls: Mutex<usize>,
}

#[async_trait]
impl AttachmentEngine for StallingAttachmentEngine {
    async fn sync_inputs(
        &self,
        _request: InputSyncRequest,
        mut on_progress: ProgressCallback,
    ) -> Result<InputSyncOutcome, AttachmentError> {
        *self.input_calls.lock() += 1;
        loop {
            let keep_going = on_progress(ProgressReport {
                progress: 1.0,
                transfer_rate: self.transfer_rate,
                message: "downloading".into(),
            });
            if !keep_going {
                return Err(AttachmentError::Canceled);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn sync_outputs(
        &self,
        _request: OutputSyncRequest,
        _on_progress: ProgressCallback,
    ) -> Result<TransferSummary, AttachmentError> {
        Ok(TransferSummary::default())
    }

    async fn cleanup_session(&self, _session_dir: &Path) -> Result<(), AttachmentError> {
        Ok(())
    }
}
