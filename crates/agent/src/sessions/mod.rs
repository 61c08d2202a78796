// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session execution.
//!
//! A [`Session`] runs one assignment to completion: it dequeues actions one
//! at a time, hands them to the action runner (or the attachment engine for
//! input sync), translates runner callbacks into pending updates, and keeps
//! the environment stack so entered environments always unwind in LIFO
//! order, drain included.
//!
//! Lock order is load-bearing throughout this module: the scheduler-owned
//! update lock is always taken before the session state lock. Every method
//! that needs both either takes the update guard as a parameter or acquires
//! the two in that order itself.

pub mod actions;
pub mod entities;
pub mod errors;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use farmhand_api::models::{CompletedStatus, PathMapping, PosixUser, WorkerIdentity};
use farmhand_api::{JobAttachmentDetailsData, JobDetailsData, SessionActionSpec, StepDetailsData};
use farmhand_core::{ActionId, Clock, EnvironmentId, JobId, QueueId, SessionId, TaskId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attachments::{AttachmentEngine, AttachmentError, InputSyncRequest, OutputSyncRequest, ProgressCallback};
use crate::log_sync::SessionLogger;
use crate::runner::{ActionContext, ActionRunner, ActionState, ActionStatus, EnvironmentHandle};
use crate::scheduler::queue::{CancelOutcome, SessionActionQueue};
use crate::scheduler::updates::{ActionUpdates, PendingUpdates, SessionActionStatus};
use crate::sessions::actions::{ActiveEnvironment, CurrentAction, SessionAction, TaskInfo};

/// Transfer rates below this many bytes per second count as stalled.
const LOW_TRANSFER_RATE_THRESHOLD: f64 = 10_000.0;
/// Consecutive stalled progress reports (about one per second) before the
/// input sync is cancelled and failed.
const LOW_TRANSFER_COUNT_THRESHOLD: u32 = 300;

const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How an externally stopped session reports its in-flight action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCurrentActionResult {
    Interrupted,
    Failed,
}

#[derive(Debug, Clone)]
struct StopSpec {
    result: CompletedStatus,
    grace: Option<Duration>,
    fail_message: Option<String>,
}

impl Default for StopSpec {
    fn default() -> Self {
        Self { result: CompletedStatus::Failed, grace: None, fail_message: None }
    }
}

struct SessionState {
    current_action: Option<CurrentAction>,
    /// Set while a stop-initiated status for the current action has already
    /// been reported; suppresses the action's own late runner callbacks.
    interrupted: bool,
    active_envs: Vec<ActiveEnvironment>,
    path_mappings: Vec<PathMapping>,
    attachment_details: Option<JobAttachmentDetailsData>,
    env_counter: u64,
}

/// Construction-time parameters for a session.
pub struct SessionConfig {
    pub id: SessionId,
    pub queue_id: QueueId,
    pub job_id: JobId,
    pub job_details: JobDetailsData,
    pub os_user: Option<PosixUser>,
    pub working_dir: PathBuf,
    /// Extra subprocess environment (e.g. AWS_PROFILE for queue credentials).
    pub extra_env: HashMap<String, String>,
    pub logger: Option<SessionLogger>,
}

pub struct Session<C: Clock> {
    id: SessionId,
    queue_id: QueueId,
    base_env: HashMap<String, String>,
    queue: SessionActionQueue,
    entities: Arc<entities::JobEntityCache>,
    updates: Arc<ActionUpdates>,
    runner: Arc<dyn ActionRunner>,
    attachments: Option<Arc<dyn AttachmentEngine>>,
    job_details: JobDetailsData,
    os_user: Option<PosixUser>,
    working_dir: PathBuf,
    logger: Option<SessionLogger>,
    clock: C,
    state: Mutex<SessionState>,
    stop_spec: Mutex<StopSpec>,
    stop_token: CancellationToken,
    stopped_running: watch::Sender<bool>,
    status_tx: mpsc::UnboundedSender<ActionStatus>,
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<ActionStatus>>>,
}

impl<C: Clock + 'static> Session<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        identity: &WorkerIdentity,
        queue: SessionActionQueue,
        entities: Arc<entities::JobEntityCache>,
        updates: Arc<ActionUpdates>,
        runner: Arc<dyn ActionRunner>,
        attachments: Option<Arc<dyn AttachmentEngine>>,
        clock: C,
    ) -> Self {
        let mut base_env = config.extra_env.clone();
        base_env.insert("DEADLINE_SESSION_ID".into(), config.id.to_string());
        base_env.insert("DEADLINE_FARM_ID".into(), identity.farm_id.to_string());
        base_env.insert("DEADLINE_QUEUE_ID".into(), config.queue_id.to_string());
        base_env.insert("DEADLINE_JOB_ID".into(), config.job_id.to_string());
        base_env.insert("DEADLINE_FLEET_ID".into(), identity.fleet_id.to_string());
        base_env.insert("DEADLINE_WORKER_ID".into(), identity.worker_id.to_string());

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (stopped_running, _) = watch::channel(true);
        let path_mappings = config.job_details.path_mapping_rules.clone();

        Self {
            id: config.id,
            queue_id: config.queue_id,
            base_env,
            queue,
            entities,
            updates,
            runner,
            attachments,
            job_details: config.job_details,
            os_user: config.os_user,
            working_dir: config.working_dir,
            logger: config.logger,
            clock,
            state: Mutex::new(SessionState {
                current_action: None,
                interrupted: false,
                active_envs: Vec::new(),
                path_mappings,
                attachment_details: None,
                env_counter: 0,
            }),
            stop_spec: Mutex::new(StopSpec::default()),
            stop_token: CancellationToken::new(),
            stopped_running,
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// True when there is no running action and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.state.lock().current_action.is_none() && self.queue.is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// The environment ids currently active, outermost first.
    pub fn active_environments(&self) -> Vec<EnvironmentId> {
        self.state.lock().active_envs.iter().map(|env| env.environment_id.clone()).collect()
    }

    /// Ask the session to stop. Idempotent; the run loop performs cleanup.
    pub fn stop(
        &self,
        result: StopCurrentActionResult,
        grace: Option<Duration>,
        fail_message: Option<String>,
    ) {
        {
            let mut stop = self.stop_spec.lock();
            stop.result = match result {
                StopCurrentActionResult::Interrupted => CompletedStatus::Interrupted,
                StopCurrentActionResult::Failed => CompletedStatus::Failed,
            };
            stop.grace = grace;
            stop.fail_message = fail_message;
        }
        self.stop_token.cancel();
    }

    /// Wait until the run loop (including cleanup) has fully exited.
    pub async fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let mut receiver = self.stopped_running.subscribe();
        let wait = async {
            loop {
                if *receiver.borrow() {
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

    /// Replace the queued actions with the assignment's list, skipping the
    /// currently running action. Cancels must be delivered (via
    /// [`Session::cancel_actions`]) before calling this.
    pub fn replace_assigned_actions(&self, actions: &[SessionActionSpec]) {
        let state = self.state.lock();
        let running = state.current_action.as_ref().map(|current| current.id.clone());
        let filtered: Vec<SessionActionSpec> = actions
            .iter()
            .filter(|spec| running.as_ref() != Some(spec.action_id()))
            .cloned()
            .collect();
        self.queue.replace(&filtered);
    }

    /// Cancel the listed actions. Only the running action is actively
    /// cancelled; queued ones are reported NEVER_ATTEMPTED by the failure
    /// cascade when the running action completes cancelled.
    ///
    /// The caller holds the update lock, which this method needs only to
    /// enforce the update-before-state acquisition order.
    pub fn cancel_actions(self: &Arc<Self>, _pending: &mut PendingUpdates, action_ids: &[ActionId]) {
        let state = self.state.lock();
        let Some(current) = &state.current_action else {
            return;
        };
        if !action_ids.contains(&current.id) {
            return;
        }
        info!(session_id = %self.id, action_id = %current.id, action = %current.human, "canceling action");
        if let Some(cancel) = &current.sync_cancel {
            cancel.cancel();
        } else {
            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                if let Err(error) = runner.cancel_current(None).await {
                    warn!(%error, "failed to cancel running action");
                }
            });
        }
    }

    fn action_context(&self, action_id: &ActionId, task_id: Option<&TaskId>) -> ActionContext {
        let mut env = self.base_env.clone();
        env.insert("DEADLINE_SESSIONACTION_ID".into(), action_id.to_string());
        if let Some(task_id) = task_id {
            env.insert("DEADLINE_TASK_ID".into(), task_id.to_string());
        }
        ActionContext { env }
    }

    fn cleanup_context(&self) -> ActionContext {
        ActionContext { env: self.base_env.clone() }
    }

    fn log_line(&self, message: &str) {
        if let Some(logger) = &self.logger {
            logger.log(message);
        }
    }

    async fn warm_entity_cache(&self) {
        let identifiers = self.queue.list_identifiers();
        if identifiers.is_empty() {
            return;
        }
        info!(session_id = %self.id, "warming job entity cache");
        match self.entities.cache_entities(&identifiers).await {
            Ok(()) => info!(session_id = %self.id, "fully warmed job entity cache"),
            Err(error) => {
                warn!(session_id = %self.id, %error, "did not fully warm job entity cache, continuing")
            }
        }
    }

    /// The session run loop. Returns once stopped and cleaned up.
    pub async fn run(self: Arc<Self>) {
        let Some(mut status_rx) = self.status_rx.lock().take() else {
            warn!(session_id = %self.id, "session run loop started twice");
            return;
        };
        let _ = self.stopped_running.send(false);

        self.warm_entity_cache().await;
        info!(session_id = %self.id, "session started");
        self.log_line("session started");

        while !self.stop_token.is_cancelled() {
            let idle = self.state.lock().current_action.is_none();
            if idle {
                self.start_next_action().await;
            }
            tokio::select! {
                _ = self.stop_token.cancelled() => break,
                status = status_rx.recv() => {
                    if let Some(status) = status {
                        self.handle_status(status);
                    }
                }
                _ = tokio::time::sleep(RUN_POLL_INTERVAL) => {}
            }
        }

        self.cleanup(&mut status_rx).await;
        let _ = self.stopped_running.send(true);
        info!(session_id = %self.id, "session complete");
    }

    async fn start_next_action(self: &Arc<Self>) {
        let action = match self.queue.dequeue().await {
            Ok(Some(action)) => action,
            Ok(None) => return,
            Err(error) => {
                let now = self.clock.now_utc();
                let action_id = error.action_id().clone();
                warn!(session_id = %self.id, %action_id, %error, "failed to prepare action");
                let mut pending = self.updates.lock();
                pending.post(SessionActionStatus::terminal(
                    action_id.clone(),
                    CompletedStatus::Failed,
                    Some(error.to_string()),
                    Some(now),
                    Some(now),
                ));
                self.queue.cancel_all(
                    &mut pending,
                    CancelOutcome::Failed,
                    Some(&format!("Error starting prior action {action_id}")),
                    true,
                    now,
                );
                drop(pending);
                self.updates.wake();
                return;
            }
        };

        let now = self.clock.now_utc();
        let action_id = action.id().clone();
        let human = action.human_readable();
        info!(session_id = %self.id, %action_id, action = %human, "starting action");

        let current = CurrentAction {
            id: action_id.clone(),
            human: human.clone(),
            start_time: now,
            task: match &action {
                SessionAction::RunTask { step, task_id, .. } => {
                    Some(TaskInfo { step_id: step.step_id.clone(), task_id: task_id.clone() })
                }
                _ => None,
            },
            sync_cancel: match &action {
                SessionAction::SyncInput { cancel, .. } => Some(cancel.clone()),
                _ => None,
            },
        };
        {
            let _pending = self.updates.lock();
            self.state.lock().current_action = Some(current);
        }

        let start_result: Result<(), String> = match action {
            SessionAction::EnterEnv { id, environment } => {
                let handle = {
                    let mut state = self.state.lock();
                    state.env_counter += 1;
                    EnvironmentHandle(format!("{}:{}", self.id, state.env_counter))
                };
                let context = self.action_context(&id, None);
                match self.runner.enter_environment(
                    handle.clone(),
                    environment.clone(),
                    context,
                    self.status_tx.clone(),
                ) {
                    Ok(()) => {
                        self.state.lock().active_envs.push(ActiveEnvironment {
                            handle,
                            environment_id: environment.environment_id,
                        });
                        Ok(())
                    }
                    Err(error) => Err(error.to_string()),
                }
            }
            SessionAction::ExitEnv { id, environment_id } => {
                let top = self.state.lock().active_envs.last().cloned();
                match top {
                    Some(active) if active.environment_id == environment_id => {
                        self.state.lock().active_envs.pop();
                        let context = self.action_context(&id, None);
                        self.runner
                            .exit_environment(active.handle, context, self.status_tx.clone())
                            .map_err(|error| error.to_string())
                    }
                    _ => Err(format!(
                        "environment {environment_id} is not the innermost active environment"
                    )),
                }
            }
            SessionAction::RunTask { id, step, task_id, parameters } => {
                let context = self.action_context(&id, Some(&task_id));
                self.runner
                    .run_task(step, task_id, parameters, context, self.status_tx.clone())
                    .map_err(|error| error.to_string())
            }
            SessionAction::SyncInput { id, attachments, step, cancel } => {
                self.start_input_sync(id, attachments, step, cancel);
                Ok(())
            }
        };

        if let Err(message) = start_result {
            warn!(session_id = %self.id, %action_id, action = %human, %message, "error starting action");
            let mut pending = self.updates.lock();
            let mut state = self.state.lock();
            pending.post(SessionActionStatus::terminal(
                action_id.clone(),
                CompletedStatus::Failed,
                Some(message),
                Some(now),
                Some(now),
            ));
            state.current_action = None;
            self.queue.cancel_all(
                &mut pending,
                CancelOutcome::Failed,
                Some(&format!("Error starting prior action {action_id}")),
                true,
                now,
            );
            drop(state);
            drop(pending);
            self.updates.wake();
        }
    }

    /// Translate one runner callback. Suppressed entirely while the session
    /// is interrupted: the stop path has already reported the action.
    fn handle_status(self: &Arc<Self>, status: ActionStatus) {
        let now = self.clock.now_utc();
        let mut pending = self.updates.lock();
        let mut state = self.state.lock();

        if state.interrupted {
            if status.state.is_terminal() {
                state.current_action = None;
                state.interrupted = false;
            }
            return;
        }

        let Some(current) = state.current_action.clone() else {
            // Only reachable while stopping; the callback raced the stop.
            return;
        };

        if status.state == ActionState::Success
            && current.task.is_some()
            && self.attachments.is_some()
        {
            // Output sync is bundled into the task-run action: the action
            // stays current until the upload finishes, and both must succeed
            // for SUCCEEDED.
            drop(state);
            drop(pending);
            self.spawn_output_sync(status, current);
            return;
        }

        self.finish_action(&mut pending, &mut state, status, &current, now);
    }

    fn finish_action(
        &self,
        pending: &mut PendingUpdates,
        state: &mut SessionState,
        status: ActionStatus,
        current: &CurrentAction,
        now: DateTime<Utc>,
    ) {
        let mut status = status;
        if status.state == ActionState::TimedOut && status.fail_message.is_none() {
            status.fail_message = Some(format!("Action {} timed out", current.human));
        }

        let unsuccessful = matches!(
            status.state,
            ActionState::Failed | ActionState::Canceled | ActionState::TimedOut
        );
        if unsuccessful {
            let fail_message = status
                .fail_message
                .clone()
                .unwrap_or_else(|| format!("Action {} failed", current.human));
            self.queue.cancel_all(
                pending,
                CancelOutcome::NeverAttempted,
                Some(&fail_message),
                true,
                now,
            );
        }

        let terminal = status.state.is_terminal();
        if terminal {
            // Cleared before posting so the scheduler can observe an idle
            // session when it handles the wakeup.
            state.current_action = None;
        }

        let completed_status = status.state.completed_status();
        pending.post(SessionActionStatus {
            id: current.id.clone(),
            status: Some(status),
            start_time: Some(current.start_time),
            end_time: terminal.then_some(now),
            update_time: (!terminal).then_some(now),
            completed_status,
        });

        if let Some(completed) = completed_status {
            info!(
                session_id = %self.id,
                action_id = %current.id,
                action = %current.human,
                status = ?completed,
                "action completed"
            );
            self.updates.wake();
        }
    }

    fn start_input_sync(
        self: &Arc<Self>,
        id: ActionId,
        details: Option<JobAttachmentDetailsData>,
        step: Option<StepDetailsData>,
        cancel: CancellationToken,
    ) {
        let _ = self.status_tx.send(ActionStatus::running());

        let Some(engine) = self.attachments.clone() else {
            // Queue without attachments: nothing to transfer.
            let _ = self.status_tx.send(ActionStatus::success());
            return;
        };
        let Some(settings) = self.job_details.job_attachment_settings.clone() else {
            let _ = self.status_tx.send(ActionStatus::failed(
                "Job attachment settings were not contained in the job details entity",
            ));
            return;
        };

        let stored = {
            let mut state = self.state.lock();
            if let Some(details) = details {
                state.attachment_details = Some(details);
            }
            state.attachment_details.clone()
        };
        let Some(stored) = stored else {
            let _ = self.status_tx.send(ActionStatus::failed(
                "Job attachments must be synchronized before downloading step dependencies",
            ));
            return;
        };

        let step_dependencies: Vec<_> =
            step.as_ref().map(|step| step.dependencies.clone()).unwrap_or_default();
        let banner = if step.is_some() {
            "Job Attachments Download for Step"
        } else {
            "Job Attachments Download for Job"
        };
        self.log_line(banner);

        let request = InputSyncRequest {
            settings,
            manifests: if step_dependencies.is_empty() {
                stored.attachments.manifests.clone()
            } else {
                Vec::new()
            },
            file_system: stored.attachments.file_system.clone(),
            step_dependencies,
            session_dir: self.working_dir.clone(),
            path_mappings: self.path_mapping_pairs(),
            os_user: self.os_user.clone(),
            env: self.base_env.clone(),
        };

        let session = Arc::clone(self);
        let status_tx = self.status_tx.clone();
        tokio::spawn(async move {
            let low_transfer_failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
            let callback = {
                let status_tx = status_tx.clone();
                let cancel = cancel.clone();
                let low_transfer_failure = Arc::clone(&low_transfer_failure);
                let mut low_count: u32 = 0;
                let callback: ProgressCallback = Box::new(move |report| {
                    let _ = status_tx.send(ActionStatus {
                        state: ActionState::Running,
                        progress: Some(report.progress),
                        status_message: Some(report.message.clone()),
                        ..ActionStatus::default()
                    });
                    if report.transfer_rate < LOW_TRANSFER_RATE_THRESHOLD {
                        low_count += 1;
                    } else {
                        low_count = 0;
                    }
                    if low_count >= LOW_TRANSFER_COUNT_THRESHOLD {
                        *low_transfer_failure.lock() = Some(low_transfer_message());
                        return false;
                    }
                    !cancel.is_cancelled()
                });
                callback
            };

            let result = engine.sync_inputs(request, callback).await;
            let status = match result {
                Ok(outcome) => {
                    info!(
                        session_id = %session.id,
                        queue_id = %session.queue_id,
                        files = outcome.summary.files_transferred,
                        bytes = outcome.summary.bytes_transferred,
                        "input attachment sync complete"
                    );
                    session.append_path_mappings(outcome.path_mappings);
                    ActionStatus::success()
                }
                Err(AttachmentError::Canceled) => {
                    if let Some(message) = low_transfer_failure.lock().take() {
                        warn!(
                            session_id = %session.id,
                            queue_id = %session.queue_id,
                            reason = %message,
                            "input attachment sync failed due to insufficient download speed"
                        );
                        ActionStatus::failed(message)
                    } else {
                        ActionStatus::canceled("Canceled")
                    }
                }
                Err(error) => ActionStatus::failed(error.to_string()),
            };
            let _ = status_tx.send(status);
        });
    }

    fn path_mapping_pairs(&self) -> HashMap<String, String> {
        self.state
            .lock()
            .path_mappings
            .iter()
            .map(|rule| (rule.source_path.clone(), rule.destination_path.clone()))
            .collect()
    }

    /// Append rules from an input sync and keep the rule list sorted by
    /// descending source component count so the longest prefix wins lookups.
    fn append_path_mappings(&self, mut rules: Vec<PathMapping>) {
        if rules.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.path_mappings.append(&mut rules);
        state
            .path_mappings
            .sort_by_key(|rule| std::cmp::Reverse(rule.source_component_count()));
    }

    /// The rules currently in effect, longest source prefix first.
    pub fn path_mappings(&self) -> Vec<PathMapping> {
        self.state.lock().path_mappings.clone()
    }

    fn spawn_output_sync(self: &Arc<Self>, status: ActionStatus, current: CurrentAction) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let result = session.sync_outputs_for(&current).await;
            let final_status = match result {
                Ok(()) => status,
                Err(message) => ActionStatus::failed(format!(
                    "Failed to sync job output attachments for {}: {message}",
                    current.human
                )),
            };
            let now = session.clock.now_utc();
            let mut pending = session.updates.lock();
            let mut state = session.state.lock();
            if state.interrupted {
                if final_status.state.is_terminal() {
                    state.current_action = None;
                    state.interrupted = false;
                }
                return;
            }
            session.finish_action(&mut pending, &mut state, final_status, &current, now);
        });
    }

    async fn sync_outputs_for(&self, current: &CurrentAction) -> Result<(), String> {
        let Some(engine) = &self.attachments else {
            return Ok(());
        };
        let Some(settings) = &self.job_details.job_attachment_settings else {
            return Ok(());
        };
        let Some(task) = &current.task else {
            return Ok(());
        };
        let Some(details) = self.state.lock().attachment_details.clone() else {
            return Ok(());
        };

        self.log_line("Job Attachments Upload of Outputs");
        let request = OutputSyncRequest {
            settings: settings.clone(),
            manifests: details.attachments.manifests.clone(),
            file_system: details.attachments.file_system.clone(),
            step_id: task.step_id.clone(),
            task_id: task.task_id.clone(),
            action_id: current.id.clone(),
            started_at: current.start_time,
            session_dir: self.working_dir.clone(),
            path_mappings: self.path_mapping_pairs(),
        };
        let summary = engine
            .sync_outputs(request, Box::new(|_| true))
            .await
            .map_err(|error| error.to_string())?;
        info!(
            session_id = %self.id,
            queue_id = %self.queue_id,
            files = summary.files_transferred,
            bytes = summary.bytes_transferred,
            "output attachment sync complete"
        );
        Ok(())
    }

    /// Stop-time cleanup: report and cancel the in-flight action, drop queued
    /// work, unwind environments innermost-first, and clean up the
    /// attachment working data. Bounded by the stop grace time; environments
    /// left over after the grace elapses stay as they are.
    async fn cleanup(self: &Arc<Self>, status_rx: &mut mpsc::UnboundedReceiver<ActionStatus>) {
        let stop = self.stop_spec.lock().clone();
        let deadline = stop.grace.map(|grace| Instant::now() + grace);
        let now = self.clock.now_utc();

        let current = {
            let mut pending = self.updates.lock();
            let mut state = self.state.lock();
            let current = state.current_action.clone();
            if let Some(current) = &current {
                state.interrupted = true;
                pending.post(SessionActionStatus {
                    id: current.id.clone(),
                    status: Some(ActionStatus {
                        state: ActionState::Canceled,
                        fail_message: stop.fail_message.clone(),
                        ..ActionStatus::default()
                    }),
                    start_time: Some(current.start_time),
                    end_time: Some(now),
                    update_time: None,
                    completed_status: Some(stop.result),
                });
            }
            self.queue.cancel_all(
                &mut pending,
                CancelOutcome::NeverAttempted,
                stop.fail_message.as_deref(),
                true,
                now,
            );
            current
        };
        self.updates.wake();

        if let Some(current) = current {
            if let Some(cancel) = &current.sync_cancel {
                cancel.cancel();
            } else if let Err(error) = self.runner.cancel_current(stop.grace).await {
                warn!(session_id = %self.id, %error, "failed to cancel running action");
            }
            if !self.runner.wait_idle(remaining(deadline)).await {
                warn!(session_id = %self.id, "canceling the running action timed out");
            }
            // Drain any late callbacks so the interrupted flag resets.
            while let Ok(status) = status_rx.try_recv() {
                self.handle_status(status);
            }
        }

        let leftover: Vec<ActiveEnvironment> = {
            let mut state = self.state.lock();
            state.active_envs.drain(..).collect()
        };
        for env in leftover.into_iter().rev() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    session_id = %self.id,
                    environment_id = %env.environment_id,
                    "ran out of grace time before exiting environment"
                );
                break;
            }
            let (cleanup_tx, _cleanup_rx) = mpsc::unbounded_channel();
            if let Err(error) =
                self.runner.exit_environment(env.handle.clone(), self.cleanup_context(), cleanup_tx)
            {
                warn!(session_id = %self.id, environment_id = %env.environment_id, %error, "failed to exit environment");
                continue;
            }
            if self.runner.wait_idle(remaining(deadline)).await {
                info!(session_id = %self.id, environment_id = %env.environment_id, "exited environment");
            } else {
                warn!(session_id = %self.id, environment_id = %env.environment_id, "environment exit timed out");
                if let Err(error) = self.runner.cancel_current(None).await {
                    warn!(session_id = %self.id, %error, "failed to cancel environment exit");
                }
                break;
            }
        }

        if let Some(engine) = &self.attachments {
            if let Err(error) = engine.cleanup_session(&self.working_dir).await {
                warn!(session_id = %self.id, %error, "attachment cleanup failed");
            }
        }
        if let Err(error) = self.runner.cleanup().await {
            warn!(session_id = %self.id, %error, "runner cleanup failed");
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

fn low_transfer_message() -> String {
    format!(
        "Input syncing failed due to successive low transfer rates \
         (< {} KB/s). The transfer rate was below the threshold for the last {}.",
        LOW_TRANSFER_RATE_THRESHOLD / 1000.0,
        seconds_to_minutes_str(LOW_TRANSFER_COUNT_THRESHOLD)
    )
}

/// Render a second count as "N minutes M seconds", dropping zero parts.
fn seconds_to_minutes_str(seconds: u32) -> String {
    let minutes = seconds / 60;
    let seconds = seconds % 60;
    let unit = |count: u32, name: &str| -> Option<String> {
        match count {
            0 => None,
            1 => Some(format!("1 {name}")),
            _ => Some(format!("{count} {name}s")),
        }
    };
    let parts: Vec<String> =
        [unit(minutes, "minute"), unit(seconds, "second")].into_iter().flatten().collect();
    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
