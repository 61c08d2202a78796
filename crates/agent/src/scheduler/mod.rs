// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The worker scheduler.
//!
//! Heartbeats the dispatch service with accumulated action updates and
//! reconciles the local session set against the response: sessions that
//! disappeared are torn down, new assignments become sessions with their own
//! run tasks, and existing sessions receive cancels and action-list updates.
//! A drain (worker-initiated or service-requested) transitions the worker to
//! STOPPING, interrupts every session within the grace time, and flushes the
//! resulting updates with one final heartbeat.

pub mod queue;
pub mod updates;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use farmhand_api::models::{
    AssignedSession, DesiredWorkerStatus, PosixUser, RunAs, UpdateScheduleResponse, WorkerIdentity,
    WorkerStatus,
};
use farmhand_api::{update_worker, update_worker_schedule, DispatchService, RequestError};
use farmhand_core::{ActionId, Clock, Interrupt, QueueId, SessionId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attachments::AttachmentEngine;
use crate::credentials::files::home_for_user;
use crate::credentials::refresher::FailureCallback;
use crate::credentials::{
    CredentialsError, CredentialsRefresher, QueueCredentials, RefreshFailure, RefresherConfig,
};
use crate::credentials::refresher::RefresherGuard;
use crate::log_sync::{LogStreamHandle, RemoteLogClient, SessionLogConfig, SessionLogger};
use crate::runner::ActionRunner;
use crate::scheduler::queue::SessionActionQueue;
use crate::scheduler::updates::{ActionUpdates, SessionActionStatus};
use crate::sessions::entities::JobEntityCache;
use crate::sessions::{Session, SessionConfig, StopCurrentActionResult};

const INITIAL_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Ceiling for the STOPPING transition during a drain.
const STOPPING_TRANSITION_CAP: Duration = Duration::from_secs(5);
/// Time reserved at the end of a drain for the final status flush.
const FINAL_FLUSH_RESERVE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The service set `desiredWorkerStatus = STOPPED`.
    #[error("the service requested a worker shutdown")]
    ServiceShutdown,
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// What a session's runner needs to know at construction.
pub struct RunnerSpec {
    pub session_id: SessionId,
    pub working_dir: PathBuf,
    pub os_user: Option<PosixUser>,
    pub logger: Option<SessionLogger>,
}

/// Factory for the external per-session collaborators.
pub trait SessionBackends: Send + Sync {
    fn action_runner(&self, spec: &RunnerSpec) -> Arc<dyn ActionRunner>;

    fn attachment_engine(
        &self,
        queue_id: &QueueId,
        credentials: &Arc<QueueCredentials>,
    ) -> Arc<dyn AttachmentEngine>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Root for worker state: credential caches, queue credential dirs.
    pub persistence_dir: PathBuf,
    /// Base directory for local session logs
    /// (`<dir>/<queue_id>/<session_id>.log`); `None` disables local logs.
    pub worker_logs_dir: Option<PathBuf>,
    /// Base directory for session working directories.
    pub sessions_dir: PathBuf,
}

struct SchedulerSession<C: Clock> {
    session: Arc<Session<C>>,
    join: JoinHandle<()>,
    log_config: Arc<SessionLogConfig>,
    log_stream: Option<LogStreamHandle>,
    queue_id: QueueId,
}

struct QueueCredentialsEntry {
    credentials: Arc<QueueCredentials>,
    // Held so the refresher runs exactly as long as the entry lives.
    _guard: RefresherGuard<QueueCredentials>,
    _refresher: CredentialsRefresher<QueueCredentials>,
}

enum QueueCredentialsFailure {
    /// Terminal for the session; fail its actions.
    Fatal(String),
    /// The session runs without queue credentials.
    Unavailable,
}

#[derive(Debug, Clone, Default)]
struct ShutdownSpec {
    grace: Option<Duration>,
    fail_message: Option<String>,
}

pub struct WorkerScheduler<C: Clock> {
    service: Arc<dyn DispatchService>,
    identity: WorkerIdentity,
    backends: Arc<dyn SessionBackends>,
    log_client: Option<Arc<dyn RemoteLogClient>>,
    updates: Arc<ActionUpdates>,
    sessions: Arc<Mutex<HashMap<SessionId, SchedulerSession<C>>>>,
    /// Keyed by `<queue_id>:<role_arn>`.
    queue_credentials: AsyncMutex<HashMap<String, QueueCredentialsEntry>>,
    config: SchedulerConfig,
    clock: C,
    shutdown: Interrupt,
    shutdown_spec: Mutex<ShutdownSpec>,
}

impl<C: Clock + 'static> WorkerScheduler<C> {
    pub fn new(
        service: Arc<dyn DispatchService>,
        identity: WorkerIdentity,
        backends: Arc<dyn SessionBackends>,
        log_client: Option<Arc<dyn RemoteLogClient>>,
        config: SchedulerConfig,
        clock: C,
    ) -> Self {
        Self {
            service,
            identity,
            backends,
            log_client,
            updates: Arc::new(ActionUpdates::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            queue_credentials: AsyncMutex::new(HashMap::new()),
            config,
            clock,
            shutdown: Interrupt::new(),
            shutdown_spec: Mutex::new(ShutdownSpec::default()),
        }
    }

    /// The pending-update map shared with sessions.
    pub fn updates(&self) -> Arc<ActionUpdates> {
        Arc::clone(&self.updates)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Begin a drain: `run` wakes immediately, interrupts all work within
    /// `grace`, and returns once the drain completes.
    pub fn shutdown(&self, grace: Option<Duration>, fail_message: Option<String>) {
        {
            let mut spec = self.shutdown_spec.lock();
            spec.grace = grace;
            spec.fail_message = fail_message;
        }
        self.shutdown.set();
        self.updates.wake();
    }

    /// The scheduler loop. Returns `Ok(())` after a graceful worker-initiated
    /// drain, `Err(ServiceShutdown)` when the service requested the stop, and
    /// propagates fatal heartbeat errors; the drain runs in every case.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        let mut interval = INITIAL_POLL_INTERVAL;
        let result = loop {
            if self.shutdown.is_set() {
                break Ok(());
            }
            match self.sync(true).await {
                Ok(next_interval) => interval = next_interval,
                // The shutdown interrupt fired mid-heartbeat; drain naturally.
                Err(SchedulerError::Request(RequestError::Interrupted)) => continue,
                Err(error) => break Err(error),
            }
            tokio::select! {
                _ = self.updates.notified() => {}
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        };
        self.drain().await;
        result
    }

    async fn sync(&self, interruptable: bool) -> Result<Duration, SchedulerError> {
        debug!("synchronizing with the service");
        let (wire_updates, transaction) = self.updates.snapshot();
        if !wire_updates.is_empty() {
            info!(count = wire_updates.len(), "reporting action updates");
        }
        let interrupt = interruptable.then(|| self.shutdown.clone());
        let response = update_worker_schedule(
            &*self.service,
            &self.identity,
            &wire_updates,
            interrupt.as_ref(),
        )
        .await?;
        self.updates.commit(&transaction);

        self.reconcile(&response).await;

        if response.desired_worker_status == Some(DesiredWorkerStatus::Stopped) {
            warn!("service requested a worker shutdown");
            return Err(SchedulerError::ServiceShutdown);
        }
        Ok(Duration::from_secs(response.update_interval_seconds.max(1)))
    }

    async fn reconcile(&self, response: &UpdateScheduleResponse) {
        self.remove_finished_sessions(&response.assigned_sessions).await;
        self.release_unused_queue_credentials(&response.assigned_sessions).await;
        let created = self.create_new_sessions(&response.assigned_sessions).await;
        self.update_existing_sessions(
            &response.assigned_sessions,
            &response.cancel_session_actions,
            &created,
        );
        self.update_session_logging(&response.assigned_sessions, &created);
    }

    /// Tear down sessions the service no longer assigns. The service only
    /// removes a session once it has acknowledged all of its action updates,
    /// so cleanup here is expected to be quick; waiting avoids racing a
    /// still-running cleanup against the slot being reused.
    async fn remove_finished_sessions(&self, assigned: &HashMap<SessionId, AssignedSession>) {
        let removed: Vec<(SessionId, SchedulerSession<C>)> = {
            let mut sessions = self.sessions.lock();
            let gone: Vec<SessionId> = sessions
                .keys()
                .filter(|session_id| !assigned.contains_key(*session_id))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|session_id| {
                    sessions.remove(&session_id).map(|entry| (session_id, entry))
                })
                .collect()
        };
        for (session_id, entry) in removed {
            info!(%session_id, queue_id = %entry.queue_id, "removing session no longer assigned");
            entry.session.stop(StopCurrentActionResult::Failed, Some(Duration::ZERO), None);
            entry.session.wait_stopped(None).await;
            let _ = entry.join.await;
            if let Some(stream) = entry.log_stream {
                stream.close().await;
            }
        }
    }

    async fn release_unused_queue_credentials(
        &self,
        assigned: &HashMap<SessionId, AssignedSession>,
    ) {
        let assigned_queues: HashSet<&str> =
            assigned.values().map(|assignment| assignment.queue_id.as_str()).collect();
        let mut map = self.queue_credentials.lock().await;
        map.retain(|_, entry| {
            let keep = assigned_queues.contains(entry.credentials.queue_id().as_str());
            if !keep {
                debug!(queue_id = %entry.credentials.queue_id(), "releasing queue credentials");
                entry.credentials.cleanup();
            }
            keep
        });
    }

    async fn create_new_sessions(
        &self,
        assigned: &HashMap<SessionId, AssignedSession>,
    ) -> HashSet<SessionId> {
        let existing: HashSet<SessionId> = self.sessions.lock().keys().cloned().collect();
        let mut created = HashSet::new();
        for (session_id, assignment) in assigned {
            if existing.contains(session_id) {
                continue;
            }
            if let Some(entry) = self.create_session(session_id, assignment).await {
                self.sessions.lock().insert(session_id.clone(), entry);
                created.insert(session_id.clone());
            }
            // Creation failures already failed the assignment's actions and
            // woke the heartbeat; the service will retry on its side.
        }
        created
    }

    async fn create_session(
        &self,
        session_id: &SessionId,
        assignment: &AssignedSession,
    ) -> Option<SchedulerSession<C>> {
        let now = self.clock.now_utc();
        let fail_all = |message: String| {
            warn!(%session_id, %message, "failing session assignment");
            self.updates.fail_all_actions(&assignment.session_actions, &message, now);
        };

        // Local log directory and file for the session.
        let mut session_log_path = None;
        if let Some(logs_dir) = &self.config.worker_logs_dir {
            let queue_dir = logs_dir.join(assignment.queue_id.as_str());
            if create_private_dir(&queue_dir).is_err() {
                fail_all(format!(
                    "Failed to create local session log directory on worker: {}",
                    queue_dir.display()
                ));
                return None;
            }
            let log_file = queue_dir.join(format!("{session_id}.log"));
            if touch_private_file(&log_file).is_err() {
                fail_all(format!(
                    "Failed to create local session log file on worker: {}",
                    log_file.display()
                ));
                return None;
            }
            session_log_path = Some(log_file);
        }

        let log_config = match SessionLogConfig::from_assignment(
            assignment.log_configuration.as_ref(),
            session_log_path,
        ) {
            Ok(config) => Arc::new(config),
            Err(error) => {
                fail_all(error.to_string());
                return None;
            }
        };

        let entities = Arc::new(JobEntityCache::new(
            Arc::clone(&self.service),
            self.identity.clone(),
            assignment.job_id.clone(),
        ));
        let job_details = match entities.job_details().await {
            Ok(details) => details,
            Err(error) => {
                fail_all(error.to_string());
                return None;
            }
        };

        let queue = SessionActionQueue::new(
            session_id.clone(),
            assignment.queue_id.clone(),
            Arc::clone(&entities),
        );
        queue.replace(&assignment.session_actions);

        let os_user = job_details.job_run_as_user.as_ref().and_then(|user| match user.run_as {
            RunAs::WorkerAgentUser => None,
            RunAs::QueueConfiguredUser => user.posix.clone(),
        });

        let mut extra_env = HashMap::new();
        let mut queue_credentials = None;
        if let Some(role_arn) = &job_details.queue_role_arn {
            match self
                .obtain_queue_credentials(&assignment.queue_id, role_arn, os_user.as_ref())
                .await
            {
                Ok(credentials) => {
                    extra_env
                        .insert("AWS_PROFILE".to_string(), credentials.profile_name().to_string());
                    queue_credentials = Some(credentials);
                }
                Err(QueueCredentialsFailure::Fatal(message)) => {
                    fail_all(format!(
                        "Unrecoverable error trying to obtain credentials for the queue role: {message}"
                    ));
                    return None;
                }
                Err(QueueCredentialsFailure::Unavailable) => {
                    warn!(%session_id, "could not obtain queue credentials; session runs without them");
                }
            }
        } else {
            info!(%session_id, "job has no queue role; session runs without queue credentials");
        }

        let attachments_configured = job_details
            .job_attachment_settings
            .as_ref()
            .is_some_and(|settings| !settings.is_empty());
        let attachments: Option<Arc<dyn AttachmentEngine>> = if attachments_configured {
            match &queue_credentials {
                Some(credentials) => {
                    Some(self.backends.attachment_engine(&assignment.queue_id, credentials))
                }
                None => {
                    // Attachments without credentials cannot work; fail fast
                    // so the problem surfaces clearly.
                    let message = match &job_details.queue_role_arn {
                        Some(role_arn) => {
                            format!("Failed to obtain credentials for role {role_arn}")
                        }
                        None => "Misconfiguration: job attachments are configured but the queue has no role"
                            .to_string(),
                    };
                    fail_all(message);
                    return None;
                }
            }
        } else {
            None
        };

        let (logger, log_stream) = match &self.log_client {
            Some(client) => match log_config.attach(Arc::clone(client)) {
                Ok((logger, handle)) => (Some(logger), Some(handle)),
                Err(error) => {
                    fail_all(format!("Failed to open local session log: {error}"));
                    return None;
                }
            },
            None => (None, None),
        };

        let working_dir = self.config.sessions_dir.join(session_id.as_str());
        let runner = self.backends.action_runner(&RunnerSpec {
            session_id: session_id.clone(),
            working_dir: working_dir.clone(),
            os_user: os_user.clone(),
            logger: logger.clone(),
        });

        let session = Arc::new(Session::new(
            SessionConfig {
                id: session_id.clone(),
                queue_id: assignment.queue_id.clone(),
                job_id: assignment.job_id.clone(),
                job_details,
                os_user,
                working_dir,
                extra_env,
                logger,
            },
            &self.identity,
            queue,
            entities,
            Arc::clone(&self.updates),
            runner,
            attachments,
            self.clock.clone(),
        ));

        info!(
            %session_id,
            queue_id = %assignment.queue_id,
            job_id = %assignment.job_id,
            actions = assignment.session_actions.len(),
            "created session"
        );
        let join = tokio::spawn(Arc::clone(&session).run());
        Some(SchedulerSession {
            session,
            join,
            log_config,
            log_stream,
            queue_id: assignment.queue_id.clone(),
        })
    }

    async fn obtain_queue_credentials(
        &self,
        queue_id: &QueueId,
        role_arn: &str,
        os_user: Option<&PosixUser>,
    ) -> Result<Arc<QueueCredentials>, QueueCredentialsFailure> {
        let key = format!("{queue_id}:{role_arn}");
        let mut map = self.queue_credentials.lock().await;
        if let Some(entry) = map.get(&key) {
            return Ok(Arc::clone(&entry.credentials));
        }

        let created = QueueCredentials::new(
            Arc::clone(&self.service),
            self.identity.clone(),
            queue_id.clone(),
            os_user,
            &self.config.persistence_dir,
            home_for_user(os_user),
            self.shutdown.clone(),
        )
        .await;
        let credentials = match created {
            Ok(credentials) => Arc::new(credentials),
            Err(CredentialsError::Request(
                error @ (RequestError::ConditionallyRecoverable(_) | RequestError::Interrupted),
            )) => {
                debug!(%queue_id, %error, "queue credentials unavailable for now");
                return Err(QueueCredentialsFailure::Unavailable);
            }
            Err(error) => return Err(QueueCredentialsFailure::Fatal(error.to_string())),
        };

        let refresher = CredentialsRefresher::new(
            format!("queue {queue_id} credentials for role {role_arn}"),
            Arc::clone(&credentials),
            self.queue_refresh_failure_callback(),
            RefresherConfig::default(),
        )
        .map_err(|error| QueueCredentialsFailure::Fatal(error.to_string()))?;
        let guard = refresher.enter();
        map.insert(
            key,
            QueueCredentialsEntry {
                credentials: Arc::clone(&credentials),
                _guard: guard,
                _refresher: refresher,
            },
        );
        debug!(%queue_id, %role_arn, "created queue credentials");
        Ok(credentials)
    }

    /// When queue credentials cannot be refreshed, every in-flight session is
    /// stopped; running without refreshable credentials would strand the
    /// jobs' subprocesses mid-run.
    fn queue_refresh_failure_callback(&self) -> FailureCallback {
        let sessions = Arc::clone(&self.sessions);
        let updates = Arc::clone(&self.updates);
        Arc::new(move |failure: RefreshFailure| {
            warn!(?failure, "queue credential refresh failed; stopping sessions");
            let message =
                "Fatal error attempting to refresh the queue role credentials. See logs for details.";
            for entry in sessions.lock().values() {
                entry.session.stop(
                    StopCurrentActionResult::Failed,
                    None,
                    Some(message.to_string()),
                );
            }
            updates.wake();
        })
    }

    fn update_existing_sessions(
        &self,
        assigned: &HashMap<SessionId, AssignedSession>,
        cancels: &HashMap<SessionId, Vec<ActionId>>,
        created: &HashSet<SessionId>,
    ) {
        let now = self.clock.now_utc();
        for (session_id, assignment) in assigned {
            if created.contains(session_id) {
                continue;
            }
            let (session, ended) = {
                let sessions = self.sessions.lock();
                let Some(entry) = sessions.get(session_id) else {
                    warn!(%session_id, "no session found for assignment");
                    continue;
                };
                (Arc::clone(&entry.session), entry.join.is_finished())
            };

            let mut pending = self.updates.lock();

            if let Some(cancel_ids) = cancels.get(session_id) {
                // Ids that already carry a terminal pending update are done;
                // cancelling them again would regress their status.
                let cancel_ids: Vec<ActionId> = cancel_ids
                    .iter()
                    .filter(|action_id| !pending.is_terminal(action_id))
                    .cloned()
                    .collect();
                if !cancel_ids.is_empty() {
                    session.cancel_actions(&mut pending, &cancel_ids);
                }
            }

            if ended && !session.is_stopping() {
                // The session's run task ended while work is still assigned.
                warn!(%session_id, "session ended unexpectedly; failing assigned actions");
                for action in &assignment.session_actions {
                    if !pending.is_terminal(action.action_id()) {
                        pending.post(SessionActionStatus::terminal(
                            action.action_id().clone(),
                            farmhand_api::models::CompletedStatus::Failed,
                            Some("Session ended unexpectedly on the worker".to_string()),
                            Some(now),
                            Some(now),
                        ));
                    }
                }
                drop(pending);
                self.updates.wake();
                continue;
            }

            let filtered: Vec<_> = assignment
                .session_actions
                .iter()
                .filter(|action| !pending.is_terminal(action.action_id()))
                .cloned()
                .collect();
            drop(pending);
            session.replace_assigned_actions(&filtered);
        }
    }

    fn update_session_logging(
        &self,
        assigned: &HashMap<SessionId, AssignedSession>,
        created: &HashSet<SessionId>,
    ) {
        let sessions = self.sessions.lock();
        for (session_id, assignment) in assigned {
            if created.contains(session_id) {
                continue;
            }
            let Some(entry) = sessions.get(session_id) else {
                continue;
            };
            if let Some(log) = &assignment.log_configuration {
                entry.log_config.update_parameters(log.parameters.clone());
            }
        }
    }

    async fn drain(&self) {
        let spec = self.shutdown_spec.lock().clone();
        let mut grace = spec.grace;
        let session_count = self.sessions.lock().len();
        if session_count > 0 {
            info!(count = session_count, "shutting down sessions");
        }

        if self.shutdown.is_set() && session_count > 0 {
            // Worker-initiated drain: tell the service to stop assigning
            // work, spending at most a small slice of the grace time on it.
            let transition_timeout = match grace {
                Some(grace_time) => {
                    let timeout = (grace_time / 10).min(STOPPING_TRANSITION_CAP);
                    grace = Some(grace_time.saturating_sub(timeout));
                    timeout
                }
                None => Duration::from_secs(1),
            };
            self.transition_to_stopping(transition_timeout).await;
        }

        let entries: Vec<SchedulerSession<C>> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.session.stop(
                StopCurrentActionResult::Interrupted,
                grace,
                spec.fail_message.clone(),
            );
        }
        if !entries.is_empty() {
            // Leave time to tell the service what happened.
            let wait_cap = grace.map(|grace_time| {
                grace_time.saturating_sub(FINAL_FLUSH_RESERVE).max(Duration::from_secs(1))
            });
            info!(?wait_cap, "waiting for sessions to end");
            let deadline = wait_cap.map(|cap| Instant::now() + cap);
            for entry in &entries {
                let remaining =
                    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
                entry.session.wait_stopped(remaining).await;
            }
        }
        for entry in entries {
            if let Some(stream) = entry.log_stream {
                stream.close().await;
            }
        }

        {
            let mut map = self.queue_credentials.lock().await;
            for (_, entry) in map.drain() {
                entry.credentials.cleanup();
            }
        }

        if self.shutdown.is_set() && session_count > 0 {
            // Flush the interrupted-action updates. Not interruptable: the
            // shutdown signal is already set and would abort the call.
            self.flush_updates().await;
        }
    }

    async fn flush_updates(&self) {
        let (wire_updates, transaction) = self.updates.snapshot();
        match update_worker_schedule(&*self.service, &self.identity, &wire_updates, None).await {
            Ok(_) => self.updates.commit(&transaction),
            Err(error) => warn!(%error, "final status flush failed"),
        }
    }

    async fn transition_to_stopping(&self, timeout: Duration) {
        let transition = update_worker(
            &*self.service,
            &self.identity,
            WorkerStatus::Stopping,
            None,
            None,
        );
        match tokio::time::timeout(timeout, transition).await {
            Ok(Ok(_)) => info!("worker status set to STOPPING"),
            Ok(Err(error)) => {
                warn!(%error, "failed to set worker status to STOPPING; continuing drain")
            }
            Err(_) => {
                info!("timed out setting worker status to STOPPING; continuing drain")
            }
        }
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    set_mode(path, 0o700)
}

fn touch_private_file(path: &Path) -> std::io::Result<()> {
    fs::OpenOptions::new().create(true).append(true).open(path)?;
    set_mode(path, 0o600)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
