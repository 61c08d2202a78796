// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The outer worker: ties the scheduler, the fleet-credential refresher,
//! and the host shutdown monitor together for the life of the process.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use farmhand_api::RequestError;
use farmhand_core::{Clock, Interrupt};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bootstrap::BootstrapError;
use crate::config::ConfigError;
use crate::credentials::refresher::{FailureCallback, RefresherConfigError};
use crate::credentials::{CredentialsRefresher, RefreshFailure, RefresherConfig, WorkerCredentials};
use crate::hostmeta::{HostMetadataClient, ShutdownMonitor};
use crate::scheduler::{SchedulerError, WorkerScheduler};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Refresher(#[from] RefresherConfigError),
    #[error("worker task failed: {0}")]
    Internal(String),
}

/// Process exit code for a finished worker, per the agent's contract:
/// 0 for a normal shutdown (including a service-requested one), 1 for
/// configuration/bootstrap failures, nonzero otherwise.
pub fn exit_code_for(result: &Result<(), WorkerError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(WorkerError::Scheduler(SchedulerError::ServiceShutdown)) => 0,
        Err(WorkerError::Config(_) | WorkerError::Bootstrap(_)) => 1,
        Err(_) => 2,
    }
}

pub struct Worker<C: Clock> {
    scheduler: Arc<WorkerScheduler<C>>,
    credentials: Arc<WorkerCredentials>,
    host_metadata: Option<Arc<dyn HostMetadataClient>>,
    stop: Interrupt,
}

impl<C: Clock + 'static> Worker<C> {
    pub fn new(
        scheduler: Arc<WorkerScheduler<C>>,
        credentials: Arc<WorkerCredentials>,
        host_metadata: Option<Arc<dyn HostMetadataClient>>,
    ) -> Self {
        Self { scheduler, credentials, host_metadata, stop: Interrupt::new() }
    }

    /// Whether the heartbeat reported that the service no longer knows this
    /// worker identity; the caller may discard it and re-register.
    pub fn identity_unknown(result: &Result<(), WorkerError>) -> bool {
        matches!(
            result,
            Err(WorkerError::Scheduler(SchedulerError::Request(RequestError::WorkerNotFound(_))))
        )
    }

    /// Run the worker until it drains: the scheduler loop inside the
    /// fleet-credential refresher scope, with host-termination monitoring
    /// when a metadata endpoint is present.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let refresher = CredentialsRefresher::new(
            "worker fleet-role credentials",
            Arc::clone(&self.credentials),
            self.credentials_failure_callback(),
            RefresherConfig::default(),
        )?;
        let _refresh_scope = refresher.enter();

        let mut monitor_task = None;
        if let Some(client) = &self.host_metadata {
            if client.fetch_token().await.is_some() {
                let monitor = ShutdownMonitor::new(Arc::clone(client), self.stop.clone());
                monitor_task = Some(tokio::spawn(async move { monitor.run().await }));
            } else {
                info!("host metadata endpoint unavailable; termination monitoring disabled");
            }
        }

        let scheduler = Arc::clone(&self.scheduler);
        let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });

        let scheduler_result = match &mut monitor_task {
            Some(monitor) => {
                tokio::select! {
                    monitor_result = monitor => {
                        if let Ok(Some(shutdown)) = monitor_result {
                            info!(
                                grace = ?shutdown.grace,
                                reason = %shutdown.fail_message,
                                "host termination detected; draining"
                            );
                            self.stop.set();
                            self.scheduler
                                .shutdown(Some(shutdown.grace), Some(shutdown.fail_message));
                        }
                        (&mut scheduler_task).await
                    }
                    result = &mut scheduler_task => {
                        self.stop.set();
                        result
                    }
                }
            }
            None => {
                let result = (&mut scheduler_task).await;
                self.stop.set();
                result
            }
        };
        if let Some(monitor) = monitor_task {
            monitor.abort();
        }

        match scheduler_result {
            Ok(Ok(())) => {
                info!("worker drained");
                Ok(())
            }
            Ok(Err(SchedulerError::ServiceShutdown)) => {
                info!("worker stopped at the service's request");
                Err(WorkerError::Scheduler(SchedulerError::ServiceShutdown))
            }
            Ok(Err(error)) => {
                error!(%error, "scheduler exited with a fatal error");
                Err(WorkerError::Scheduler(error))
            }
            Err(join_error) => Err(WorkerError::Internal(join_error.to_string())),
        }
    }

    /// When the worker's own credentials cannot be kept fresh, drain with a
    /// grace matched to however much lifetime is left.
    fn credentials_failure_callback(&self) -> FailureCallback {
        let scheduler = Arc::clone(&self.scheduler);
        let stop = self.stop.clone();
        Arc::new(move |failure| {
            let (grace, message) = match failure {
                RefreshFailure::Expiring { expiry } => {
                    let remaining = (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        error!("worker role credentials have expired");
                        (Duration::from_secs(5), "Worker role credentials have expired")
                    } else {
                        error!(
                            remaining_secs = remaining.as_secs(),
                            "worker role credentials are expiring and cannot be refreshed"
                        );
                        (remaining, "Worker role credentials are expiring and cannot be refreshed")
                    }
                }
                RefreshFailure::Error(error) => {
                    warn!(%error, "fatal error refreshing worker role credentials");
                    (
                        Duration::from_secs(30),
                        "Fatal error refreshing worker role credentials; see log for details",
                    )
                }
            };
            stop.set();
            scheduler.shutdown(Some(grace), Some(message.to_string()));
        })
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
