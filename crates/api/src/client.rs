// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The dispatch-service transport trait and the retrying request wrappers.
//!
//! Each wrapper owns the retry policy for one operation: transient failures
//! (throttling, internal server errors, retryable conflicts) are retried here
//! with capped backoff, everything else is classified into a
//! [`RequestError`] for the caller. Wrappers that can be held up for a long
//! time accept an [`Interrupt`] so a drain can abandon them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use farmhand_core::{ActionId, FarmId, FleetId, QueueId, WorkerId};
use farmhand_core::{Interrupt, WaitOutcome};
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::entities::{BatchEntityResponse, EntityIdentifier};
use crate::error::{ConflictReason, RequestError, ServiceException};
use crate::models::{
    Capabilities, HostProperties, RoleCredentials, UpdateScheduleResponse, UpdateWorkerResponse,
    UpdatedActionInfo, WorkerIdentity, WorkerStatus,
};

const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How long AssumeQueueRole tolerates a queue-status conflict before treating
/// it as more than eventual consistency.
const QUEUE_STATUS_CONSISTENCY_WINDOW: Duration = Duration::from_secs(10);

/// A single-attempt transport to the dispatch service.
///
/// Implementations perform exactly one request per call and report the raw
/// service exception on failure; retries live in this module's wrappers.
#[async_trait]
pub trait DispatchService: Send + Sync {
    async fn create_worker(
        &self,
        farm_id: &FarmId,
        fleet_id: &FleetId,
        host_properties: &HostProperties,
    ) -> Result<WorkerId, ServiceException>;

    async fn delete_worker(&self, identity: &WorkerIdentity) -> Result<(), ServiceException>;

    async fn update_worker(
        &self,
        identity: &WorkerIdentity,
        status: WorkerStatus,
        capabilities: Option<&Capabilities>,
        host_properties: Option<&HostProperties>,
    ) -> Result<UpdateWorkerResponse, ServiceException>;

    async fn assume_fleet_role(
        &self,
        identity: &WorkerIdentity,
    ) -> Result<RoleCredentials, ServiceException>;

    async fn assume_queue_role(
        &self,
        identity: &WorkerIdentity,
        queue_id: &QueueId,
    ) -> Result<RoleCredentials, ServiceException>;

    async fn batch_get_job_entities(
        &self,
        identity: &WorkerIdentity,
        identifiers: &[EntityIdentifier],
    ) -> Result<BatchEntityResponse, ServiceException>;

    async fn update_worker_schedule(
        &self,
        identity: &WorkerIdentity,
        updated_actions: &HashMap<ActionId, UpdatedActionInfo>,
    ) -> Result<UpdateScheduleResponse, ServiceException>;

    /// Maximum identifiers accepted by one BatchGetJobEntity request, as
    /// declared by the operation's service model.
    fn max_entity_batch_size(&self) -> usize;
}

async fn backoff_sleep(
    delay: Duration,
    interrupt: Option<&Interrupt>,
) -> Result<(), RequestError> {
    match interrupt {
        Some(interrupt) => match interrupt.wait_for(delay).await {
            WaitOutcome::Interrupted => Err(RequestError::Interrupted),
            WaitOutcome::Elapsed => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

fn check_interrupt(interrupt: Option<&Interrupt>) -> Result<(), RequestError> {
    if interrupt.is_some_and(Interrupt::is_set) {
        return Err(RequestError::Interrupted);
    }
    Ok(())
}

/// Register a new worker identity, retrying while throttled and while the
/// fleet is still being created.
pub async fn create_worker(
    service: &dyn DispatchService,
    farm_id: &FarmId,
    fleet_id: &FleetId,
    host_properties: &HostProperties,
) -> Result<WorkerId, RequestError> {
    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    loop {
        let exc = match service.create_worker(farm_id, fleet_id, host_properties).await {
            Ok(worker_id) => return Ok(worker_id),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "CreateWorker throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "CreateWorker internal server error, retrying");
            }
            ServiceException::Conflict {
                reason: ConflictReason::ResourceAlreadyExists, ..
            } => {
                error!(
                    "could not register: a worker for these credentials already exists; \
                     delete it or configure the agent to reuse its worker id"
                );
                return Err(RequestError::Unrecoverable(exc));
            }
            ServiceException::Conflict {
                reason: ConflictReason::StatusConflict,
                resource_id,
                resource_status,
                ..
            } if resource_id.as_deref() == Some(fleet_id.as_str())
                && resource_status.as_deref() == Some("CREATE_IN_PROGRESS") =>
            {
                info!(%fleet_id, ?delay, "fleet is still being created, retrying");
            }
            _ => return Err(RequestError::Unrecoverable(exc)),
        }
        backoff_sleep(delay, None).await?;
        attempt += 1;
    }
}

/// Remove the worker identity at the service.
///
/// A status conflict on the worker itself means it has not reached STOPPED
/// yet; that is surfaced as conditionally recoverable so the caller can stop
/// first and try again.
pub async fn delete_worker(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
) -> Result<(), RequestError> {
    const CONFLICTING_STATUSES: [&str; 6] =
        ["STARTED", "STOPPING", "NOT_RESPONDING", "NOT_COMPATIBLE", "RUNNING", "IDLE"];

    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    loop {
        let exc = match service.delete_worker(identity).await {
            Ok(()) => return Ok(()),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "DeleteWorker throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "DeleteWorker internal server error, retrying");
            }
            ServiceException::Conflict {
                reason: ConflictReason::StatusConflict,
                resource_id,
                resource_status,
                ..
            } if resource_id.as_deref() == Some(identity.worker_id.as_str())
                && resource_status
                    .as_deref()
                    .is_some_and(|status| CONFLICTING_STATUSES.contains(&status)) =>
            {
                return Err(RequestError::ConditionallyRecoverable(exc));
            }
            _ => return Err(RequestError::Unrecoverable(exc)),
        }
        backoff_sleep(delay, None).await?;
        attempt += 1;
    }
}

/// Update the worker's status and capabilities.
///
/// When asked for STARTED while the service still has the worker STOPPING or
/// NOT_COMPATIBLE, the worker is first transitioned to STOPPED and the
/// STARTED attempt is then retried fresh.
pub async fn update_worker(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
    status: WorkerStatus,
    capabilities: Option<&Capabilities>,
    interrupt: Option<&Interrupt>,
) -> Result<UpdateWorkerResponse, RequestError> {
    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    loop {
        check_interrupt(interrupt)?;
        let exc = match service.update_worker(identity, status, capabilities, None).await {
            Ok(response) => return Ok(response),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        let mut must_stop_first = false;
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "UpdateWorker throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "UpdateWorker internal server error, retrying");
            }
            ServiceException::ResourceNotFound { .. } => {
                return Err(RequestError::ConditionallyRecoverable(exc));
            }
            ServiceException::AccessDenied { .. } | ServiceException::Validation { .. } => {
                return Err(RequestError::Unrecoverable(exc));
            }
            ServiceException::Conflict { reason, resource_id, resource_status, .. } => {
                match reason {
                    ConflictReason::ConcurrentModification => {
                        info!(?delay, "UpdateWorker concurrent modification, retrying");
                    }
                    ConflictReason::StatusConflict
                        if resource_id.as_deref() == Some(identity.worker_id.as_str()) =>
                    {
                        let resource_status = resource_status.as_deref();
                        if resource_status == Some("ASSOCIATED") {
                            info!(?delay, "instance profile still attached, retrying");
                        } else if status == WorkerStatus::Started
                            && matches!(resource_status, Some("STOPPING" | "NOT_COMPATIBLE"))
                        {
                            info!(
                                worker_status = ?resource_status,
                                "worker must reach STOPPED before STARTED"
                            );
                            must_stop_first = true;
                        } else {
                            return Err(RequestError::Unrecoverable(exc));
                        }
                    }
                    _ => return Err(RequestError::Unrecoverable(exc)),
                }
            }
            ServiceException::Transport { .. } => {
                return Err(RequestError::Unrecoverable(exc));
            }
        }

        if must_stop_first {
            Box::pin(update_worker(
                service,
                identity,
                WorkerStatus::Stopped,
                capabilities,
                interrupt,
            ))
            .await?;
            // The STARTED attempts start fresh after the forced stop.
            attempt = 0;
            continue;
        }

        backoff_sleep(delay, interrupt).await?;
        attempt += 1;
    }
}

/// Obtain fleet-role credentials for the worker itself.
pub async fn assume_fleet_role(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
    interrupt: Option<&Interrupt>,
) -> Result<RoleCredentials, RequestError> {
    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    loop {
        check_interrupt(interrupt)?;
        let exc = match service.assume_fleet_role(identity).await {
            Ok(credentials) => return Ok(credentials),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "AssumeFleetRole throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "AssumeFleetRole internal server error, retrying");
            }
            _ => return Err(RequestError::Unrecoverable(exc)),
        }
        backoff_sleep(delay, interrupt).await?;
        attempt += 1;
    }
}

/// Obtain queue-role credentials for session subprocesses.
///
/// Queue status conflicts are tolerated for a short eventual-consistency
/// window before being handed to the caller as conditionally recoverable.
pub async fn assume_queue_role(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
    queue_id: &QueueId,
    interrupt: Option<&Interrupt>,
) -> Result<RoleCredentials, RequestError> {
    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    let query_start = Instant::now();
    loop {
        check_interrupt(interrupt)?;
        let exc = match service.assume_queue_role(identity, queue_id).await {
            Ok(credentials) => return Ok(credentials),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "AssumeQueueRole throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "AssumeQueueRole internal server error, retrying");
            }
            ServiceException::AccessDenied { .. } => {
                return Err(RequestError::ConditionallyRecoverable(exc));
            }
            ServiceException::ResourceNotFound { .. } => {
                // Worker or queue is gone; either way the queue's session
                // actions must fail. If the worker is the missing resource,
                // the next heartbeat discovers it.
                return Err(RequestError::Unrecoverable(exc));
            }
            ServiceException::Validation { .. } => {
                error!(error = %exc, "validation error from AssumeQueueRole");
                return Err(RequestError::ConditionallyRecoverable(exc));
            }
            ServiceException::Conflict {
                reason: ConflictReason::StatusConflict,
                resource_id,
                ..
            } => {
                if resource_id.as_deref() == Some(identity.worker_id.as_str()) {
                    return Err(RequestError::WorkerOffline(exc));
                } else if resource_id.as_deref() == Some(queue_id.as_str()) {
                    if query_start.elapsed() > QUEUE_STATUS_CONSISTENCY_WINDOW {
                        return Err(RequestError::ConditionallyRecoverable(exc));
                    }
                    info!(%queue_id, ?delay, "queue status conflict, retrying");
                } else {
                    return Err(RequestError::ConditionallyRecoverable(exc));
                }
            }
            ServiceException::Conflict { .. } => {
                return Err(RequestError::ConditionallyRecoverable(exc));
            }
            ServiceException::Transport { .. } => {
                return Err(RequestError::Unrecoverable(exc));
            }
        }
        backoff_sleep(delay, interrupt).await?;
        attempt += 1;
    }
}

/// Fetch a batch of job entities.
pub async fn batch_get_job_entities(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
    identifiers: &[EntityIdentifier],
) -> Result<BatchEntityResponse, RequestError> {
    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    loop {
        let exc = match service.batch_get_job_entities(identity, identifiers).await {
            Ok(response) => return Ok(response),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "BatchGetJobEntity throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "BatchGetJobEntity internal server error, retrying");
            }
            ServiceException::ResourceNotFound { .. } => {
                return Err(RequestError::WorkerNotFound(exc));
            }
            _ => return Err(RequestError::Unrecoverable(exc)),
        }
        backoff_sleep(delay, None).await?;
        attempt += 1;
    }
}

/// The heartbeat: report action updates, receive the desired schedule.
pub async fn update_worker_schedule(
    service: &dyn DispatchService,
    identity: &WorkerIdentity,
    updated_actions: &HashMap<ActionId, UpdatedActionInfo>,
    interrupt: Option<&Interrupt>,
) -> Result<UpdateScheduleResponse, RequestError> {
    let backoff = Backoff::new(BACKOFF_CAP);
    let mut attempt = 0;
    loop {
        check_interrupt(interrupt)?;
        let exc = match service.update_worker_schedule(identity, updated_actions).await {
            Ok(response) => return Ok(response),
            Err(exc) => exc,
        };
        let delay = backoff.delay_with_floor(attempt, exc.retry_after());
        match &exc {
            ServiceException::Throttling { .. } => {
                info!(?delay, "UpdateWorkerSchedule throttled, retrying");
            }
            ServiceException::InternalServer { .. } => {
                warn!(?delay, error = %exc, "UpdateWorkerSchedule internal server error, retrying");
            }
            ServiceException::ResourceNotFound { .. } => {
                return Err(RequestError::WorkerNotFound(exc));
            }
            ServiceException::Conflict { reason, resource_id, .. } => match reason {
                ConflictReason::StatusConflict => {
                    if resource_id.as_deref() == Some(identity.worker_id.as_str()) {
                        return Err(RequestError::WorkerOffline(exc));
                    }
                    return Err(RequestError::Unrecoverable(exc));
                }
                ConflictReason::ConcurrentModification => {
                    // Someone else touched the worker record; retrying
                    // immediately is safe and keeps the heartbeat prompt.
                    info!("UpdateWorkerSchedule concurrent modification, retrying");
                    attempt += 1;
                    continue;
                }
                _ => return Err(RequestError::Unrecoverable(exc)),
            },
            _ => return Err(RequestError::Unrecoverable(exc)),
        }
        backoff_sleep(delay, interrupt).await?;
        attempt += 1;
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
