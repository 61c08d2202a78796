// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for dispatch-service requests.
//!
//! [`ServiceException`] is what a transport implementation reports for a
//! single attempt. The retrying wrappers in [`crate::client`] translate those
//! into a [`RequestError`], which is the only error type the rest of the
//! agent reasons about.

use std::time::Duration;

use thiserror::Error;

/// Conflict sub-reason carried in a ConflictException response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    StatusConflict,
    ConcurrentModification,
    ResourceAlreadyExists,
    Other(String),
}

/// One attempt's failure, as reported by the transport.
#[derive(Debug, Clone, Error)]
pub enum ServiceException {
    #[error("throttled: {message}")]
    Throttling {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("internal server error: {message}")]
    InternalServer {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("access denied: {message}")]
    AccessDenied { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("resource not found: {message}")]
    ResourceNotFound { message: String },
    #[error("conflict ({reason:?}): {message}")]
    Conflict {
        reason: ConflictReason,
        resource_id: Option<String>,
        resource_status: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl ServiceException {
    /// Service-supplied lower bound on the next retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttling { retry_after, .. }
            | Self::InternalServer { retry_after, .. }
            | Self::Conflict { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// The outcome of a request after the retry policy has been applied.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No retry will succeed; the enclosing loop must stop.
    #[error("unrecoverable service error: {0}")]
    Unrecoverable(ServiceException),

    /// May succeed later depending on circumstance; the immediate caller
    /// decides whether to retry.
    #[error("conditionally recoverable service error: {0}")]
    ConditionallyRecoverable(ServiceException),

    /// The service no longer knows this worker identity.
    #[error("worker not found: {0}")]
    WorkerNotFound(ServiceException),

    /// The worker's status at the service is no longer online.
    #[error("worker is not online at the service: {0}")]
    WorkerOffline(ServiceException),

    /// The caller-supplied interrupt fired; the call was abandoned.
    #[error("request interrupted")]
    Interrupted,
}

impl RequestError {
    /// Whether any retry of the same request could succeed.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_) | Self::WorkerNotFound(_))
    }
}
