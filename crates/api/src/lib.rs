// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! farmhand-api: dispatch-service wire models, error taxonomy, and the
//! retrying request layer.
//!
//! The transport itself (JSON-over-HTTPS) lives behind the [`DispatchService`]
//! trait; everything in this crate depends only on the logical request and
//! response shapes.

pub mod backoff;
pub mod client;
pub mod entities;
pub mod error;
pub mod models;

pub use backoff::Backoff;
pub use client::{
    assume_fleet_role, assume_queue_role, batch_get_job_entities, create_worker, delete_worker,
    update_worker, update_worker_schedule, DispatchService,
};
pub use entities::{
    BatchEntityResponse, EntityError, EntityIdentifier, EntityKey, EnvironmentDetailsData,
    JobAttachmentDetailsData, JobDetailsData, JobEntity, SchemaVersion, StepDetailsData,
};
pub use error::{ConflictReason, RequestError, ServiceException};
pub use models::{
    AssignedSession, AttachmentManifests, AttachmentSettings, Capabilities, CompletedStatus,
    DesiredWorkerStatus, HostProperties, JobRunAsUser, LogConfiguration, ManifestProperties,
    PathMapping, PosixUser, RoleCredentials, RunAs, SessionActionSpec, TaskParameter,
    UpdateScheduleResponse, UpdateWorkerResponse, UpdatedActionInfo, WorkerIdentity, WorkerStatus,
    UPDATE_SCHEDULE_MAX_MESSAGE_CHARS,
};
