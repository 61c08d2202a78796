// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The job-entity cache.
//!
//! Entities are fetched with BatchGetJobEntity and memoized for the life of
//! the session. Per-entity service errors are cached too, so a failing entity
//! does not get refetched on every dequeue. A `MaxPayloadSizeExceeded` error
//! is the one soft failure: the record stays unresolved and is retried by a
//! later batch.

use std::collections::HashMap;
use std::sync::Arc;

use farmhand_api::{
    batch_get_job_entities, DispatchService, EntityIdentifier, EntityKey,
    EnvironmentDetailsData, JobAttachmentDetailsData, JobDetailsData, JobEntity, RequestError,
    StepDetailsData,
};
use farmhand_api::models::WorkerIdentity;
use farmhand_core::{EnvironmentId, JobId, StepId};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

const MAX_PAYLOAD_SIZE_EXCEEDED: &str = "MaxPayloadSizeExceeded";

#[derive(Debug, Error)]
pub enum EntityFetchError {
    /// A top-level request failure; propagated unchanged so the caller can
    /// react to worker-not-found and friends.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The service failed this particular entity.
    #[error("job entity failed with {code}: {message}")]
    Entity { code: String, message: String },

    /// The entity uses a schema this agent does not understand.
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(String),

    /// The response did not hold the entity kind that was asked for.
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default)]
struct EntityRecord {
    data: Option<JobEntity>,
    error: Option<(String, String)>,
}

/// Per-session cache of job entities keyed by canonical entity identity.
pub struct JobEntityCache {
    service: Arc<dyn DispatchService>,
    identity: WorkerIdentity,
    job_id: JobId,
    records: Mutex<HashMap<EntityKey, EntityRecord>>,
}

impl JobEntityCache {
    pub fn new(service: Arc<dyn DispatchService>, identity: WorkerIdentity, job_id: JobId) -> Self {
        Self { service, identity, job_id, records: Mutex::new(HashMap::new()) }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Fetch and memoize a set of entities, batched at the operation's
    /// declared maximum. Top-level request failures propagate; per-entity
    /// failures are recorded on the entity's record.
    pub async fn cache_entities(
        &self,
        identifiers: &[EntityIdentifier],
    ) -> Result<(), RequestError> {
        let unresolved: Vec<EntityIdentifier> = {
            let records = self.records.lock();
            identifiers
                .iter()
                .filter(|identifier| {
                    records.get(&identifier.key()).is_none_or(|record| record.data.is_none())
                })
                .cloned()
                .collect()
        };

        let batch_size = self.service.max_entity_batch_size().max(1);
        for batch in unresolved.chunks(batch_size) {
            let response =
                batch_get_job_entities(&*self.service, &self.identity, batch).await?;

            let mut records = self.records.lock();
            for entity in response.entities {
                let key = entity.key();
                records.entry(key).or_default().data = Some(entity);
            }
            for entity_error in response.errors {
                if entity_error.code() == MAX_PAYLOAD_SIZE_EXCEEDED {
                    // Soft failure: leave the record unresolved so a later,
                    // smaller batch can pick it up.
                    continue;
                }
                error!(
                    key = %entity_error.key(),
                    code = entity_error.code(),
                    "BatchGetJobEntity reported an entity error"
                );
                records.entry(entity_error.key()).or_default().error =
                    Some((entity_error.code().to_string(), entity_error.message().to_string()));
            }
        }
        Ok(())
    }

    async fn request(&self, identifier: EntityIdentifier) -> Result<JobEntity, EntityFetchError> {
        let key = identifier.key();
        if let Some(result) = self.cached(&key) {
            return result;
        }

        self.cache_entities(std::slice::from_ref(&identifier)).await?;

        self.cached(&key).unwrap_or_else(|| {
            Err(EntityFetchError::Validation(format!(
                "entity {key} was neither resolved nor failed by the service"
            )))
        })
    }

    fn cached(&self, key: &EntityKey) -> Option<Result<JobEntity, EntityFetchError>> {
        let records = self.records.lock();
        let record = records.get(key)?;
        if let Some(entity) = &record.data {
            return Some(Ok(entity.clone()));
        }
        if let Some((code, message)) = &record.error {
            return Some(Err(EntityFetchError::Entity {
                code: code.clone(),
                message: message.clone(),
            }));
        }
        None
    }

    pub async fn job_details(&self) -> Result<JobDetailsData, EntityFetchError> {
        let entity = self
            .request(EntityIdentifier::JobDetails { job_id: self.job_id.clone() })
            .await?;
        match entity {
            JobEntity::JobDetails(details) => {
                if !details.schema_version.is_supported() {
                    return Err(EntityFetchError::UnsupportedSchema(
                        details.schema_version.as_str().to_string(),
                    ));
                }
                Ok(details)
            }
            other => Err(EntityFetchError::Validation(format!(
                "expected job details for {}, got {other:?}",
                self.job_id
            ))),
        }
    }

    pub async fn step_details(&self, step_id: &StepId) -> Result<StepDetailsData, EntityFetchError> {
        let entity = self
            .request(EntityIdentifier::StepDetails {
                job_id: self.job_id.clone(),
                step_id: step_id.clone(),
            })
            .await?;
        match entity {
            JobEntity::StepDetails(details) => {
                if !details.schema_version.is_supported() {
                    return Err(EntityFetchError::UnsupportedSchema(
                        details.schema_version.as_str().to_string(),
                    ));
                }
                Ok(details)
            }
            other => Err(EntityFetchError::Validation(format!(
                "expected step details for {step_id}, got {other:?}"
            ))),
        }
    }

    pub async fn environment_details(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<EnvironmentDetailsData, EntityFetchError> {
        let entity = self
            .request(EntityIdentifier::EnvironmentDetails {
                job_id: self.job_id.clone(),
                environment_id: environment_id.clone(),
            })
            .await?;
        match entity {
            JobEntity::EnvironmentDetails(details) => {
                if !details.schema_version.is_supported() {
                    return Err(EntityFetchError::UnsupportedSchema(
                        details.schema_version.as_str().to_string(),
                    ));
                }
                Ok(details)
            }
            other => Err(EntityFetchError::Validation(format!(
                "expected environment details for {environment_id}, got {other:?}"
            ))),
        }
    }

    pub async fn job_attachment_details(
        &self,
    ) -> Result<JobAttachmentDetailsData, EntityFetchError> {
        let entity = self
            .request(EntityIdentifier::JobAttachmentDetails { job_id: self.job_id.clone() })
            .await?;
        match entity {
            JobEntity::JobAttachmentDetails(details) => Ok(details),
            other => Err(EntityFetchError::Validation(format!(
                "expected job attachment details for {}, got {other:?}",
                self.job_id
            ))),
        }
    }
}

#[cfg(test)]
#[path = "entities_tests.rs"]
mod tests;
