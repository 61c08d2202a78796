// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session action errors.

use farmhand_core::ActionId;
use thiserror::Error;

/// Failure to turn a queued action into a runnable one; carries the action id
/// so the session can fail exactly that action.
#[derive(Debug, Clone, Error)]
pub enum SessionActionError {
    #[error(
        "Worker does not support schema version {schema_version}. \
         Consider upgrading to a newer worker agent."
    )]
    UnsupportedSchema { action_id: ActionId, schema_version: String },

    #[error("{message}")]
    Details { action_id: ActionId, message: String },
}

impl SessionActionError {
    pub fn action_id(&self) -> &ActionId {
        match self {
            Self::UnsupportedSchema { action_id, .. } | Self::Details { action_id, .. } => action_id,
        }
    }
}
