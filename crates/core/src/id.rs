// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service-assigned resource identifiers.
//!
//! Every identifier here is minted by the dispatch service and carried by the
//! agent verbatim, so these are plain string newtypes rather than generated
//! IDs.

/// Define a newtype wrapper for a service-assigned identifier string.
///
/// Generates `new()`, `as_str()`, `Display`, `From<String>`, `From<&str>`,
/// `PartialEq<str>`, and `Borrow<str>` implementations.
macro_rules! define_resource_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the string value of this identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_resource_id! {
    /// Unique identifier for a registered worker.
    pub struct WorkerId;
}

define_resource_id! {
    /// Identifier of the farm the worker belongs to.
    pub struct FarmId;
}

define_resource_id! {
    /// Identifier of the fleet the worker belongs to.
    pub struct FleetId;
}

define_resource_id! {
    /// Identifier of a queue of jobs sharing a role and attachment settings.
    pub struct QueueId;
}

define_resource_id! {
    /// Identifier of a job.
    pub struct JobId;
}

define_resource_id! {
    /// Identifier of one session assignment on this worker.
    pub struct SessionId;
}

define_resource_id! {
    /// Identifier of a single session action.
    pub struct ActionId;
}

define_resource_id! {
    /// Identifier of a job step.
    pub struct StepId;
}

define_resource_id! {
    /// Identifier of a task within a step.
    pub struct TaskId;
}

define_resource_id! {
    /// Identifier of a job environment.
    pub struct EnvironmentId;
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
