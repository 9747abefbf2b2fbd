//! Strongly-typed identifiers for tenrol
//!
//! Host platform records (users, courses, role assignments, ...) are keyed by
//! integer ids. Each gets its own newtype so a course id can never be passed
//! where a context id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// A user account on the host platform
    UserId
);

numeric_id!(
    /// A course on the host platform
    CourseId
);

numeric_id!(
    /// A permission context (one per course for our purposes)
    ContextId
);

numeric_id!(
    /// A role definition, e.g. "student" or the temporary marker role
    RoleId
);

numeric_id!(
    /// A single grant of a role to a user in a context
    RoleAssignmentId
);

numeric_id!(
    /// An enrolment method instance attached to a course
    EnrolInstanceId
);

numeric_id!(
    /// Row id of a temporary-enrolment tracking record
    TrackingId
);

/// Unique identifier for a connected IPC client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
