//! Event types for tenrold -> client streaming

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tenrol_util::{ContextId, CourseId, RoleAssignmentId, UserId};

use crate::{EmailKind, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: tenrol_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A temporary enrolment clock was started
    TrackingStarted {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
        time_end: i64,
    },

    /// A marker-role grant was revoked because the user already held a role
    AssignmentRejected {
        user_id: UserId,
        context_id: ContextId,
    },

    /// A temporary enrolment became permanent
    Upgraded {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
    },

    /// A temporary enrolment ended without upgrade
    Expired {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
    },

    /// A user lost their last role in a course and was unenrolled
    Unenrolled {
        user_id: UserId,
        course_id: CourseId,
    },

    /// A notification was delivered to the mail transport
    EmailSent {
        kind: EmailKind,
        to: UserId,
    },

    /// Stale records purged and existing assignments adopted
    BackfillCompleted {
        purged: usize,
        created: usize,
    },

    /// End times recomputed after a duration change
    Rescheduled {
        updated: usize,
    },

    /// Configuration was reloaded
    ConfigReloaded,
}
