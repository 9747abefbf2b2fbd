//! Audit event types

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tenrol_api::EmailKind;
use tenrol_util::{ContextId, CourseId, RoleAssignmentId, RoleId, UserId};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Config reload requested
    ConfigReloaded {
        success: bool,
        marker_role_id: Option<RoleId>,
    },

    /// A temporary enrolment clock was started
    TrackingStarted {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
        time_start: i64,
        time_end: i64,
    },

    /// A marker-role grant was revoked because the user held another role
    AssignmentRejected {
        user_id: UserId,
        context_id: ContextId,
        role_assignment_id: RoleAssignmentId,
    },

    /// Temporary enrolment made permanent
    Upgraded {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
    },

    /// Temporary enrolment ended without upgrade
    Expired {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
    },

    /// User removed from a course
    Unenrolled { user_id: UserId, course_id: CourseId },

    /// Notification handed to the mail transport
    EmailSent { kind: EmailKind, to: UserId },

    /// Mail transport refused a notification
    EmailFailed {
        kind: EmailKind,
        to: UserId,
        error: String,
    },

    /// Backfill finished
    BackfillCompleted {
        marker_role_id: RoleId,
        purged: usize,
        created: usize,
    },

    /// End times recomputed for a new duration
    Rescheduled {
        duration_seconds: i64,
        updated: usize,
    },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Local>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: tenrol_util::now(),
            event,
        }
    }
}
