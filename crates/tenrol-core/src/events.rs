//! Core events emitted by the engine

use tenrol_api::EmailKind;
use tenrol_util::{ContextId, CourseId, RoleAssignmentId, UserId};

/// Events emitted by the lifecycle engine and sweeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A marker-role assignment is now tracked
    TrackingStarted {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
        time_end: i64,
    },

    /// Marker role revoked because the user already held a role in the context
    AssignmentRejected {
        user_id: UserId,
        context_id: ContextId,
    },

    /// Tracked enrolment became permanent
    Upgraded {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
    },

    /// Marker role removed from a non-upgraded enrolment
    Expired {
        role_assignment_id: RoleAssignmentId,
        user_id: UserId,
    },

    /// User removed from the course
    Unenrolled {
        user_id: UserId,
        course_id: CourseId,
    },

    /// Notification accepted by the mailer
    EmailSent {
        kind: EmailKind,
        to: UserId,
    },

    BackfillCompleted {
        purged: usize,
        created: usize,
    },

    Rescheduled {
        updated: usize,
    },
}
