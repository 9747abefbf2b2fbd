//! Host platform traits

use serde::{Deserialize, Serialize};
use tenrol_api::{RoleAssigned, RoleUnassigned};
use tenrol_util::{ContextId, CourseId, EnrolInstanceId, RoleAssignmentId, RoleId, UserId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from host platform operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Unknown context: {0}")]
    UnknownContext(ContextId),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// Enrolment method whose instance is removed when a temporary enrolment ends
pub const MANUAL_ENROL_METHOD: &str = "manual";

/// A role granted to a user in a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: RoleAssignmentId,
    pub role_id: RoleId,
    pub context_id: ContextId,
    pub user_id: UserId,
    /// Who last modified (usually created) the assignment
    pub modifier_id: UserId,
    /// Unix seconds
    pub time_modified: i64,
}

/// Directory entry for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
}

impl UserProfile {
    pub fn fullname(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub id: CourseId,
    pub fullname: String,
}

/// One enrolment method configured on a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolmentInstance {
    pub id: EnrolInstanceId,
    pub course_id: CourseId,
    /// e.g. "manual", "self", "flatfile"
    pub method: String,
}

impl EnrolmentInstance {
    pub fn is_manual(&self) -> bool {
        self.method == MANUAL_ENROL_METHOD
    }
}

/// A notification ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Events from the host platform
#[derive(Debug, Clone)]
pub enum HostEvent {
    RoleAssigned(RoleAssigned),
    RoleUnassigned(RoleUnassigned),
}

/// Host platform trait - implemented by LMS-specific adapters
///
/// Role removals made through this trait must be reported on the event
/// channel as [`HostEvent::RoleUnassigned`], just like removals made by any
/// other actor on the platform.
pub trait HostPlatform: Send + Sync {
    /// All of a user's role assignments in a context
    fn assignments_for_user(
        &self,
        user: UserId,
        context: ContextId,
    ) -> HostResult<Vec<RoleAssignment>>;

    /// Every assignment of a role, across all contexts
    fn assignments_for_role(&self, role: RoleId) -> HostResult<Vec<RoleAssignment>>;

    fn assignments_for_role_in_context(
        &self,
        role: RoleId,
        context: ContextId,
    ) -> HostResult<Vec<RoleAssignment>>;

    fn get_assignment(&self, id: RoleAssignmentId) -> HostResult<Option<RoleAssignment>>;

    /// Grant a role. Emits `RoleAssigned`.
    fn assign_role(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        actor: UserId,
        timestamp: i64,
    ) -> HostResult<RoleAssignment>;

    /// Remove one assignment by id. Emits `RoleUnassigned` and returns the
    /// removed assignment, or `None` if it no longer exists.
    fn remove_assignment(
        &self,
        id: RoleAssignmentId,
        actor: UserId,
    ) -> HostResult<Option<RoleAssignment>>;

    /// Remove a role from a user in a context. Emits one `RoleUnassigned`
    /// per removed assignment.
    fn unassign_role(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        actor: UserId,
    ) -> HostResult<Vec<RoleAssignment>>;

    /// Enrolment methods configured on a course
    fn enrolment_instances(&self, course: CourseId) -> HostResult<Vec<EnrolmentInstance>>;

    fn course_for_context(&self, context: ContextId) -> HostResult<Option<CourseId>>;

    fn user(&self, id: UserId) -> HostResult<Option<UserProfile>>;

    fn course(&self, id: CourseId) -> HostResult<Option<CourseInfo>>;

    /// Remove a user's enrolment through an instance. Returns whether an
    /// enrolment was removed; unenrolling a user who is not enrolled is not
    /// an error.
    fn unenrol(&self, instance: &EnrolmentInstance, user: UserId) -> HostResult<bool>;

    /// Subscribe to host events
    fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent>;

    /// Optional: check if the host platform is reachable
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Mail transport
pub trait Mailer: Send + Sync {
    fn send(&self, to: &UserProfile, email: &RenderedEmail) -> HostResult<()>;
}
