//! Shared types for the tenrold API

use serde::{Deserialize, Serialize};
use tenrol_util::{ContextId, CourseId, RoleAssignmentId, RoleId, UserId};

/// A role was granted to a user in a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssigned {
    /// Who performed the assignment
    pub actor_id: UserId,
    /// Who received the role
    pub subject_id: UserId,
    pub context_id: ContextId,
    pub course_id: CourseId,
    pub role_id: RoleId,
    pub role_assignment_id: RoleAssignmentId,
    /// Unix seconds
    pub timestamp: i64,
}

/// A role was removed from a user in a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleUnassigned {
    pub actor_id: UserId,
    pub subject_id: UserId,
    pub context_id: ContextId,
    pub course_id: CourseId,
    pub role_id: RoleId,
    pub role_assignment_id: RoleAssignmentId,
    /// Unix seconds. Defaults to the time of receipt when omitted.
    #[serde(default = "tenrol_util::unix_now")]
    pub timestamp: i64,
}

/// The notification emails the service can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    /// To the student when they are temporarily enrolled
    StudentInit,
    /// To the teacher who temporarily enrolled a student
    TeacherInit,
    /// To the student when their enrolment becomes permanent
    Upgrade,
    /// To the student when their temporary enrolment ends
    Expire,
    /// Periodic reminder to the student
    Reminder,
}

impl EmailKind {
    pub const ALL: [EmailKind; 5] = [
        EmailKind::StudentInit,
        EmailKind::TeacherInit,
        EmailKind::Upgrade,
        EmailKind::Expire,
        EmailKind::Reminder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::StudentInit => "student_init",
            EmailKind::TeacherInit => "teacher_init",
            EmailKind::Upgrade => "upgrade",
            EmailKind::Expire => "expire",
            EmailKind::Reminder => "reminder",
        }
    }
}

impl std::fmt::Display for EmailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable view of a tracking record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingView {
    pub role_assignment_id: RoleAssignmentId,
    pub role_id: RoleId,
    pub time_start: i64,
    pub time_end: i64,
    pub upgraded: bool,
    pub last_reminder_at: Option<i64>,
    /// Rounded days until `time_end` at the time the view was built
    pub days_left: i64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_healthy: bool,
    pub host_healthy: bool,
    pub enabled: bool,
    pub marker_role_id: Option<RoleId>,
    pub tracked_count: usize,
}

/// Client role (for authorization)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Read-only: ping, health, listing, event subscription
    Observer,
    /// Host integration or administrator: may deliver events and run jobs
    Admin,
}

impl ClientRole {
    pub fn can_mutate(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_timestamp_defaults_when_missing() {
        let json = r#"{
            "actor_id": 2, "subject_id": 10, "context_id": 30, "course_id": 4,
            "role_id": 9, "role_assignment_id": 77
        }"#;
        let ev: RoleUnassigned = serde_json::from_str(json).unwrap();
        assert_eq!(ev.role_assignment_id, RoleAssignmentId::new(77));
        assert!(ev.timestamp > 0);
    }

    #[test]
    fn email_kind_names() {
        assert_eq!(EmailKind::StudentInit.as_str(), "student_init");
        assert_eq!(
            serde_json::to_string(&EmailKind::TeacherInit).unwrap(),
            "\"teacher_init\""
        );
        assert_eq!(EmailKind::ALL.len(), 5);
    }

    #[test]
    fn only_admin_can_mutate() {
        assert!(ClientRole::Admin.can_mutate());
        assert!(!ClientRole::Observer.can_mutate());
    }
}
