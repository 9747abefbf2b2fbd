//! Store trait definitions

use serde::{Deserialize, Serialize};
use tenrol_api::TrackingView;
use tenrol_util::{RoleAssignmentId, RoleId, TrackingId};

use crate::{AuditEvent, StoreResult};

/// A temporary enrolment being tracked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub id: TrackingId,
    pub role_assignment_id: RoleAssignmentId,
    /// Marker role in effect when the record was created
    pub role_id: RoleId,
    /// Unix seconds
    pub time_start: i64,
    /// Unix seconds, `time_start + duration`
    pub time_end: i64,
    pub upgraded: bool,
    pub last_reminder_at: Option<i64>,
}

impl TrackingRecord {
    /// Whether the window has closed without an upgrade
    pub fn is_expired_at(&self, now: i64) -> bool {
        !self.upgraded && self.time_end <= now
    }

    /// Whether the window is still open and not upgraded
    pub fn is_active_at(&self, now: i64) -> bool {
        !self.upgraded && self.time_end > now
    }

    pub fn to_view(&self, now: i64) -> TrackingView {
        TrackingView {
            role_assignment_id: self.role_assignment_id,
            role_id: self.role_id,
            time_start: self.time_start,
            time_end: self.time_end,
            upgraded: self.upgraded,
            last_reminder_at: self.last_reminder_at,
            days_left: tenrol_util::days_left(self.time_end, now),
        }
    }
}

/// Fields for a record that has not been stored yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrackingRecord {
    pub role_assignment_id: RoleAssignmentId,
    pub role_id: RoleId,
    pub time_start: i64,
    pub time_end: i64,
}

impl NewTrackingRecord {
    /// A window of `duration_seconds` starting at `time_start`.
    /// The end saturates at `i64::MAX`.
    pub fn starting_at(
        role_assignment_id: RoleAssignmentId,
        role_id: RoleId,
        time_start: i64,
        duration_seconds: i64,
    ) -> Self {
        Self {
            role_assignment_id,
            role_id,
            time_start,
            time_end: time_start.saturating_add(duration_seconds),
        }
    }
}

/// Typed selection over tracking records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingFilter {
    /// Records created for a marker role other than this one
    RoleOtherThan(RoleId),
    /// Not upgraded and `time_end <= now`
    ExpiredAt(i64),
    /// Not upgraded and `time_end > now`
    ActiveAt(i64),
}

impl TrackingFilter {
    pub fn matches(&self, record: &TrackingRecord) -> bool {
        match *self {
            TrackingFilter::RoleOtherThan(role) => record.role_id != role,
            TrackingFilter::ExpiredAt(now) => record.is_expired_at(now),
            TrackingFilter::ActiveAt(now) => record.is_active_at(now),
        }
    }
}

/// Main store trait
pub trait Store: Send + Sync {
    // Tracking records

    /// Insert a record; fails with `AlreadyTracked` if the role assignment has one
    fn create_tracking(&self, record: NewTrackingRecord) -> StoreResult<TrackingRecord>;

    /// Look up the record for a role assignment
    fn get_by_role_assignment(
        &self,
        role_assignment_id: RoleAssignmentId,
    ) -> StoreResult<Option<TrackingRecord>>;

    /// Overwrite the mutable fields of an existing record
    fn update_tracking(&self, record: &TrackingRecord) -> StoreResult<()>;

    /// Delete by record id. Returns whether a row was removed.
    fn delete_tracking(&self, id: TrackingId) -> StoreResult<bool>;

    /// Delete the record for a role assignment. Returns whether a row was removed.
    fn delete_by_role_assignment(&self, role_assignment_id: RoleAssignmentId) -> StoreResult<bool>;

    /// All records, oldest first
    fn list_tracking(&self) -> StoreResult<Vec<TrackingRecord>>;

    /// Records matching a filter, oldest first
    fn list_where(&self, filter: TrackingFilter) -> StoreResult<Vec<TrackingRecord>>;

    /// Bulk delete. Returns the number of rows removed.
    fn delete_where(&self, filter: TrackingFilter) -> StoreResult<usize>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
