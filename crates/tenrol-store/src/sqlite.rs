//! SQLite-based store implementation

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tenrol_util::{RoleAssignmentId, RoleId, TrackingId};
use tracing::{debug, warn};

use crate::{
    AuditEvent, NewTrackingRecord, Store, StoreError, StoreResult, TrackingFilter, TrackingRecord,
};

const TRACKING_COLUMNS: &str =
    "id, role_assignment_id, role_id, time_start, time_end, upgraded, last_reminder_at";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- One row per tracked marker-role assignment
            CREATE TABLE IF NOT EXISTS temporary_enrolments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role_assignment_id INTEGER NOT NULL UNIQUE,
                role_id INTEGER NOT NULL,
                time_start INTEGER NOT NULL,
                time_end INTEGER NOT NULL,
                upgraded INTEGER NOT NULL DEFAULT 0,
                last_reminder_at INTEGER,
                CHECK (time_end >= time_start)
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_tracking_time_end ON temporary_enrolments(time_end);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TrackingRecord> {
    Ok(TrackingRecord {
        id: TrackingId::new(row.get(0)?),
        role_assignment_id: RoleAssignmentId::new(row.get(1)?),
        role_id: RoleId::new(row.get(2)?),
        time_start: row.get(3)?,
        time_end: row.get(4)?,
        upgraded: row.get(5)?,
        last_reminder_at: row.get(6)?,
    })
}

/// SQL predicate and its single parameter for a filter
fn filter_clause(filter: TrackingFilter) -> (&'static str, i64) {
    match filter {
        TrackingFilter::RoleOtherThan(role) => ("role_id <> ?1", role.get()),
        TrackingFilter::ExpiredAt(now) => ("upgraded = 0 AND time_end <= ?1", now),
        TrackingFilter::ActiveAt(now) => ("upgraded = 0 AND time_end > ?1", now),
    }
}

impl Store for SqliteStore {
    fn create_tracking(&self, record: NewTrackingRecord) -> StoreResult<TrackingRecord> {
        if record.time_end < record.time_start {
            return Err(StoreError::InvalidRecord(format!(
                "time_end {} precedes time_start {}",
                record.time_end, record.time_start
            )));
        }

        let conn = self.conn.lock().unwrap();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM temporary_enrolments WHERE role_assignment_id = ?",
                [record.role_assignment_id.get()],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::AlreadyTracked(record.role_assignment_id));
        }

        conn.execute(
            r#"
            INSERT INTO temporary_enrolments (role_assignment_id, role_id, time_start, time_end)
            VALUES (?, ?, ?, ?)
            "#,
            params![
                record.role_assignment_id.get(),
                record.role_id.get(),
                record.time_start,
                record.time_end
            ],
        )?;

        let id = TrackingId::new(conn.last_insert_rowid());
        debug!(
            id = %id,
            role_assignment_id = %record.role_assignment_id,
            time_end = record.time_end,
            "Tracking record created"
        );

        Ok(TrackingRecord {
            id,
            role_assignment_id: record.role_assignment_id,
            role_id: record.role_id,
            time_start: record.time_start,
            time_end: record.time_end,
            upgraded: false,
            last_reminder_at: None,
        })
    }

    fn get_by_role_assignment(
        &self,
        role_assignment_id: RoleAssignmentId,
    ) -> StoreResult<Option<TrackingRecord>> {
        let conn = self.conn.lock().unwrap();

        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM temporary_enrolments WHERE role_assignment_id = ?",
                    TRACKING_COLUMNS
                ),
                [role_assignment_id.get()],
                row_to_record,
            )
            .optional()?;

        Ok(record)
    }

    fn update_tracking(&self, record: &TrackingRecord) -> StoreResult<()> {
        if record.time_end < record.time_start {
            return Err(StoreError::InvalidRecord(format!(
                "time_end {} precedes time_start {}",
                record.time_end, record.time_start
            )));
        }

        let conn = self.conn.lock().unwrap();

        let changed = conn.execute(
            r#"
            UPDATE temporary_enrolments
            SET time_start = ?, time_end = ?, upgraded = ?, last_reminder_at = ?
            WHERE id = ?
            "#,
            params![
                record.time_start,
                record.time_end,
                record.upgraded,
                record.last_reminder_at,
                record.id.get()
            ],
        )?;

        if changed == 0 {
            warn!(id = %record.id, "Update for unknown tracking record");
        }
        Ok(())
    }

    fn delete_tracking(&self, id: TrackingId) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM temporary_enrolments WHERE id = ?", [id.get()])?;
        Ok(changed > 0)
    }

    fn delete_by_role_assignment(&self, role_assignment_id: RoleAssignmentId) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM temporary_enrolments WHERE role_assignment_id = ?",
            [role_assignment_id.get()],
        )?;

        if changed > 0 {
            debug!(role_assignment_id = %role_assignment_id, "Tracking record deleted");
        }
        Ok(changed > 0)
    }

    fn list_tracking(&self) -> StoreResult<Vec<TrackingRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM temporary_enrolments ORDER BY id ASC",
            TRACKING_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn list_where(&self, filter: TrackingFilter) -> StoreResult<Vec<TrackingRecord>> {
        let conn = self.conn.lock().unwrap();
        let (clause, param) = filter_clause(filter);

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM temporary_enrolments WHERE {} ORDER BY id ASC",
            TRACKING_COLUMNS, clause
        ))?;
        let rows = stmt.query_map([param], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete_where(&self, filter: TrackingFilter) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let (clause, param) = filter_clause(filter);

        let removed = conn.execute(
            &format!("DELETE FROM temporary_enrolments WHERE {}", clause),
            [param],
        )?;

        debug!(?filter, removed, "Tracking records deleted");
        Ok(removed)
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Local))
                .unwrap_or_else(|_| tenrol_util::now());
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditEventType;
    use tenrol_util::UserId;

    fn new_record(ra: i64, role: i64, start: i64, end: i64) -> NewTrackingRecord {
        NewTrackingRecord {
            role_assignment_id: RoleAssignmentId::new(ra),
            role_id: RoleId::new(role),
            time_start: start,
            time_end: end,
        }
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
    }

    #[test]
    fn test_audit_log() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStarted))
            .unwrap();
        store
            .append_audit(AuditEvent::new(AuditEventType::Upgraded {
                role_assignment_id: RoleAssignmentId::new(4),
                user_id: UserId::new(2),
            }))
            .unwrap();

        let events = store.get_recent_audits(10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, AuditEventType::Upgraded { .. }));
        assert!(matches!(events[1].event, AuditEventType::ServiceStarted));
    }

    #[test]
    fn test_create_and_fetch() {
        let store = SqliteStore::in_memory().unwrap();

        let created = store.create_tracking(new_record(7, 9, 1_000, 2_000)).unwrap();
        assert!(!created.upgraded);
        assert_eq!(created.last_reminder_at, None);

        let fetched = store
            .get_by_role_assignment(RoleAssignmentId::new(7))
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);

        assert!(store
            .get_by_role_assignment(RoleAssignmentId::new(8))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_one_record_per_role_assignment() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_tracking(new_record(7, 9, 1_000, 2_000)).unwrap();

        let dup = store.create_tracking(new_record(7, 9, 1_500, 2_500));
        assert!(matches!(dup, Err(StoreError::AlreadyTracked(ra)) if ra.get() == 7));
        assert_eq!(store.list_tracking().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_inverted_window() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store.create_tracking(new_record(7, 9, 2_000, 1_000));
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_update_tracking() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = store.create_tracking(new_record(7, 9, 1_000, 2_000)).unwrap();

        record.upgraded = true;
        record.last_reminder_at = Some(1_500);
        store.update_tracking(&record).unwrap();

        let fetched = store
            .get_by_role_assignment(RoleAssignmentId::new(7))
            .unwrap()
            .unwrap();
        assert!(fetched.upgraded);
        assert_eq!(fetched.last_reminder_at, Some(1_500));
    }

    #[test]
    fn test_filters() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_tracking(new_record(1, 9, 0, 100)).unwrap();
        store.create_tracking(new_record(2, 9, 0, 200)).unwrap();
        let mut upgraded = store.create_tracking(new_record(3, 9, 0, 50)).unwrap();
        upgraded.upgraded = true;
        store.update_tracking(&upgraded).unwrap();
        store.create_tracking(new_record(4, 5, 0, 300)).unwrap();

        let expired = store.list_where(TrackingFilter::ExpiredAt(100)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].role_assignment_id, RoleAssignmentId::new(1));

        let active = store.list_where(TrackingFilter::ActiveAt(100)).unwrap();
        let ids: Vec<i64> = active.iter().map(|r| r.role_assignment_id.get()).collect();
        assert_eq!(ids, vec![2, 4]);

        let removed = store
            .delete_where(TrackingFilter::RoleOtherThan(RoleId::new(9)))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_tracking().unwrap().len(), 3);
    }

    #[test]
    fn test_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let record = store.create_tracking(new_record(1, 9, 0, 100)).unwrap();
        store.create_tracking(new_record(2, 9, 0, 100)).unwrap();

        assert!(store.delete_tracking(record.id).unwrap());
        assert!(!store.delete_tracking(record.id).unwrap());
        assert!(store
            .delete_by_role_assignment(RoleAssignmentId::new(2))
            .unwrap());
        assert!(!store
            .delete_by_role_assignment(RoleAssignmentId::new(2))
            .unwrap());
        assert!(store.list_tracking().unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenrol.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_tracking(new_record(1, 9, 0, 100)).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_tracking().unwrap().len(), 1);
    }
}
