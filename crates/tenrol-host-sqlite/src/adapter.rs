//! SQLite host platform implementation

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tenrol_api::{RoleAssigned, RoleUnassigned};
use tenrol_host_api::{
    CourseInfo, EnrolmentInstance, HostError, HostEvent, HostPlatform, HostResult, RoleAssignment,
    UserProfile,
};
use tenrol_util::{ContextId, CourseId, EnrolInstanceId, RoleAssignmentId, RoleId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const ASSIGNMENT_COLUMNS: &str = "id, role_id, context_id, user_id, modifier_id, time_modified";

pub(crate) fn db_err(e: rusqlite::Error) -> HostError {
    HostError::Database(e.to_string())
}

fn row_to_assignment(row: &Row<'_>) -> rusqlite::Result<RoleAssignment> {
    Ok(RoleAssignment {
        id: RoleAssignmentId::new(row.get(0)?),
        role_id: RoleId::new(row.get(1)?),
        context_id: ContextId::new(row.get(2)?),
        user_id: UserId::new(row.get(3)?),
        modifier_id: UserId::new(row.get(4)?),
        time_modified: row.get(5)?,
    })
}

/// LMS host backed by a SQLite database
pub struct SqlitePlatform {
    pub(crate) conn: Mutex<Connection>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
    event_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<HostEvent>>>>,
}

impl SqlitePlatform {
    /// Open or create the host database at the given path
    pub fn open(path: impl AsRef<Path>) -> HostResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory host (for testing)
    pub fn in_memory() -> HostResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> HostResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            conn: Mutex::new(conn),
            event_tx: tx,
            event_rx: Arc::new(Mutex::new(Some(rx))),
        };
        host.init_schema()?;
        Ok(host)
    }

    fn init_schema(&self) -> HostResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                firstname TEXT NOT NULL,
                lastname TEXT NOT NULL,
                email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS courses (
                id INTEGER PRIMARY KEY,
                fullname TEXT NOT NULL
            );

            -- One permission context per course
            CREATE TABLE IF NOT EXISTS contexts (
                id INTEGER PRIMARY KEY,
                course_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS role_assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role_id INTEGER NOT NULL,
                context_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                modifier_id INTEGER NOT NULL,
                time_modified INTEGER NOT NULL
            );

            -- Enrolment methods configured per course
            CREATE TABLE IF NOT EXISTS enrol (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                course_id INTEGER NOT NULL,
                method TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_enrolments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                enrol_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                UNIQUE (enrol_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS mail_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                to_user INTEGER NOT NULL,
                to_address TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                queued_at INTEGER NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_ra_user_context ON role_assignments(user_id, context_id);
            CREATE INDEX IF NOT EXISTS idx_ra_role ON role_assignments(role_id);
            CREATE INDEX IF NOT EXISTS idx_enrol_course ON enrol(course_id);
            "#,
        )
        .map_err(db_err)?;

        debug!("Host schema initialized");
        Ok(())
    }

    /// Insert or replace a user
    pub fn add_user(&self, user: &UserProfile) -> HostResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, firstname, lastname, email) VALUES (?, ?, ?, ?)",
            params![user.id.get(), user.firstname, user.lastname, user.email],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert a course, its context, and a manual enrolment method
    pub fn add_course(&self, course: &CourseInfo, context: ContextId) -> HostResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO courses (id, fullname) VALUES (?, ?)",
            params![course.id.get(), course.fullname],
        )
        .map_err(db_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO contexts (id, course_id) VALUES (?, ?)",
            params![context.get(), course.id.get()],
        )
        .map_err(db_err)?;
        conn.execute(
            r#"
            INSERT INTO enrol (course_id, method)
            SELECT ?1, ?2
            WHERE NOT EXISTS (SELECT 1 FROM enrol WHERE course_id = ?1 AND method = ?2)
            "#,
            params![course.id.get(), tenrol_host_api::MANUAL_ENROL_METHOD],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Enrol a user through an enrolment instance
    pub fn enrol(&self, instance: EnrolInstanceId, user: UserId) -> HostResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO user_enrolments (enrol_id, user_id) VALUES (?, ?)",
            params![instance.get(), user.get()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Whether the user has any enrolment in the course
    pub fn is_enrolled(&self, course: CourseId, user: UserId) -> HostResult<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                r#"
                SELECT ue.id FROM user_enrolments ue
                JOIN enrol e ON e.id = ue.enrol_id
                WHERE e.course_id = ? AND ue.user_id = ?
                LIMIT 1
                "#,
                params![course.get(), user.get()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    fn query_assignments(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> HostResult<Vec<RoleAssignment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM role_assignments WHERE {} ORDER BY id ASC",
                ASSIGNMENT_COLUMNS, clause
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params, row_to_assignment).map_err(db_err)?;

        let mut assignments = Vec::new();
        for row in rows {
            assignments.push(row.map_err(db_err)?);
        }
        Ok(assignments)
    }

    fn course_of(conn: &Connection, context: ContextId) -> HostResult<Option<CourseId>> {
        let course: Option<i64> = conn
            .query_row(
                "SELECT course_id FROM contexts WHERE id = ?",
                [context.get()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(course.map(CourseId::new))
    }

    /// Delete one assignment and report it on the event channel
    fn delete_and_emit(
        &self,
        conn: &Connection,
        assignment: &RoleAssignment,
        actor: UserId,
    ) -> HostResult<()> {
        conn.execute(
            "DELETE FROM role_assignments WHERE id = ?",
            [assignment.id.get()],
        )
        .map_err(db_err)?;

        let course_id = match Self::course_of(conn, assignment.context_id)? {
            Some(course) => course,
            None => {
                warn!(context_id = %assignment.context_id, "Removed assignment in unknown context");
                CourseId::new(0)
            }
        };

        info!(
            role_assignment_id = %assignment.id,
            role_id = %assignment.role_id,
            user_id = %assignment.user_id,
            "Role assignment removed"
        );
        let _ = self.event_tx.send(HostEvent::RoleUnassigned(RoleUnassigned {
            actor_id: actor,
            subject_id: assignment.user_id,
            context_id: assignment.context_id,
            course_id,
            role_id: assignment.role_id,
            role_assignment_id: assignment.id,
            timestamp: tenrol_util::unix_now(),
        }));
        Ok(())
    }
}

impl HostPlatform for SqlitePlatform {
    fn assignments_for_user(
        &self,
        user: UserId,
        context: ContextId,
    ) -> HostResult<Vec<RoleAssignment>> {
        self.query_assignments(
            "user_id = ? AND context_id = ?",
            &[&user.get(), &context.get()],
        )
    }

    fn assignments_for_role(&self, role: RoleId) -> HostResult<Vec<RoleAssignment>> {
        self.query_assignments("role_id = ?", &[&role.get()])
    }

    fn assignments_for_role_in_context(
        &self,
        role: RoleId,
        context: ContextId,
    ) -> HostResult<Vec<RoleAssignment>> {
        self.query_assignments(
            "role_id = ? AND context_id = ?",
            &[&role.get(), &context.get()],
        )
    }

    fn get_assignment(&self, id: RoleAssignmentId) -> HostResult<Option<RoleAssignment>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM role_assignments WHERE id = ?",
                ASSIGNMENT_COLUMNS
            ),
            [id.get()],
            row_to_assignment,
        )
        .optional()
        .map_err(db_err)
    }

    fn assign_role(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        actor: UserId,
        timestamp: i64,
    ) -> HostResult<RoleAssignment> {
        let conn = self.conn.lock().unwrap();
        let course_id =
            Self::course_of(&conn, context)?.ok_or(HostError::UnknownContext(context))?;

        conn.execute(
            r#"
            INSERT INTO role_assignments (role_id, context_id, user_id, modifier_id, time_modified)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![role.get(), context.get(), user.get(), actor.get(), timestamp],
        )
        .map_err(db_err)?;

        let assignment = RoleAssignment {
            id: RoleAssignmentId::new(conn.last_insert_rowid()),
            role_id: role,
            context_id: context,
            user_id: user,
            modifier_id: actor,
            time_modified: timestamp,
        };

        info!(
            role_assignment_id = %assignment.id,
            role_id = %role,
            user_id = %user,
            "Role assigned"
        );
        let _ = self.event_tx.send(HostEvent::RoleAssigned(RoleAssigned {
            actor_id: actor,
            subject_id: user,
            context_id: context,
            course_id,
            role_id: role,
            role_assignment_id: assignment.id,
            timestamp,
        }));

        Ok(assignment)
    }

    fn remove_assignment(
        &self,
        id: RoleAssignmentId,
        actor: UserId,
    ) -> HostResult<Option<RoleAssignment>> {
        let conn = self.conn.lock().unwrap();
        let assignment = conn
            .query_row(
                &format!(
                    "SELECT {} FROM role_assignments WHERE id = ?",
                    ASSIGNMENT_COLUMNS
                ),
                [id.get()],
                row_to_assignment,
            )
            .optional()
            .map_err(db_err)?;

        match assignment {
            Some(assignment) => {
                self.delete_and_emit(&conn, &assignment, actor)?;
                Ok(Some(assignment))
            }
            None => Ok(None),
        }
    }

    fn unassign_role(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        actor: UserId,
    ) -> HostResult<Vec<RoleAssignment>> {
        let matching = self.query_assignments(
            "role_id = ? AND user_id = ? AND context_id = ?",
            &[&role.get(), &user.get(), &context.get()],
        )?;

        let conn = self.conn.lock().unwrap();
        for assignment in &matching {
            self.delete_and_emit(&conn, assignment, actor)?;
        }
        Ok(matching)
    }

    fn enrolment_instances(&self, course: CourseId) -> HostResult<Vec<EnrolmentInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, course_id, method FROM enrol WHERE course_id = ? ORDER BY id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([course.get()], |row| {
                Ok(EnrolmentInstance {
                    id: EnrolInstanceId::new(row.get(0)?),
                    course_id: CourseId::new(row.get(1)?),
                    method: row.get(2)?,
                })
            })
            .map_err(db_err)?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row.map_err(db_err)?);
        }
        Ok(instances)
    }

    fn course_for_context(&self, context: ContextId) -> HostResult<Option<CourseId>> {
        let conn = self.conn.lock().unwrap();
        Self::course_of(&conn, context)
    }

    fn user(&self, id: UserId) -> HostResult<Option<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, firstname, lastname, email FROM users WHERE id = ?",
            [id.get()],
            |row| {
                Ok(UserProfile {
                    id: UserId::new(row.get(0)?),
                    firstname: row.get(1)?,
                    lastname: row.get(2)?,
                    email: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn course(&self, id: CourseId) -> HostResult<Option<CourseInfo>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, fullname FROM courses WHERE id = ?",
            [id.get()],
            |row| {
                Ok(CourseInfo {
                    id: CourseId::new(row.get(0)?),
                    fullname: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn unenrol(&self, instance: &EnrolmentInstance, user: UserId) -> HostResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM user_enrolments WHERE enrol_id = ? AND user_id = ?",
                params![instance.id.get(), user.get()],
            )
            .map_err(db_err)?;

        if removed > 0 {
            info!(user_id = %user, enrol_id = %instance.id, method = %instance.method, "User unenrolled");
        }
        Ok(removed > 0)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        match self.event_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("Host events already subscribed, returning a closed channel");
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            }
        }
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Host database lock poisoned");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SqlitePlatform {
        let host = SqlitePlatform::in_memory().unwrap();
        host.add_user(&UserProfile {
            id: UserId::new(5),
            firstname: "Sam".into(),
            lastname: "Student".into(),
            email: "sam@example.org".into(),
        })
        .unwrap();
        host.add_course(
            &CourseInfo {
                id: CourseId::new(2),
                fullname: "Algebra".into(),
            },
            ContextId::new(20),
        )
        .unwrap();
        host
    }

    #[test]
    fn test_directory_lookups() {
        let host = setup();
        assert!(host.is_healthy());
        assert_eq!(host.user(UserId::new(5)).unwrap().unwrap().fullname(), "Sam Student");
        assert!(host.user(UserId::new(6)).unwrap().is_none());
        assert_eq!(host.course(CourseId::new(2)).unwrap().unwrap().fullname, "Algebra");
        assert_eq!(
            host.course_for_context(ContextId::new(20)).unwrap(),
            Some(CourseId::new(2))
        );
    }

    #[test]
    fn test_assign_and_query() {
        let host = setup();
        let mut rx = host.subscribe();
        let ctx = ContextId::new(20);

        let ra = host
            .assign_role(RoleId::new(9), UserId::new(5), ctx, UserId::new(3), 1_000)
            .unwrap();
        host.assign_role(RoleId::new(5), UserId::new(5), ctx, UserId::new(3), 1_100)
            .unwrap();

        assert!(matches!(rx.try_recv(), Ok(HostEvent::RoleAssigned(ev)) if ev.role_assignment_id == ra.id && ev.course_id == CourseId::new(2)));
        assert_eq!(host.assignments_for_user(UserId::new(5), ctx).unwrap().len(), 2);
        assert_eq!(host.assignments_for_role(RoleId::new(9)).unwrap(), vec![ra.clone()]);
        assert_eq!(
            host.assignments_for_role_in_context(RoleId::new(9), ContextId::new(99))
                .unwrap()
                .len(),
            0
        );
        assert_eq!(host.get_assignment(ra.id).unwrap(), Some(ra));
    }

    #[test]
    fn test_assign_unknown_context() {
        let host = setup();
        let result = host.assign_role(RoleId::new(9), UserId::new(5), ContextId::new(99), UserId::new(3), 0);
        assert!(matches!(result, Err(HostError::UnknownContext(_))));
    }

    #[test]
    fn test_removal_emits_unassigned() {
        let host = setup();
        let mut rx = host.subscribe();
        let ctx = ContextId::new(20);
        let ra = host
            .assign_role(RoleId::new(9), UserId::new(5), ctx, UserId::new(3), 1_000)
            .unwrap();
        let _ = rx.try_recv();

        let removed = host.remove_assignment(ra.id, UserId::new(1)).unwrap();
        assert_eq!(removed.map(|a| a.id), Some(ra.id));
        match rx.try_recv() {
            Ok(HostEvent::RoleUnassigned(ev)) => {
                assert_eq!(ev.role_assignment_id, ra.id);
                assert_eq!(ev.actor_id, UserId::new(1));
                assert_eq!(ev.course_id, CourseId::new(2));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(host.remove_assignment(ra.id, UserId::new(1)).unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unassign_role() {
        let host = setup();
        let ctx = ContextId::new(20);
        host.assign_role(RoleId::new(9), UserId::new(5), ctx, UserId::new(3), 0)
            .unwrap();
        host.assign_role(RoleId::new(5), UserId::new(5), ctx, UserId::new(3), 0)
            .unwrap();

        let removed = host
            .unassign_role(RoleId::new(9), UserId::new(5), ctx, UserId::new(3))
            .unwrap();
        assert_eq!(removed.len(), 1);
        let left = host.assignments_for_user(UserId::new(5), ctx).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].role_id, RoleId::new(5));
    }

    #[test]
    fn test_unenrol_idempotent() {
        let host = setup();
        let manual = host
            .enrolment_instances(CourseId::new(2))
            .unwrap()
            .into_iter()
            .find(|i| i.is_manual())
            .unwrap();
        host.enrol(manual.id, UserId::new(5)).unwrap();
        assert!(host.is_enrolled(CourseId::new(2), UserId::new(5)).unwrap());

        assert!(host.unenrol(&manual, UserId::new(5)).unwrap());
        assert!(!host.unenrol(&manual, UserId::new(5)).unwrap());
        assert!(!host.is_enrolled(CourseId::new(2), UserId::new(5)).unwrap());
    }

    #[test]
    fn test_add_course_twice_keeps_one_manual_instance() {
        let host = setup();
        host.add_course(
            &CourseInfo {
                id: CourseId::new(2),
                fullname: "Algebra II".into(),
            },
            ContextId::new(20),
        )
        .unwrap();

        let instances = host.enrolment_instances(CourseId::new(2)).unwrap();
        assert_eq!(instances.iter().filter(|i| i.is_manual()).count(), 1);
        assert_eq!(host.course(CourseId::new(2)).unwrap().unwrap().fullname, "Algebra II");

        host.enrol(instances[0].id, UserId::new(5)).unwrap();
        assert!(host.unenrol(&instances[0], UserId::new(5)).unwrap());
        assert!(!host.is_enrolled(CourseId::new(2), UserId::new(5)).unwrap());
    }

    #[test]
    fn test_second_subscribe_is_closed() {
        let host = setup();
        let _first = host.subscribe();
        let mut second = host.subscribe();
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn test_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.db");
        {
            let host = SqlitePlatform::open(&path).unwrap();
            host.add_course(
                &CourseInfo {
                    id: CourseId::new(2),
                    fullname: "Algebra".into(),
                },
                ContextId::new(20),
            )
            .unwrap();
        }
        let host = SqlitePlatform::open(&path).unwrap();
        assert!(host.course(CourseId::new(2)).unwrap().is_some());
    }
}
