//! Shared fixtures for engine and sweep tests

use std::cell::RefCell;
use std::sync::Arc;
use tenrol_config::Settings;
use tenrol_host_api::{HostEvent, HostPlatform, MockMailer, MockPlatform};
use tenrol_store::SqliteStore;
use tenrol_util::{ContextId, CourseId, RoleAssignmentId, RoleId, UserId};
use tokio::sync::mpsc;

use crate::{CoreEvent, LifecycleEngine};

pub const MARKER: RoleId = RoleId::new(9);
pub const STUDENT_ROLE: RoleId = RoleId::new(5);
pub const STUDENT_ID: UserId = UserId::new(100);
pub const TEACHER_ID: UserId = UserId::new(200);
pub const COURSE: CourseId = CourseId::new(2);
pub const CONTEXT: ContextId = ContextId::new(20);

/// Engine wired to an in-memory store, mock LMS and mock mailer
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub host: Arc<MockPlatform>,
    pub mailer: Arc<MockMailer>,
    pub engine: LifecycleEngine,
    pub settings: Settings,
    rx: RefCell<mpsc::UnboundedReceiver<HostEvent>>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let host = Arc::new(MockPlatform::new());
        let mailer = Arc::new(MockMailer::new());

        host.add_course(COURSE.get(), "Algebra", CONTEXT.get());
        host.add_user(1, "Admin", "User");
        host.add_user(STUDENT_ID.get(), "Sam", "Student");
        host.add_user(TEACHER_ID.get(), "Terry", "Teacher");
        host.enrol(COURSE, STUDENT_ID);

        let rx = RefCell::new(host.subscribe());
        let engine = LifecycleEngine::new(store.clone(), host.clone(), mailer.clone());

        let mut settings = Settings::default();
        settings.enrolments.marker_role = Some(MARKER);

        Self {
            store,
            host,
            mailer,
            engine,
            settings,
            rx,
        }
    }

    /// Teacher grants a role in the course context
    pub fn grant(&self, role: RoleId, user: UserId, timestamp: i64) -> RoleAssignmentId {
        self.host
            .assign_role(role, user, CONTEXT, TEACHER_ID, timestamp)
            .unwrap()
            .id
    }

    /// Pending host events, without handling them
    pub fn host_events(&self) -> Vec<HostEvent> {
        let mut rx = self.rx.borrow_mut();
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    pub fn dispatch(&self, event: &HostEvent) -> Vec<CoreEvent> {
        match event {
            HostEvent::RoleAssigned(ev) => self.engine.on_role_assigned(&self.settings, ev),
            HostEvent::RoleUnassigned(ev) => self.engine.on_role_unassigned(&self.settings, ev),
        }
        .unwrap()
    }

    /// Handle host events until the channel is quiet
    pub fn pump(&self) -> Vec<CoreEvent> {
        let mut out = Vec::new();
        loop {
            let pending = self.host_events();
            if pending.is_empty() {
                return out;
            }
            for ev in &pending {
                out.extend(self.dispatch(ev));
            }
        }
    }
}
