//! Integration tests for tenrold
//!
//! These drive the engine against the on-disk SQLite host adapter and
//! tracking store, feeding host events back in the way the daemon does.

use std::sync::Arc;
use tenrol_api::{Command, EventPayload, ResponsePayload, RoleAssigned};
use tenrol_config::{parse_config, Settings};
use tenrol_core::{CoreEvent, LifecycleEngine};
use tenrol_host_api::{CourseInfo, HostEvent, HostPlatform, UserProfile};
use tenrol_host_sqlite::SqlitePlatform;
use tenrol_ipc::{IpcClient, IpcServer, ServerMessage};
use tenrol_store::{NewTrackingRecord, SqliteStore, Store};
use tenrol_util::{ContextId, CourseId, RoleAssignmentId, RoleId, UserId, SECONDS_PER_DAY};
use tempfile::TempDir;
use tokio::sync::mpsc;

const MARKER: RoleId = RoleId::new(9);
const STUDENT_ROLE: RoleId = RoleId::new(5);
const STUDENT: UserId = UserId::new(100);
const TEACHER: UserId = UserId::new(200);
const COURSE: CourseId = CourseId::new(2);
const CONTEXT: ContextId = ContextId::new(20);
const T0: i64 = 1_700_000_000;

struct Fixture {
    _dir: TempDir,
    host: Arc<SqlitePlatform>,
    store: Arc<SqliteStore>,
    engine: LifecycleEngine,
    settings: Settings,
    host_events: mpsc::UnboundedReceiver<HostEvent>,
}

fn user(id: UserId, first: &str, last: &str) -> UserProfile {
    UserProfile {
        id,
        firstname: first.into(),
        lastname: last.into(),
        email: format!("{}@example.org", first.to_lowercase()),
    }
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(SqlitePlatform::open(dir.path().join("host.db")).unwrap());
        let store = Arc::new(SqliteStore::open(dir.path().join("tenrold.db")).unwrap());

        host.add_user(&user(UserId::new(1), "Admin", "User")).unwrap();
        host.add_user(&user(STUDENT, "Sam", "Student")).unwrap();
        host.add_user(&user(TEACHER, "Terry", "Teacher")).unwrap();
        host.add_course(
            &CourseInfo {
                id: COURSE,
                fullname: "Algebra".into(),
            },
            CONTEXT,
        )
        .unwrap();
        let manual = host.enrolment_instances(COURSE).unwrap()[0].id;
        host.enrol(manual, STUDENT).unwrap();

        let host_events = host.subscribe();
        let engine = LifecycleEngine::new(store.clone(), host.clone(), host.clone());
        let mut settings = Settings::default();
        settings.enrolments.marker_role = Some(MARKER);

        Self {
            _dir: dir,
            host,
            store,
            engine,
            settings,
            host_events,
        }
    }

    /// Handle host events until the channel is quiet, as the daemon loop does
    fn pump(&mut self) -> Vec<CoreEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.host_events.try_recv() {
            let handled = match &event {
                HostEvent::RoleAssigned(ev) => self.engine.on_role_assigned(&self.settings, ev),
                HostEvent::RoleUnassigned(ev) => self.engine.on_role_unassigned(&self.settings, ev),
            };
            out.extend(handled.unwrap());
        }
        out
    }

    fn grant(&mut self, role: RoleId, at: i64) -> (RoleAssignmentId, Vec<CoreEvent>) {
        let id = self
            .host
            .assign_role(role, STUDENT, CONTEXT, TEACHER, at)
            .unwrap()
            .id;
        (id, self.pump())
    }

    fn enrolled(&self) -> bool {
        self.host.is_enrolled(COURSE, STUDENT).unwrap()
    }

    fn subjects(&self) -> Vec<String> {
        self.host
            .outbox()
            .unwrap()
            .into_iter()
            .map(|m| m.subject)
            .collect()
    }
}

#[test]
fn test_temporary_enrolment_expires() {
    let mut fx = Fixture::new();

    let (ra, events) = fx.grant(MARKER, T0);
    assert!(events.contains(&CoreEvent::TrackingStarted {
        role_assignment_id: ra,
        user_id: STUDENT,
        time_end: T0 + 14 * SECONDS_PER_DAY,
    }));
    assert_eq!(
        fx.subjects(),
        vec![
            "Temporary enrolment granted for Algebra".to_string(),
            "Temporary enrolment granted to Sam Student for Algebra".to_string(),
        ]
    );

    // Halfway through the window the reminder reports the days left
    let reminded = fx
        .engine
        .run_reminder_sweep(&fx.settings, T0 + 7 * SECONDS_PER_DAY)
        .unwrap();
    assert_eq!(reminded.processed, 1);
    let outbox = fx.host.outbox().unwrap();
    let reminder = outbox.last().unwrap();
    assert_eq!(reminder.to_user, STUDENT);
    assert!(reminder.body.contains("will expire in 7 days"));

    // Nothing is due before the end time
    let early = fx
        .engine
        .run_expiration_sweep(&fx.settings, T0 + 13 * SECONDS_PER_DAY)
        .unwrap();
    assert_eq!(early.processed, 0);

    let swept = fx
        .engine
        .run_expiration_sweep(&fx.settings, T0 + 15 * SECONDS_PER_DAY)
        .unwrap();
    assert_eq!(swept.processed, 1);
    // Handled inline; the host's own unassign event is a no-op
    assert!(fx.pump().is_empty());

    let events = swept.events;
    assert!(events.contains(&CoreEvent::Expired {
        role_assignment_id: ra,
        user_id: STUDENT,
    }));
    assert!(events.contains(&CoreEvent::Unenrolled {
        user_id: STUDENT,
        course_id: COURSE,
    }));

    assert!(!fx.enrolled());
    assert!(fx.store.list_tracking().unwrap().is_empty());
    assert_eq!(fx.host.get_assignment(ra).unwrap(), None);
    assert_eq!(
        fx.subjects().last().map(String::as_str),
        Some("Temporary enrolment for Algebra expired")
    );

    // A second sweep finds nothing left to do
    let again = fx
        .engine
        .run_expiration_sweep(&fx.settings, T0 + 16 * SECONDS_PER_DAY)
        .unwrap();
    assert_eq!(again.processed, 0);
    assert!(fx.pump().is_empty());
}

#[test]
fn test_upgrade_keeps_enrolment() {
    let mut fx = Fixture::new();

    let (marker_ra, _) = fx.grant(MARKER, T0);
    let (_, events) = fx.grant(STUDENT_ROLE, T0 + SECONDS_PER_DAY);

    assert!(events.contains(&CoreEvent::Upgraded {
        role_assignment_id: marker_ra,
        user_id: STUDENT,
    }));
    // The marker removal comes back as an unassign but is not an expiry
    assert!(!events.iter().any(|e| matches!(e, CoreEvent::Expired { .. })));
    assert!(!events.iter().any(|e| matches!(e, CoreEvent::Unenrolled { .. })));

    assert!(fx.enrolled());
    assert_eq!(fx.host.get_assignment(marker_ra).unwrap(), None);
    assert!(fx.store.list_tracking().unwrap().is_empty());

    let subjects = fx.subjects();
    assert_eq!(
        subjects.last().map(String::as_str),
        Some("Temporary enrolment for Algebra upgraded!")
    );
    assert!(!subjects.iter().any(|s| s.contains("expired")));
}

#[test]
fn test_marker_on_existing_student_is_revoked() {
    let mut fx = Fixture::new();

    fx.grant(STUDENT_ROLE, T0);
    let (marker_ra, events) = fx.grant(MARKER, T0 + 60);

    assert!(events.contains(&CoreEvent::AssignmentRejected {
        user_id: STUDENT,
        context_id: CONTEXT,
    }));
    assert_eq!(fx.host.get_assignment(marker_ra).unwrap(), None);
    assert!(fx.store.list_tracking().unwrap().is_empty());
    assert!(fx.host.outbox().unwrap().is_empty());
    assert!(fx.enrolled());
}

#[test]
fn test_backfill_adopts_and_is_idempotent() {
    let mut fx = Fixture::new();

    // Assignment made while the feature was off
    fx.settings.enrolments.enabled = false;
    let (ra, events) = fx.grant(MARKER, T0);
    assert!(events.is_empty());

    fx.settings.enrolments.enabled = true;
    fx.settings.existing_assignments.manage = true;

    let first = fx.engine.run_backfill(&fx.settings, T0 + 100).unwrap();
    assert_eq!((first.purged, first.created), (0, 1));

    let record = fx.store.get_by_role_assignment(ra).unwrap().unwrap();
    assert_eq!(record.time_start, T0);

    let second = fx.engine.run_backfill(&fx.settings, T0 + 200).unwrap();
    assert_eq!((second.purged, second.created), (0, 0));

    // Switching the marker purges records of the old one
    fx.settings.enrolments.marker_role = Some(RoleId::new(10));
    let switched = fx.engine.run_backfill(&fx.settings, T0 + 300).unwrap();
    assert_eq!((switched.purged, switched.created), (1, 0));
    assert!(fx.store.list_tracking().unwrap().is_empty());
}

#[test]
fn test_reschedule_after_duration_change() {
    let mut fx = Fixture::new();
    let (ra, _) = fx.grant(MARKER, T0);

    fx.settings.enrolments.duration_seconds = 3 * SECONDS_PER_DAY;
    let outcome = fx.engine.reschedule(&fx.settings).unwrap();
    assert_eq!(outcome.processed, 1);

    let record = fx.store.get_by_role_assignment(ra).unwrap().unwrap();
    assert_eq!(record.time_end, T0 + 3 * SECONDS_PER_DAY);
}

#[test]
fn test_tracking_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tenrold.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        let mut record = store
            .create_tracking(NewTrackingRecord::starting_at(
                RoleAssignmentId::new(7),
                MARKER,
                T0,
                14 * SECONDS_PER_DAY,
            ))
            .unwrap();
        record.last_reminder_at = Some(T0 + 2 * SECONDS_PER_DAY);
        store.update_tracking(&record).unwrap();
    }

    let reopened = SqliteStore::open(&path).unwrap();
    let record = reopened
        .get_by_role_assignment(RoleAssignmentId::new(7))
        .unwrap()
        .unwrap();
    assert_eq!(record.time_end, T0 + 14 * SECONDS_PER_DAY);
    assert_eq!(record.last_reminder_at, Some(T0 + 2 * SECONDS_PER_DAY));
    assert!(!record.upgraded);
}

#[test]
fn test_example_config_is_valid() {
    let settings = parse_config(include_str!("../../../config.example.toml")).unwrap();
    assert_eq!(settings.active_marker_role(), Some(MARKER));
    assert_eq!(settings.enrolments.duration_seconds, 14 * SECONDS_PER_DAY);
    assert!(settings.existing_assignments.manage);
}

#[tokio::test]
async fn test_role_assigned_over_ipc() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("tenrold.sock");

    let mut server = IpcServer::new(&socket_path);
    server.start().await.unwrap();
    let server = Arc::new(server);
    let mut messages = server.take_message_receiver().await.unwrap();

    let accept = server.clone();
    tokio::spawn(async move {
        let _ = accept.run().await;
    });

    // Minimal dispatch loop: engine on one side, broadcast on the other
    let dispatch = server.clone();
    tokio::spawn(async move {
        let mut fx = Fixture::new();
        fx.host
            .assign_role(MARKER, STUDENT, CONTEXT, TEACHER, T0)
            .unwrap();
        // Drop the adapter's own copy so the IPC request is the only delivery
        while fx.host_events.try_recv().is_ok() {}

        while let Some(msg) = messages.recv().await {
            let ServerMessage::Request { client_id, request } = msg else {
                continue;
            };
            let payload = match request.command {
                Command::RoleAssigned(ev) => {
                    let events = fx.engine.on_role_assigned(&fx.settings, &ev).unwrap();
                    for event in &events {
                        if let CoreEvent::TrackingStarted {
                            role_assignment_id,
                            user_id,
                            time_end,
                        } = event
                        {
                            dispatch.broadcast_event(tenrol_api::Event::new(
                                EventPayload::TrackingStarted {
                                    role_assignment_id: *role_assignment_id,
                                    user_id: *user_id,
                                    time_end: *time_end,
                                },
                            ));
                        }
                    }
                    ResponsePayload::Handled {
                        changes: events.len(),
                    }
                }
                Command::SubscribeEvents => ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
                _ => ResponsePayload::Pong,
            };
            let response = tenrol_api::Response::success(request.request_id, payload);
            dispatch.send_response(&client_id, response).await.unwrap();
        }
    });

    let watcher = IpcClient::connect(&socket_path).await.unwrap();
    let mut events = watcher.subscribe().await.unwrap();

    let mut client = IpcClient::connect(&socket_path).await.unwrap();
    let payload = client
        .call(Command::RoleAssigned(RoleAssigned {
            actor_id: TEACHER,
            subject_id: STUDENT,
            context_id: CONTEXT,
            course_id: COURSE,
            role_id: MARKER,
            role_assignment_id: RoleAssignmentId::new(1),
            timestamp: T0,
        }))
        .await
        .unwrap();

    // Tracking started plus the two init emails
    assert!(matches!(payload, ResponsePayload::Handled { changes: 3 }));

    let event = events.next().await.unwrap();
    match event.payload {
        EventPayload::TrackingStarted {
            role_assignment_id,
            user_id,
            time_end,
        } => {
            assert_eq!(role_assignment_id, RoleAssignmentId::new(1));
            assert_eq!(user_id, STUDENT);
            assert_eq!(time_end, T0 + 14 * SECONDS_PER_DAY);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
