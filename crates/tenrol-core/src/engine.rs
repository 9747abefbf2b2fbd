//! Lifecycle engine: reactions to role assignment events

use std::sync::Arc;
use tenrol_api::{EmailKind, RoleAssigned, RoleUnassigned};
use tenrol_config::Settings;
use tenrol_host_api::{HostPlatform, Mailer};
use tenrol_store::{AuditEvent, AuditEventType, NewTrackingRecord, Store, StoreError};
use tenrol_util::{CourseId, RoleId, UserId};
use tracing::{debug, info, warn};

use crate::notify::{Parties, Recipient};
use crate::{CoreEvent, EngineResult};

/// The temporary-enrolment state machine
///
/// Every handler takes the current [`Settings`] explicitly, so a reload is
/// just a matter of passing a different snapshot.
pub struct LifecycleEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) host: Arc<dyn HostPlatform>,
    pub(crate) mailer: Arc<dyn Mailer>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        host: Arc<dyn HostPlatform>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            store,
            host,
            mailer,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn host(&self) -> &Arc<dyn HostPlatform> {
        &self.host
    }

    /// A role was granted to a user
    pub fn on_role_assigned(
        &self,
        settings: &Settings,
        event: &RoleAssigned,
    ) -> EngineResult<Vec<CoreEvent>> {
        let Some(marker) = settings.active_marker_role() else {
            debug!(role_assignment_id = %event.role_assignment_id, "Temporary enrolments inactive");
            return Ok(Vec::new());
        };

        if event.role_id == marker {
            self.start_tracking(settings, marker, event)
        } else {
            self.upgrade(settings, marker, event)
        }
    }

    /// A role was removed from a user
    pub fn on_role_unassigned(
        &self,
        settings: &Settings,
        event: &RoleUnassigned,
    ) -> EngineResult<Vec<CoreEvent>> {
        let mut events = Vec::new();

        if settings.active_marker_role() == Some(event.role_id) {
            let record = self.store.get_by_role_assignment(event.role_assignment_id)?;

            if let Some(record) = record.filter(|r| !r.upgraded) {
                info!(
                    role_assignment_id = %event.role_assignment_id,
                    user_id = %event.subject_id,
                    "Temporary enrolment expired"
                );
                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::Expired {
                    role_assignment_id: event.role_assignment_id,
                    user_id: event.subject_id,
                }));
                events.push(CoreEvent::Expired {
                    role_assignment_id: event.role_assignment_id,
                    user_id: event.subject_id,
                });

                events.extend(self.notify(
                    settings,
                    EmailKind::Expire,
                    Recipient::Student,
                    Parties {
                        teacher: event.actor_id,
                        student: event.subject_id,
                        course: event.course_id,
                    },
                    record.time_end,
                    event.timestamp,
                )?);
            }

            // The host may still list the assignment being removed
            let remaining = self
                .host
                .assignments_for_user(event.subject_id, event.context_id)?;
            if remaining
                .iter()
                .all(|a| a.id == event.role_assignment_id)
            {
                events.extend(self.unenrol(event.subject_id, event.course_id)?);
            }
        }

        if self
            .store
            .delete_by_role_assignment(event.role_assignment_id)?
        {
            debug!(role_assignment_id = %event.role_assignment_id, "Stopped tracking");
        }

        Ok(events)
    }

    fn start_tracking(
        &self,
        settings: &Settings,
        marker: RoleId,
        event: &RoleAssigned,
    ) -> EngineResult<Vec<CoreEvent>> {
        if self
            .store
            .get_by_role_assignment(event.role_assignment_id)?
            .is_some()
        {
            debug!(role_assignment_id = %event.role_assignment_id, "Already tracked");
            return Ok(Vec::new());
        }

        let held = self
            .host
            .assignments_for_user(event.subject_id, event.context_id)?;
        let others = held
            .iter()
            .filter(|a| a.id != event.role_assignment_id)
            .count();

        if others > 0 {
            info!(
                user_id = %event.subject_id,
                context_id = %event.context_id,
                other_roles = others,
                "User already holds a role here, revoking marker role"
            );
            self.host
                .remove_assignment(event.role_assignment_id, settings.enrolments.automation_user)?;
            let _ = self
                .store
                .append_audit(AuditEvent::new(AuditEventType::AssignmentRejected {
                    user_id: event.subject_id,
                    context_id: event.context_id,
                    role_assignment_id: event.role_assignment_id,
                }));
            return Ok(vec![CoreEvent::AssignmentRejected {
                user_id: event.subject_id,
                context_id: event.context_id,
            }]);
        }

        let new = NewTrackingRecord::starting_at(
            event.role_assignment_id,
            marker,
            event.timestamp,
            settings.enrolments.duration_seconds,
        );
        let record = match self.store.create_tracking(new) {
            Ok(record) => record,
            Err(StoreError::AlreadyTracked(id)) => {
                debug!(role_assignment_id = %id, "Tracked concurrently");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            role_assignment_id = %record.role_assignment_id,
            user_id = %event.subject_id,
            time_end = %tenrol_util::format_unix(record.time_end),
            "Temporary enrolment started"
        );
        let _ = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::TrackingStarted {
                role_assignment_id: record.role_assignment_id,
                user_id: event.subject_id,
                time_start: record.time_start,
                time_end: record.time_end,
            }));

        let mut events = vec![CoreEvent::TrackingStarted {
            role_assignment_id: record.role_assignment_id,
            user_id: event.subject_id,
            time_end: record.time_end,
        }];

        let parties = Parties {
            teacher: event.actor_id,
            student: event.subject_id,
            course: event.course_id,
        };
        events.extend(self.notify(
            settings,
            EmailKind::StudentInit,
            Recipient::Student,
            parties,
            record.time_end,
            event.timestamp,
        )?);
        events.extend(self.notify(
            settings,
            EmailKind::TeacherInit,
            Recipient::Teacher,
            parties,
            record.time_end,
            event.timestamp,
        )?);

        Ok(events)
    }

    fn upgrade(
        &self,
        settings: &Settings,
        marker: RoleId,
        event: &RoleAssigned,
    ) -> EngineResult<Vec<CoreEvent>> {
        let held = self
            .host
            .assignments_for_role_in_context(marker, event.context_id)?;

        let mut events = Vec::new();
        let mut upgraded_any = false;

        for assignment in held.iter().filter(|a| a.user_id == event.subject_id) {
            let Some(mut record) = self.store.get_by_role_assignment(assignment.id)? else {
                continue;
            };
            if record.upgraded {
                continue;
            }

            record.upgraded = true;
            self.store.update_tracking(&record)?;
            upgraded_any = true;

            info!(
                role_assignment_id = %record.role_assignment_id,
                user_id = %event.subject_id,
                "Temporary enrolment upgraded"
            );
            let _ = self.store.append_audit(AuditEvent::new(AuditEventType::Upgraded {
                role_assignment_id: record.role_assignment_id,
                user_id: event.subject_id,
            }));
            events.push(CoreEvent::Upgraded {
                role_assignment_id: record.role_assignment_id,
                user_id: event.subject_id,
            });

            events.extend(self.notify(
                settings,
                EmailKind::Upgrade,
                Recipient::Student,
                Parties {
                    teacher: event.actor_id,
                    student: event.subject_id,
                    course: event.course_id,
                },
                record.time_end,
                event.timestamp,
            )?);
        }

        if upgraded_any {
            self.host.unassign_role(
                marker,
                event.subject_id,
                event.context_id,
                event.actor_id,
            )?;
        } else {
            debug!(
                user_id = %event.subject_id,
                role_id = %event.role_id,
                "No tracked marker role, ordinary role grant"
            );
        }

        Ok(events)
    }

    /// Remove the user's manual enrolment in a course
    fn unenrol(&self, user: UserId, course: CourseId) -> EngineResult<Option<CoreEvent>> {
        let instances = self.host.enrolment_instances(course)?;
        let Some(manual) = instances.iter().find(|i| i.is_manual()) else {
            warn!(course_id = %course, "Course has no manual enrolment method, cannot unenrol");
            return Ok(None);
        };

        if !self.host.unenrol(manual, user)? {
            debug!(user_id = %user, course_id = %course, "Already unenrolled");
            return Ok(None);
        }

        info!(user_id = %user, course_id = %course, "Unenrolled from course");
        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::Unenrolled {
            user_id: user,
            course_id: course,
        }));
        Ok(Some(CoreEvent::Unenrolled {
            user_id: user,
            course_id: course,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use tenrol_host_api::HostEvent;
    use tenrol_util::{ContextId, RoleAssignmentId};

    #[test]
    fn marker_grant_starts_tracking() {
        let h = Harness::new();
        let t0 = 1_700_000_000;

        let ra = h.grant(MARKER, STUDENT_ID, t0);
        let events = h.pump();

        let record = h.store.get_by_role_assignment(ra).unwrap().unwrap();
        assert_eq!(record.time_start, t0);
        assert_eq!(record.time_end, t0 + 14 * 86_400);
        assert_eq!(record.role_id, MARKER);
        assert!(!record.upgraded);
        assert_eq!(h.store.list_tracking().unwrap().len(), 1);

        assert!(events.contains(&CoreEvent::TrackingStarted {
            role_assignment_id: ra,
            user_id: STUDENT_ID,
            time_end: t0 + 1_209_600,
        }));

        let student_mail = h.mailer.sent_to(STUDENT_ID);
        assert_eq!(student_mail.len(), 1);
        assert_eq!(
            student_mail[0].email.subject,
            "Temporary enrolment granted for Algebra"
        );
        assert!(student_mail[0].email.body.contains("expire in 14 days"));

        let teacher_mail = h.mailer.sent_to(TEACHER_ID);
        assert_eq!(teacher_mail.len(), 1);
        assert!(teacher_mail[0].email.body.starts_with("Dear Terry"));
    }

    #[test]
    fn init_emails_follow_their_switches() {
        let mut h = Harness::new();
        h.settings.emails.teacher_init.enabled = false;

        h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();

        assert_eq!(h.mailer.sent_to(STUDENT_ID).len(), 1);
        assert!(h.mailer.sent_to(TEACHER_ID).is_empty());
    }

    #[test]
    fn marker_grant_with_other_role_is_rejected() {
        let h = Harness::new();
        h.grant(STUDENT_ROLE, STUDENT_ID, 1_000);
        h.pump();

        let ra = h.grant(MARKER, STUDENT_ID, 2_000);
        let events = h.pump();

        assert!(h.store.list_tracking().unwrap().is_empty());
        assert!(h.host.get_assignment(ra).unwrap().is_none());
        assert!(events.contains(&CoreEvent::AssignmentRejected {
            user_id: STUDENT_ID,
            context_id: CONTEXT,
        }));
        assert!(h.mailer.sent().is_empty());
        // Still enrolled through the other role
        assert!(h.host.is_enrolled(COURSE, STUDENT_ID));
    }

    #[test]
    fn redelivered_grant_is_ignored() {
        let h = Harness::new();
        h.grant(MARKER, STUDENT_ID, 1_000);
        let first = h.host_events();
        for ev in &first {
            h.dispatch(ev);
        }
        h.mailer.clear();
        for ev in &first {
            h.dispatch(ev);
        }

        assert_eq!(h.store.list_tracking().unwrap().len(), 1);
        assert!(h.mailer.sent().is_empty());
    }

    #[test]
    fn upgrade_then_unassign_sends_no_expire_email() {
        let h = Harness::new();
        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();
        h.mailer.clear();

        h.grant(STUDENT_ROLE, STUDENT_ID, 2_000);
        let events = h.pump();

        assert!(events.contains(&CoreEvent::Upgraded {
            role_assignment_id: ra,
            user_id: STUDENT_ID,
        }));
        // Marker removed by the engine, and its unassign event deleted the record
        assert!(h.host.get_assignment(ra).unwrap().is_none());
        assert!(h.store.get_by_role_assignment(ra).unwrap().is_none());

        let mail = h.mailer.sent_to(STUDENT_ID);
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].email.subject, "Temporary enrolment for Algebra upgraded!");
        assert!(!events.iter().any(|e| matches!(e, CoreEvent::Expired { .. })));
        assert!(h.host.is_enrolled(COURSE, STUDENT_ID));
    }

    #[test]
    fn upgrade_marks_record_before_removal() {
        let h = Harness::new();
        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();

        let grant = h
            .host
            .assign_role(STUDENT_ROLE, STUDENT_ID, CONTEXT, TEACHER_ID, 2_000)
            .unwrap();
        let assigned = h.host_events();
        assert_eq!(assigned.len(), 1);
        h.dispatch(&assigned[0]);

        let record = h.store.get_by_role_assignment(ra).unwrap().unwrap();
        assert!(record.upgraded);
        assert!(h.host.get_assignment(ra).unwrap().is_none());
        assert!(h.host.get_assignment(grant.id).unwrap().is_some());
    }

    #[test]
    fn ordinary_grant_without_tracking_is_ignored() {
        let h = Harness::new();
        h.grant(STUDENT_ROLE, STUDENT_ID, 1_000);
        let events = h.pump();

        assert!(events.is_empty());
        assert_eq!(h.host.assignment_count(), 1);
        assert!(h.mailer.sent().is_empty());
    }

    #[test]
    fn manual_removal_expires_and_unenrols() {
        let h = Harness::new();
        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();
        h.mailer.clear();

        h.host.remove_assignment(ra, TEACHER_ID).unwrap();
        let events = h.pump();

        assert!(h.store.get_by_role_assignment(ra).unwrap().is_none());
        let mail = h.mailer.sent_to(STUDENT_ID);
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].email.subject, "Temporary enrolment for Algebra expired");
        assert!(events.contains(&CoreEvent::Unenrolled {
            user_id: STUDENT_ID,
            course_id: COURSE,
        }));
        assert!(!h.host.is_enrolled(COURSE, STUDENT_ID));
    }

    #[test]
    fn unassign_without_record_is_quiet() {
        let h = Harness::new();
        let event = RoleUnassigned {
            actor_id: TEACHER_ID,
            subject_id: STUDENT_ID,
            context_id: CONTEXT,
            course_id: COURSE,
            role_id: MARKER,
            role_assignment_id: RoleAssignmentId::new(999),
            timestamp: 1_000,
        };

        h.engine.on_role_unassigned(&h.settings, &event).unwrap();
        h.engine.on_role_unassigned(&h.settings, &event).unwrap();

        assert!(h.mailer.sent().is_empty());
        assert!(h.store.list_tracking().unwrap().is_empty());
    }

    #[test]
    fn unenrol_twice_is_harmless() {
        let h = Harness::new();
        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();
        h.host.remove_assignment(ra, TEACHER_ID).unwrap();
        let removal = h.host_events();
        for ev in &removal {
            h.dispatch(ev);
        }
        h.mailer.clear();

        let again = h.dispatch(&removal[0]);
        assert!(again.is_empty());
        assert!(h.mailer.sent().is_empty());
    }

    #[test]
    fn other_roles_keep_enrolment() {
        let h = Harness::new();
        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();
        // An assignment that predates tracking and bypasses the rejection check
        h.host
            .seed_assignment(STUDENT_ROLE, STUDENT_ID, CONTEXT, TEACHER_ID, 1_500);

        h.host.remove_assignment(ra, TEACHER_ID).unwrap();
        let events = h.pump();

        assert!(events.iter().any(|e| matches!(e, CoreEvent::Expired { .. })));
        assert!(!events.iter().any(|e| matches!(e, CoreEvent::Unenrolled { .. })));
        assert!(h.host.is_enrolled(COURSE, STUDENT_ID));
    }

    #[test]
    fn disabled_feature_still_cleans_up_records() {
        let mut h = Harness::new();
        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();
        h.mailer.clear();

        h.settings.enrolments.enabled = false;
        h.host.remove_assignment(ra, TEACHER_ID).unwrap();
        let events = h.pump();

        assert!(events.is_empty());
        assert!(h.mailer.sent().is_empty());
        assert!(h.store.list_tracking().unwrap().is_empty());
        assert!(h.host.is_enrolled(COURSE, STUDENT_ID));
    }

    #[test]
    fn disabled_feature_ignores_grants() {
        let mut h = Harness::new();
        h.settings.enrolments.marker_role = None;

        h.grant(MARKER, STUDENT_ID, 1_000);
        assert!(h.pump().is_empty());
        assert!(h.store.list_tracking().unwrap().is_empty());
    }

    #[test]
    fn mail_failure_keeps_state_change() {
        let h = Harness::new();
        *h.mailer.fail_send.lock().unwrap() = true;

        let ra = h.grant(MARKER, STUDENT_ID, 1_000);
        let events = h.pump();

        assert!(h.store.get_by_role_assignment(ra).unwrap().is_some());
        assert!(!events.iter().any(|e| matches!(e, CoreEvent::EmailSent { .. })));
    }

    #[test]
    fn host_failure_propagates() {
        let h = Harness::new();
        h.grant(MARKER, STUDENT_ID, 1_000);
        let pending = h.host_events();
        *h.host.fail_calls.lock().unwrap() = true;

        let HostEvent::RoleAssigned(ev) = &pending[0] else {
            panic!("expected RoleAssigned");
        };
        let result = h.engine.on_role_assigned(&h.settings, ev);
        assert!(matches!(result, Err(crate::EngineError::Host(_))));
        assert!(h.store.list_tracking().unwrap().is_empty());
    }

    #[test]
    fn missing_course_skips_email_only() {
        let h = Harness::new();
        let ra = h
            .host
            .seed_assignment(MARKER, STUDENT_ID, CONTEXT, TEACHER_ID, 1_000);
        let event = RoleAssigned {
            actor_id: TEACHER_ID,
            subject_id: STUDENT_ID,
            context_id: CONTEXT,
            course_id: tenrol_util::CourseId::new(404),
            role_id: MARKER,
            role_assignment_id: ra.id,
            timestamp: 1_000,
        };

        let events = h.engine.on_role_assigned(&h.settings, &event).unwrap();
        assert_eq!(events.len(), 1);
        assert!(h.mailer.sent().is_empty());
        assert!(h.store.get_by_role_assignment(ra.id).unwrap().is_some());
    }

    #[test]
    fn separate_contexts_are_independent() {
        let h = Harness::new();
        h.host.add_course(3, "Biology", 30);
        let other_ctx = ContextId::new(30);

        h.host
            .assign_role(STUDENT_ROLE, STUDENT_ID, other_ctx, TEACHER_ID, 500)
            .unwrap();
        h.pump();

        h.grant(MARKER, STUDENT_ID, 1_000);
        h.pump();
        assert_eq!(h.store.list_tracking().unwrap().len(), 1);
    }
}
