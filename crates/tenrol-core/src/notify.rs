//! Building and sending notification emails

use tenrol_api::EmailKind;
use tenrol_config::Settings;
use tenrol_store::{AuditEvent, AuditEventType};
use tenrol_util::{CourseId, UserId};
use tracing::{debug, info, warn};

use crate::{render, CoreEvent, EngineResult, LifecycleEngine, RenderContext};

/// Which party of an enrolment receives a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recipient {
    Student,
    Teacher,
}

/// The people and course an email talks about
#[derive(Debug, Clone, Copy)]
pub(crate) struct Parties {
    pub teacher: UserId,
    pub student: UserId,
    pub course: CourseId,
}

impl LifecycleEngine {
    /// Render and send one email kind.
    ///
    /// Returns `None` when the kind is switched off, a party cannot be
    /// resolved, or the mailer fails. Mail failures are logged only.
    pub(crate) fn notify(
        &self,
        settings: &Settings,
        kind: EmailKind,
        recipient: Recipient,
        parties: Parties,
        time_end: i64,
        now: i64,
    ) -> EngineResult<Option<CoreEvent>> {
        let Some(template) = settings.email_template(kind) else {
            debug!(kind = %kind, "Email kind disabled");
            return Ok(None);
        };

        let Some(student) = self.host.user(parties.student)? else {
            warn!(kind = %kind, user_id = %parties.student, "Student not found, email skipped");
            return Ok(None);
        };
        let Some(teacher) = self.host.user(parties.teacher)? else {
            warn!(kind = %kind, user_id = %parties.teacher, "Teacher not found, email skipped");
            return Ok(None);
        };
        let Some(course) = self.host.course(parties.course)? else {
            warn!(kind = %kind, course_id = %parties.course, "Course not found, email skipped");
            return Ok(None);
        };

        let ctx = RenderContext {
            teacher: teacher.firstname.clone(),
            student_first: student.firstname.clone(),
            student_last: student.lastname.clone(),
            student_full: student.fullname(),
            course: course.fullname,
            time_end,
            now,
        };
        let email = render(template, &ctx);

        let to = match recipient {
            Recipient::Student => &student,
            Recipient::Teacher => &teacher,
        };

        match self.mailer.send(to, &email) {
            Ok(()) => {
                info!(kind = %kind, to = %to.id, subject = %email.subject, "Email sent");
                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::EmailSent {
                    kind,
                    to: to.id,
                }));
                Ok(Some(CoreEvent::EmailSent { kind, to: to.id }))
            }
            Err(e) => {
                warn!(kind = %kind, to = %to.id, error = %e, "Email delivery failed");
                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::EmailFailed {
                    kind,
                    to: to.id,
                    error: e.to_string(),
                }));
                Ok(None)
            }
        }
    }
}
