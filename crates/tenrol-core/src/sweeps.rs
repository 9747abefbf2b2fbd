//! Scheduled sweeps over the tracking store

use tenrol_api::{EmailKind, RoleUnassigned};
use tenrol_config::{Settings, StartMode};
use tenrol_store::{AuditEvent, AuditEventType, NewTrackingRecord, StoreError, TrackingFilter};
use tracing::{debug, info, warn};

use crate::notify::{Parties, Recipient};
use crate::{CoreEvent, EngineResult, LifecycleEngine};

/// Result of an expiration, reminder or reschedule sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Records acted upon
    pub processed: usize,
    pub events: Vec<CoreEvent>,
}

/// Result of a backfill
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillOutcome {
    /// Stale records removed
    pub purged: usize,
    /// Existing assignments adopted
    pub created: usize,
    pub events: Vec<CoreEvent>,
}

impl LifecycleEngine {
    /// Revoke the marker role of every expired, non-upgraded record.
    ///
    /// Each removal goes through the unassign path immediately. The host's
    /// own `RoleUnassigned` event for it arrives later and finds no record.
    pub fn run_expiration_sweep(&self, settings: &Settings, now: i64) -> EngineResult<SweepOutcome> {
        if settings.active_marker_role().is_none() {
            return Ok(SweepOutcome::default());
        }

        let actor = settings.enrolments.automation_user;
        let mut outcome = SweepOutcome::default();
        for record in self.store.list_where(TrackingFilter::ExpiredAt(now))? {
            let Some(assignment) = self.host.remove_assignment(record.role_assignment_id, actor)? else {
                warn!(
                    role_assignment_id = %record.role_assignment_id,
                    "Role assignment vanished from host, dropping record"
                );
                self.store.delete_tracking(record.id)?;
                continue;
            };
            debug!(role_assignment_id = %record.role_assignment_id, "Expired marker role removed");

            let Some(course_id) = self.host.course_for_context(assignment.context_id)? else {
                warn!(context_id = %assignment.context_id, "Context has no course, dropping record");
                self.store.delete_tracking(record.id)?;
                continue;
            };

            let unassigned = RoleUnassigned {
                actor_id: actor,
                subject_id: assignment.user_id,
                context_id: assignment.context_id,
                course_id,
                role_id: assignment.role_id,
                role_assignment_id: assignment.id,
                timestamp: now,
            };
            outcome
                .events
                .extend(self.on_role_unassigned(settings, &unassigned)?);
            outcome.processed += 1;
        }

        if outcome.processed > 0 {
            info!(count = outcome.processed, "Expiration sweep revoked marker roles");
        }
        Ok(outcome)
    }

    /// Send reminders for active records whose interval has elapsed
    pub fn run_reminder_sweep(&self, settings: &Settings, now: i64) -> EngineResult<SweepOutcome> {
        if settings.active_marker_role().is_none() {
            return Ok(SweepOutcome::default());
        }
        let Some(interval) = settings.enrolments.reminder_interval_seconds() else {
            return Ok(SweepOutcome::default());
        };
        if settings.email_template(EmailKind::Reminder).is_none() {
            debug!("Reminder emails disabled");
            return Ok(SweepOutcome::default());
        }

        let mut outcome = SweepOutcome::default();
        for mut record in self.store.list_where(TrackingFilter::ActiveAt(now))? {
            let last = record.last_reminder_at.unwrap_or(record.time_start);
            if now - last < interval {
                continue;
            }

            let Some(assignment) = self.host.get_assignment(record.role_assignment_id)? else {
                debug!(role_assignment_id = %record.role_assignment_id, "Assignment gone, no reminder");
                continue;
            };
            let Some(course) = self.host.course_for_context(assignment.context_id)? else {
                warn!(context_id = %assignment.context_id, "Context has no course, no reminder");
                continue;
            };

            outcome.events.extend(self.notify(
                settings,
                EmailKind::Reminder,
                Recipient::Student,
                Parties {
                    teacher: assignment.modifier_id,
                    student: assignment.user_id,
                    course,
                },
                record.time_end,
                now,
            )?);

            record.last_reminder_at = Some(now);
            self.store.update_tracking(&record)?;
            outcome.processed += 1;
        }

        if outcome.processed > 0 {
            info!(count = outcome.processed, "Reminders sent");
        }
        Ok(outcome)
    }

    /// Purge records of a previous marker role and adopt existing assignments
    /// of the current one. Running it twice on the same config changes nothing.
    pub fn run_backfill(&self, settings: &Settings, now: i64) -> EngineResult<BackfillOutcome> {
        let Some(marker) = settings.active_marker_role() else {
            return Ok(BackfillOutcome::default());
        };

        let mut outcome = BackfillOutcome {
            purged: self.store.delete_where(TrackingFilter::RoleOtherThan(marker))?,
            ..Default::default()
        };

        let existing = &settings.existing_assignments;
        if existing.manage {
            for assignment in self.host.assignments_for_role(marker)? {
                if self.store.get_by_role_assignment(assignment.id)?.is_some() {
                    continue;
                }

                let start = match existing.start {
                    StartMode::AssignmentCreated => assignment.time_modified,
                    StartMode::Now => now,
                };
                let new = NewTrackingRecord::starting_at(
                    assignment.id,
                    marker,
                    start,
                    settings.enrolments.duration_seconds,
                );
                let record = match self.store.create_tracking(new) {
                    Ok(record) => record,
                    Err(StoreError::AlreadyTracked(_)) => continue,
                    Err(e) => return Err(e.into()),
                };

                outcome.created += 1;
                let _ = self
                    .store
                    .append_audit(AuditEvent::new(AuditEventType::TrackingStarted {
                        role_assignment_id: record.role_assignment_id,
                        user_id: assignment.user_id,
                        time_start: record.time_start,
                        time_end: record.time_end,
                    }));
                outcome.events.push(CoreEvent::TrackingStarted {
                    role_assignment_id: record.role_assignment_id,
                    user_id: assignment.user_id,
                    time_end: record.time_end,
                });

                if !existing.send_email {
                    continue;
                }
                let Some(course) = self.host.course_for_context(assignment.context_id)? else {
                    warn!(context_id = %assignment.context_id, "Context has no course, no email");
                    continue;
                };
                outcome.events.extend(self.notify(
                    settings,
                    EmailKind::StudentInit,
                    Recipient::Student,
                    Parties {
                        teacher: settings.enrolments.automation_user,
                        student: assignment.user_id,
                        course,
                    },
                    record.time_end,
                    now,
                )?);
            }
        }

        info!(
            marker_role_id = %marker,
            purged = outcome.purged,
            created = outcome.created,
            "Backfill completed"
        );
        let _ = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::BackfillCompleted {
                marker_role_id: marker,
                purged: outcome.purged,
                created: outcome.created,
            }));
        outcome.events.push(CoreEvent::BackfillCompleted {
            purged: outcome.purged,
            created: outcome.created,
        });

        Ok(outcome)
    }

    /// Recompute every end time from its start and the configured duration
    pub fn reschedule(&self, settings: &Settings) -> EngineResult<SweepOutcome> {
        let duration = settings.enrolments.duration_seconds;
        let mut outcome = SweepOutcome::default();

        for mut record in self.store.list_tracking()? {
            let time_end = record.time_start.saturating_add(duration);
            if record.time_end == time_end {
                continue;
            }
            record.time_end = time_end;
            self.store.update_tracking(&record)?;
            outcome.processed += 1;
        }

        info!(duration_seconds = duration, updated = outcome.processed, "Tracking rescheduled");
        let _ = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::Rescheduled {
                duration_seconds: duration,
                updated: outcome.processed,
            }));
        outcome.events.push(CoreEvent::Rescheduled {
            updated: outcome.processed,
        });

        Ok(outcome)
    }
}
