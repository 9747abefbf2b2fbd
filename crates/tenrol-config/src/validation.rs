//! Configuration validation

use crate::schema::{RawConfig, RawEmail};
use tenrol_api::EmailKind;
use tenrol_util::SECONDS_PER_DAY;
use thiserror::Error;

/// Marker that opens the subject line of a template
pub const SUBJECT_MARKER: &str = "{SUBJECT: ";

/// Longest accepted temporary enrolment, roughly a century
pub const MAX_DURATION_SECONDS: i64 = 100 * 365 * SECONDS_PER_DAY;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("duration_seconds must be positive and at most 100 years, got {0}")]
    InvalidDuration(i64),

    #[error("marker_role_id must be positive, got {0}")]
    InvalidRoleId(i64),

    #[error("{field} must be positive")]
    InvalidInterval { field: &'static str },

    #[error("Email '{kind}': template has no {{SUBJECT: ...}} line")]
    MissingSubjectLine { kind: EmailKind },

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(duration) = config.enrolments.duration_seconds
        && !(1..=MAX_DURATION_SECONDS).contains(&duration)
    {
        errors.push(ValidationError::InvalidDuration(duration));
    }

    if let Some(role) = config.enrolments.marker_role_id
        && role <= 0
    {
        errors.push(ValidationError::InvalidRoleId(role));
    }

    if config.daemon.expire_sweep_seconds == Some(0) {
        errors.push(ValidationError::InvalidInterval {
            field: "expire_sweep_seconds",
        });
    }

    if config.daemon.reminder_sweep_seconds == Some(0) {
        errors.push(ValidationError::InvalidInterval {
            field: "reminder_sweep_seconds",
        });
    }

    if config.existing_assignments.send_email && !config.existing_assignments.manage {
        tracing::warn!("existing_assignments.send_email has no effect unless manage = true");
    }

    let emails = &config.emails;
    let by_kind: [(EmailKind, &RawEmail); 5] = [
        (EmailKind::StudentInit, &emails.student_init),
        (EmailKind::TeacherInit, &emails.teacher_init),
        (EmailKind::Upgrade, &emails.upgrade),
        (EmailKind::Expire, &emails.expire),
        (EmailKind::Reminder, &emails.reminder),
    ];
    for (kind, email) in by_kind {
        errors.extend(validate_email(kind, email));
    }

    errors
}

fn validate_email(kind: EmailKind, email: &RawEmail) -> Option<ValidationError> {
    // Disabled kinds and empty templates are allowed; they simply send nothing
    if email.enabled == Some(false) {
        return None;
    }
    match &email.template {
        Some(template) if !template.trim().is_empty() && !has_subject_line(template) => {
            Some(ValidationError::MissingSubjectLine { kind })
        }
        _ => None,
    }
}

/// Whether a template carries a `{SUBJECT: ...}` line
pub fn has_subject_line(template: &str) -> bool {
    template.lines().any(|line| {
        line.find(SUBJECT_MARKER)
            .is_some_and(|start| line[start + SUBJECT_MARKER.len()..].contains('}'))
    })
}
