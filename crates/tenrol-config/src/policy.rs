//! Validated settings structures

use crate::schema::{
    RawConfig, RawDaemonConfig, RawEmail, RawEnrolments, RawExistingAssignments, RawStartMode,
};
use std::path::PathBuf;
use std::time::Duration;
use tenrol_api::EmailKind;
use tenrol_util::{RoleId, UserId, SECONDS_PER_DAY};

/// Default temporary window: 14 days
pub const DEFAULT_DURATION_SECONDS: i64 = 14 * SECONDS_PER_DAY;

/// Default reminder interval in days
pub const DEFAULT_REMINDER_INTERVAL_DAYS: u32 = 2;

/// Default user credited with automated notifications
pub const DEFAULT_AUTOMATION_USER_ID: i64 = 1;

/// Validated settings, passed explicitly into every handler and sweep
#[derive(Debug, Clone)]
pub struct Settings {
    pub daemon: DaemonConfig,
    pub enrolments: EnrolmentSettings,
    pub existing_assignments: ExistingAssignments,
    pub emails: EmailTemplates,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            daemon: DaemonConfig::from_raw(raw.daemon),
            enrolments: EnrolmentSettings::from_raw(raw.enrolments),
            existing_assignments: ExistingAssignments::from_raw(raw.existing_assignments),
            emails: EmailTemplates {
                student_init: EmailTemplate::from_raw(raw.emails.student_init, EmailKind::StudentInit),
                teacher_init: EmailTemplate::from_raw(raw.emails.teacher_init, EmailKind::TeacherInit),
                upgrade: EmailTemplate::from_raw(raw.emails.upgrade, EmailKind::Upgrade),
                expire: EmailTemplate::from_raw(raw.emails.expire, EmailKind::Expire),
                reminder: EmailTemplate::from_raw(raw.emails.reminder, EmailKind::Reminder),
            },
        }
    }

    /// The marker role, if the feature is switched on and a role is configured.
    ///
    /// `None` means every handler is a no-op.
    pub fn active_marker_role(&self) -> Option<RoleId> {
        if self.enrolments.enabled {
            self.enrolments.marker_role
        } else {
            None
        }
    }

    /// Template for an email kind, if that kind is switched on and non-empty
    pub fn email_template(&self, kind: EmailKind) -> Option<&str> {
        let email = self.emails.get(kind);
        if email.enabled && !email.template.trim().is_empty() {
            Some(email.template.as_str())
        } else {
            None
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_raw(RawConfig {
            config_version: crate::CURRENT_CONFIG_VERSION,
            daemon: Default::default(),
            enrolments: Default::default(),
            existing_assignments: Default::default(),
            emails: Default::default(),
        })
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub host_db: PathBuf,
    pub expire_sweep_interval: Duration,
    pub reminder_sweep_interval: Duration,
}

impl DaemonConfig {
    fn from_raw(raw: RawDaemonConfig) -> Self {
        let data_dir = raw
            .data_dir
            .unwrap_or_else(tenrol_util::default_data_dir);
        Self {
            socket_path: raw
                .socket_path
                .unwrap_or_else(tenrol_util::default_socket_path),
            host_db: raw.host_db.unwrap_or_else(|| data_dir.join("host.db")),
            data_dir,
            expire_sweep_interval: Duration::from_secs(raw.expire_sweep_seconds.unwrap_or(60)),
            reminder_sweep_interval: Duration::from_secs(
                raw.reminder_sweep_seconds.unwrap_or(3600),
            ),
        }
    }
}

/// Core temporary-enrolment settings
#[derive(Debug, Clone)]
pub struct EnrolmentSettings {
    pub enabled: bool,
    pub marker_role: Option<RoleId>,
    pub duration_seconds: i64,
    /// 0 disables reminders
    pub reminder_interval_days: u32,
    pub automation_user: UserId,
}

impl EnrolmentSettings {
    fn from_raw(raw: RawEnrolments) -> Self {
        Self {
            enabled: raw.enabled.unwrap_or(true),
            marker_role: raw.marker_role_id.map(RoleId::new),
            duration_seconds: raw.duration_seconds.unwrap_or(DEFAULT_DURATION_SECONDS),
            reminder_interval_days: raw
                .reminder_interval_days
                .unwrap_or(DEFAULT_REMINDER_INTERVAL_DAYS),
            automation_user: UserId::new(
                raw.automation_user_id.unwrap_or(DEFAULT_AUTOMATION_USER_ID),
            ),
        }
    }

    /// Reminder interval in seconds, `None` when reminders are off
    pub fn reminder_interval_seconds(&self) -> Option<i64> {
        match self.reminder_interval_days {
            0 => None,
            days => Some(i64::from(days) * SECONDS_PER_DAY),
        }
    }
}

/// Where an adopted assignment's window starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// The role assignment's own creation/modification time
    AssignmentCreated,
    /// The moment the backfill runs
    Now,
}

/// Handling of marker-role assignments that predate the configuration
#[derive(Debug, Clone)]
pub struct ExistingAssignments {
    pub manage: bool,
    pub send_email: bool,
    pub start: StartMode,
}

impl ExistingAssignments {
    fn from_raw(raw: RawExistingAssignments) -> Self {
        Self {
            manage: raw.manage,
            send_email: raw.send_email,
            start: match raw.start {
                RawStartMode::AssignmentCreated => StartMode::AssignmentCreated,
                RawStartMode::Now => StartMode::Now,
            },
        }
    }
}

/// One email kind
#[derive(Debug, Clone)]
pub struct EmailTemplate {
    pub enabled: bool,
    pub template: String,
}

impl EmailTemplate {
    fn from_raw(raw: RawEmail, kind: EmailKind) -> Self {
        Self {
            enabled: raw.enabled.unwrap_or(true),
            template: raw
                .template
                .unwrap_or_else(|| default_template(kind).to_string()),
        }
    }
}

/// Templates for every email kind
#[derive(Debug, Clone)]
pub struct EmailTemplates {
    pub student_init: EmailTemplate,
    pub teacher_init: EmailTemplate,
    pub upgrade: EmailTemplate,
    pub expire: EmailTemplate,
    pub reminder: EmailTemplate,
}

impl EmailTemplates {
    pub fn get(&self, kind: EmailKind) -> &EmailTemplate {
        match kind {
            EmailKind::StudentInit => &self.student_init,
            EmailKind::TeacherInit => &self.teacher_init,
            EmailKind::Upgrade => &self.upgrade,
            EmailKind::Expire => &self.expire,
            EmailKind::Reminder => &self.reminder,
        }
    }
}

/// Built-in English template for an email kind
pub fn default_template(kind: EmailKind) -> &'static str {
    match kind {
        EmailKind::StudentInit => {
            "{SUBJECT: Temporary enrolment granted for {COURSE}}\n\n\
             Dear {STUDENTFIRST},\n\n\
             You have been granted temporary access to {COURSE}. After you are officially \
             registered for the course, you will receive student access for the remainder of \
             the semester. Temporary access will expire in {TIMELEFT} days. Though faculty can \
             add you to the course site, they CANNOT register you for the course."
        }
        EmailKind::TeacherInit => {
            "{SUBJECT: Temporary enrolment granted to {STUDENTFULL} for {COURSE}}\n\n\
             Dear {TEACHER},\n\n\
             You have granted {STUDENTFULL} temporary access to {COURSE}. Temporary enrolment \
             will expire in {TIMELEFT} days. Though you can add students to the course site, you \
             CANNOT register them for the course. They may register through the registrar \
             until the add deadline."
        }
        EmailKind::Upgrade => {
            "{SUBJECT: Temporary enrolment for {COURSE} upgraded!}\n\n\
             Dear {STUDENTFIRST},\n\n\
             Your temporary access to {COURSE} has been upgraded to full enrolment! You are now \
             officially registered for this course and have permanent access to the course site."
        }
        EmailKind::Expire => {
            "{SUBJECT: Temporary enrolment for {COURSE} expired}\n\n\
             Dear {STUDENTFIRST},\n\n\
             Your temporary access to {COURSE} has expired or been revoked. You will no longer \
             be able to access this course. If you wish to participate in this course, please \
             register for it through the registrar."
        }
        EmailKind::Reminder => {
            "{SUBJECT: Temporary enrolment reminder for {COURSE}}\n\n\
             Dear {STUDENTFIRST},\n\n\
             Please be advised that your temporary enrolment in {COURSE} will expire in \
             {TIMELEFT} days. If you wish to continue participating in this course you MUST \
             formally register for it through the registrar."
        }
    }
}
