//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global daemon settings
    #[serde(default)]
    pub daemon: RawDaemonConfig,

    /// Temporary enrolment behaviour
    #[serde(default)]
    pub enrolments: RawEnrolments,

    /// Handling of marker-role assignments that predate the configuration
    #[serde(default)]
    pub existing_assignments: RawExistingAssignments,

    /// Notification templates
    #[serde(default)]
    pub emails: RawEmails,
}

/// Daemon-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDaemonConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the tracking store
    pub data_dir: Option<PathBuf>,

    /// Host platform database (users, courses, role assignments, mail outbox)
    pub host_db: Option<PathBuf>,

    /// How often the expiration sweep runs
    pub expire_sweep_seconds: Option<u64>,

    /// How often the reminder sweep runs
    pub reminder_sweep_seconds: Option<u64>,
}

/// Core enrolment settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEnrolments {
    /// Master on/off switch
    pub enabled: Option<bool>,

    /// The role whose presence marks an enrolment as temporary
    pub marker_role_id: Option<i64>,

    /// Length of the temporary window
    pub duration_seconds: Option<i64>,

    /// Days between reminder emails (0 disables reminders)
    pub reminder_interval_days: Option<u32>,

    /// User credited as the sender of automated notifications
    pub automation_user_id: Option<i64>,
}

/// Pre-existing marker-role assignments
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawExistingAssignments {
    /// Bring existing assignments under management
    #[serde(default)]
    pub manage: bool,

    /// Send initial student emails for adopted assignments
    #[serde(default)]
    pub send_email: bool,

    /// Where the adopted window starts
    #[serde(default)]
    pub start: RawStartMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStartMode {
    #[default]
    AssignmentCreated,
    Now,
}

/// One email kind
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEmail {
    pub enabled: Option<bool>,
    pub template: Option<String>,
}

/// All email kinds
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEmails {
    #[serde(default)]
    pub student_init: RawEmail,
    #[serde(default)]
    pub teacher_init: RawEmail,
    #[serde(default)]
    pub upgrade: RawEmail,
    #[serde(default)]
    pub expire: RawEmail,
    #[serde(default)]
    pub reminder: RawEmail,
}
