//! Mail delivery through the host's outbox table

use rusqlite::params;
use tenrol_host_api::{HostError, HostResult, Mailer, RenderedEmail, UserProfile};
use tenrol_util::UserId;
use tracing::debug;

use crate::adapter::db_err;
use crate::SqlitePlatform;

/// A queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: i64,
    pub to_user: UserId,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    /// Unix seconds
    pub queued_at: i64,
}

impl SqlitePlatform {
    /// Queued messages, oldest first
    pub fn outbox(&self) -> HostResult<Vec<OutboxMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, to_user, to_address, subject, body, queued_at FROM mail_outbox ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OutboxMessage {
                    id: row.get(0)?,
                    to_user: UserId::new(row.get(1)?),
                    to_address: row.get(2)?,
                    subject: row.get(3)?,
                    body: row.get(4)?,
                    queued_at: row.get(5)?,
                })
            })
            .map_err(db_err)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(db_err)?);
        }
        Ok(messages)
    }
}

impl Mailer for SqlitePlatform {
    fn send(&self, to: &UserProfile, email: &RenderedEmail) -> HostResult<()> {
        if to.email.trim().is_empty() {
            return Err(HostError::Mail(format!("user {} has no email address", to.id)));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO mail_outbox (to_user, to_address, subject, body, queued_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                to.id.get(),
                to.email,
                email.subject,
                email.body,
                tenrol_util::unix_now()
            ],
        )
        .map_err(|e| HostError::Mail(e.to_string()))?;

        debug!(to = %to.id, subject = %email.subject, "Mail queued");
        Ok(())
    }
}
