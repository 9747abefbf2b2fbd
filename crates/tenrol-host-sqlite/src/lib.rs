//! SQLite host adapter for tenrold
//!
//! Reads and writes an LMS-shaped database:
//! - Users, courses and course contexts
//! - Role assignments (with change events)
//! - Enrolment methods and user enrolments
//! - A mail outbox drained by the platform's own delivery job

mod adapter;
mod outbox;

pub use adapter::*;
pub use outbox::*;
