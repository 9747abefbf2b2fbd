//! Shared utilities for tenrol
//!
//! This crate provides:
//! - ID types (UserId, CourseId, RoleAssignmentId, ClientId, ...)
//! - Time utilities (Unix seconds, mock time, days-left rounding)
//! - Default paths for socket, config, and data directories

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
