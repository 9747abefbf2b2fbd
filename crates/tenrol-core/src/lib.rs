//! Lifecycle engine for temporary course enrolments
//!
//! This crate is the heart of tenrold, containing:
//! - The lifecycle state machine (tracked -> reminded -> upgraded | expired)
//! - Reaction to role-assigned / role-unassigned events
//! - Expiration, reminder, backfill and reschedule sweeps
//! - Email template rendering

mod engine;
mod events;
mod notify;
mod sweeps;
mod template;

#[cfg(test)]
mod testing;

pub use engine::*;
pub use events::*;
pub use sweeps::*;
pub use template::*;

use tenrol_host_api::HostError;
use tenrol_store::StoreError;
use thiserror::Error;

/// Failures that abort a handler or sweep
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

pub type EngineResult<T> = Result<T, EngineError>;
