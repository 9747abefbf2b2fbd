//! Protocol types for tenrold
//!
//! This crate defines the stable API between tenrold, the host platform
//! integration, and control clients:
//! - Role-assignment lifecycle events (inputs from the host)
//! - Commands and responses (IPC requests)
//! - Broadcast events (service -> subscribed clients)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
