//! Host platform trait interfaces for tenrold
//!
//! This crate defines the interface between the lifecycle engine and the
//! learning-management platform it manages: role assignments, enrolments,
//! user and course directories, and mail delivery. It contains no platform
//! code itself.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
