//! IPC layer for tenrold
//!
//! Newline-delimited JSON over a Unix domain socket. The peer's uid decides
//! whether a connection may deliver role events and trigger jobs (admin) or
//! only query and watch (observer).

mod client;
mod server;

pub use client::*;
pub use server::*;

use tenrol_api::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server error: {0}")]
    ServerError(String),

    /// The daemon answered with an error response
    #[error("Request rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
}

pub type IpcResult<T> = Result<T, IpcError>;
