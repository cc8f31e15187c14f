//! Error types for the session engine.
use thiserror::Error;

use crate::session::state::ProtocolState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid State For {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: ProtocolState,
    },
    #[error("Session Lost")]
    SessionLost,
    #[error("Retries Exhausted After {attempts} Attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("Protocol Violation: {0}")]
    ProtocolViolation(String),
}

/// Configuration validation failures. Terminal until reconfigured.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid Timeout: {0}")]
    InvalidTimeout(&'static str),
    #[error("Invalid Retry Policy: {0}")]
    InvalidRetry(&'static str),
    #[error("Invalid Keep Alive Interval")]
    InvalidKeepAlive,
}
