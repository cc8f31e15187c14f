//! Error types for the OBD-II service layer.
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    #[error("Invalid Response Length: {0}")]
    InvalidResponseLength(usize),
    #[error("Unexpected Service ID: {0:#04x}")]
    UnexpectedServiceId(u8),
    #[error("Unexpected PID: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedPid { expected: u8, got: u8 },
    #[error("Invalid VIN: {0}")]
    InvalidVin(String),
    #[error("No Decode Formula For PID: {0:#04x}")]
    UnsupportedPid(u8),
}
