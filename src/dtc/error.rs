//! Error types for the DTC codec.
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    #[error("Invalid DTC Code: {0}")]
    InvalidCode(String),
    #[error("Invalid DTC Payload Length: {0}")]
    InvalidPayloadLength(usize),
}
