//! Contains the main error type for the library.

use thiserror::Error;

/// The main error type for the library. Each module has its own error type
/// that is contained by this error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Adapter(#[from] crate::adapter::Error),
    #[error(transparent)]
    IsoTp(#[from] crate::isotp::Error),
    #[error(transparent)]
    Uds(#[from] crate::uds::Error),
    #[error(transparent)]
    Obd(#[from] crate::obd::Error),
    #[error(transparent)]
    Dtc(#[from] crate::dtc::Error),
    #[error(transparent)]
    Session(#[from] crate::session::Error),
    #[error(transparent)]
    Config(#[from] crate::session::ConfigError),
    #[error(transparent)]
    Detect(#[from] crate::protocol::DetectError),
}

impl Error {
    /// Stable machine-readable failure class. The `Display` impl is the
    /// single-line human reason; the full cause chain stays available for
    /// diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Adapter(crate::adapter::Error::Timeout)
            | Error::IsoTp(crate::isotp::Error::Timeout)
            | Error::Detect(crate::protocol::DetectError::Timeout) => "timeout",
            Error::Transport(_) | Error::Adapter(_) => "transport",
            Error::Uds(crate::uds::Error::NegativeResponse(_)) => "negative_response",
            Error::IsoTp(_) | Error::Obd(_) | Error::Dtc(_) | Error::Uds(_) => {
                "protocol_violation"
            }
            Error::Session(crate::session::Error::ProtocolViolation(_)) => "protocol_violation",
            Error::Session(_) => "session",
            Error::Config(_) => "configuration",
            Error::Detect(_) => "detection",
        }
    }
}
