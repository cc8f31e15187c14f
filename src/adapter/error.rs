//! Error types for the ELM327 adapter driver.
use thiserror::Error;

/// Adapter-level failures, including the error markers an ELM327-family
/// device embeds in its output stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Adapter Reset Failed")]
    Reset,
    #[error("No Data")]
    NoData,
    #[error("Unable To Connect")]
    UnableToConnect,
    #[error("CAN Error")]
    CanError,
    #[error("Bus Init Error")]
    BusInit,
    #[error("Stopped")]
    Stopped,
    #[error("Buffer Full")]
    BufferFull,
    #[error("Unknown Command")]
    UnknownCommand,
    #[error("Adapter Error")]
    Command,
    #[error("Configuration Failed: {command:?} -> {response:?}")]
    ConfigurationFailed { command: String, response: String },
    #[error("Unparsable Response: {0:?}")]
    Unexpected(String),
    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Scan cleaned adapter output for an error marker. Longer markers are
    /// checked first so `CAN ERROR` is not mistaken for the generic `ERROR`.
    pub fn from_marker(text: &str) -> Option<Error> {
        if text.contains("UNABLE TO CONNECT") {
            Some(Error::UnableToConnect)
        } else if text.contains("CAN ERROR") {
            Some(Error::CanError)
        } else if text.contains("BUS INIT") && text.contains("ERROR") {
            Some(Error::BusInit)
        } else if text.contains("BUFFER FULL") {
            Some(Error::BufferFull)
        } else if text.contains("STOPPED") {
            Some(Error::Stopped)
        } else if text.contains("NO DATA") {
            Some(Error::NoData)
        } else if text.contains("ERROR") {
            Some(Error::Command)
        } else if text.trim() == "?" {
            Some(Error::UnknownCommand)
        } else {
            None
        }
    }

    /// Whether a retry of the same request can plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NoData
                | Error::Timeout
                | Error::BufferFull
                | Error::Stopped
                | Error::CanError
        )
    }
}
