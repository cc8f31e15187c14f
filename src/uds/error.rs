//! Error types and negative response codes for the UDS service set.
use thiserror::Error;

/// Negative Response Codes returned by the ECU as defined in ISO 14229
/// Annex A.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrInvalidFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnetComponent,
    FailurePreventsExecutionOfRequestedAction,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    RequestCorrectlyReceivedResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    RpmTooHigh,
    RpmTooLow,
    EngineIsRunning,
    EngineIsNotRunning,
    EngineRunTimeTooLow,
    TemperatureTooHigh,
    TemperatureTooLow,
    VehicleSpeedTooHigh,
    VehicleSpeedTooLow,
    ThrottleTooHigh,
    ThrottleTooLow,
    TransmissionRangeNotInNeutral,
    TransmissionRangeNotInGear,
    BrakeSwitchNotClosed,
    ShifterLeverNotInPark,
    TorqueConverterClutchLocked,
    VoltageTooHigh,
    VoltageTooLow,
    NonStandard(u8),
}

impl From<u8> for NegativeResponseCode {
    fn from(val: u8) -> NegativeResponseCode {
        match val {
            0x10 => NegativeResponseCode::GeneralReject,
            0x11 => NegativeResponseCode::ServiceNotSupported,
            0x12 => NegativeResponseCode::SubFunctionNotSupported,
            0x13 => NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat,
            0x14 => NegativeResponseCode::ResponseTooLong,
            0x21 => NegativeResponseCode::BusyRepeatRequest,
            0x22 => NegativeResponseCode::ConditionsNotCorrect,
            0x24 => NegativeResponseCode::RequestSequenceError,
            0x25 => NegativeResponseCode::NoResponseFromSubnetComponent,
            0x26 => NegativeResponseCode::FailurePreventsExecutionOfRequestedAction,
            0x31 => NegativeResponseCode::RequestOutOfRange,
            0x33 => NegativeResponseCode::SecurityAccessDenied,
            0x35 => NegativeResponseCode::InvalidKey,
            0x36 => NegativeResponseCode::ExceededNumberOfAttempts,
            0x37 => NegativeResponseCode::RequiredTimeDelayNotExpired,
            0x70 => NegativeResponseCode::UploadDownloadNotAccepted,
            0x71 => NegativeResponseCode::TransferDataSuspended,
            0x72 => NegativeResponseCode::GeneralProgrammingFailure,
            0x73 => NegativeResponseCode::WrongBlockSequenceCounter,
            0x78 => NegativeResponseCode::RequestCorrectlyReceivedResponsePending,
            0x7e => NegativeResponseCode::SubFunctionNotSupportedInActiveSession,
            0x7f => NegativeResponseCode::ServiceNotSupportedInActiveSession,
            0x81 => NegativeResponseCode::RpmTooHigh,
            0x82 => NegativeResponseCode::RpmTooLow,
            0x83 => NegativeResponseCode::EngineIsRunning,
            0x84 => NegativeResponseCode::EngineIsNotRunning,
            0x85 => NegativeResponseCode::EngineRunTimeTooLow,
            0x86 => NegativeResponseCode::TemperatureTooHigh,
            0x87 => NegativeResponseCode::TemperatureTooLow,
            0x88 => NegativeResponseCode::VehicleSpeedTooHigh,
            0x89 => NegativeResponseCode::VehicleSpeedTooLow,
            0x8a => NegativeResponseCode::ThrottleTooHigh,
            0x8b => NegativeResponseCode::ThrottleTooLow,
            0x8c => NegativeResponseCode::TransmissionRangeNotInNeutral,
            0x8d => NegativeResponseCode::TransmissionRangeNotInGear,
            0x8f => NegativeResponseCode::BrakeSwitchNotClosed,
            0x90 => NegativeResponseCode::ShifterLeverNotInPark,
            0x91 => NegativeResponseCode::TorqueConverterClutchLocked,
            0x92 => NegativeResponseCode::VoltageTooHigh,
            0x93 => NegativeResponseCode::VoltageTooLow,
            _ => NegativeResponseCode::NonStandard(val),
        }
    }
}

impl NegativeResponseCode {
    pub fn byte(&self) -> u8 {
        match self {
            NegativeResponseCode::GeneralReject => 0x10,
            NegativeResponseCode::ServiceNotSupported => 0x11,
            NegativeResponseCode::SubFunctionNotSupported => 0x12,
            NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat => 0x13,
            NegativeResponseCode::ResponseTooLong => 0x14,
            NegativeResponseCode::BusyRepeatRequest => 0x21,
            NegativeResponseCode::ConditionsNotCorrect => 0x22,
            NegativeResponseCode::RequestSequenceError => 0x24,
            NegativeResponseCode::NoResponseFromSubnetComponent => 0x25,
            NegativeResponseCode::FailurePreventsExecutionOfRequestedAction => 0x26,
            NegativeResponseCode::RequestOutOfRange => 0x31,
            NegativeResponseCode::SecurityAccessDenied => 0x33,
            NegativeResponseCode::InvalidKey => 0x35,
            NegativeResponseCode::ExceededNumberOfAttempts => 0x36,
            NegativeResponseCode::RequiredTimeDelayNotExpired => 0x37,
            NegativeResponseCode::UploadDownloadNotAccepted => 0x70,
            NegativeResponseCode::TransferDataSuspended => 0x71,
            NegativeResponseCode::GeneralProgrammingFailure => 0x72,
            NegativeResponseCode::WrongBlockSequenceCounter => 0x73,
            NegativeResponseCode::RequestCorrectlyReceivedResponsePending => 0x78,
            NegativeResponseCode::SubFunctionNotSupportedInActiveSession => 0x7e,
            NegativeResponseCode::ServiceNotSupportedInActiveSession => 0x7f,
            NegativeResponseCode::RpmTooHigh => 0x81,
            NegativeResponseCode::RpmTooLow => 0x82,
            NegativeResponseCode::EngineIsRunning => 0x83,
            NegativeResponseCode::EngineIsNotRunning => 0x84,
            NegativeResponseCode::EngineRunTimeTooLow => 0x85,
            NegativeResponseCode::TemperatureTooHigh => 0x86,
            NegativeResponseCode::TemperatureTooLow => 0x87,
            NegativeResponseCode::VehicleSpeedTooHigh => 0x88,
            NegativeResponseCode::VehicleSpeedTooLow => 0x89,
            NegativeResponseCode::ThrottleTooHigh => 0x8a,
            NegativeResponseCode::ThrottleTooLow => 0x8b,
            NegativeResponseCode::TransmissionRangeNotInNeutral => 0x8c,
            NegativeResponseCode::TransmissionRangeNotInGear => 0x8d,
            NegativeResponseCode::BrakeSwitchNotClosed => 0x8f,
            NegativeResponseCode::ShifterLeverNotInPark => 0x90,
            NegativeResponseCode::TorqueConverterClutchLocked => 0x91,
            NegativeResponseCode::VoltageTooHigh => 0x92,
            NegativeResponseCode::VoltageTooLow => 0x93,
            NegativeResponseCode::NonStandard(val) => *val,
        }
    }

    /// How the session engine reacts to this code. The backoff set is
    /// 0x21, 0x23 and 0x24; 0x23 has no ISO 14229 name and arrives as
    /// [`NegativeResponseCode::NonStandard`].
    pub fn policy(&self) -> NrcPolicy {
        match self {
            NegativeResponseCode::RequestCorrectlyReceivedResponsePending => NrcPolicy::ExtendTimer,
            NegativeResponseCode::BusyRepeatRequest
            | NegativeResponseCode::NonStandard(0x23)
            | NegativeResponseCode::RequestSequenceError => NrcPolicy::RetryAfterBackoff,
            NegativeResponseCode::ServiceNotSupported
            | NegativeResponseCode::SubFunctionNotSupported
            | NegativeResponseCode::SubFunctionNotSupportedInActiveSession
            | NegativeResponseCode::ServiceNotSupportedInActiveSession => NrcPolicy::NoRetry {
                requires_security: false,
            },
            NegativeResponseCode::SecurityAccessDenied
            | NegativeResponseCode::InvalidKey
            | NegativeResponseCode::ExceededNumberOfAttempts => NrcPolicy::NoRetry {
                requires_security: true,
            },
            _ => NrcPolicy::RetryOnce,
        }
    }
}

/// Retry classification of a negative response.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NrcPolicy {
    /// 0x78: restart the response timer with the extended timeout, without
    /// consuming a retry.
    ExtendTimer,
    /// Wait `retry_delay_ms`, then retry up to `max_retries`.
    RetryAfterBackoff,
    /// One more attempt, then surface.
    RetryOnce,
    /// Surface immediately.
    NoRetry { requires_security: bool },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid Response Service ID: {0:#04x}")]
    InvalidServiceId(u8),
    #[error("Invalid Response Sub Function ID: {0:#04x}")]
    InvalidSubFunction(u8),
    #[error("Invalid Response Data Identifier: {0:#06x}")]
    InvalidDataIdentifier(u16),
    #[error("Invalid Response Routine Identifier: {0:#06x}")]
    InvalidRoutineIdentifier(u16),
    #[error("Invalid Response Length")]
    InvalidResponseLength,
    #[error("Negative Response: {0:?}")]
    NegativeResponse(NegativeResponseCode),
    #[error("Security Access Required")]
    SecurityAccessRequired,
}
