//! Unified Diagnostic Services definitions, implements the ISO 14229 subset
//! used by the session engine and the service layer: service identifiers,
//! session kinds, negative response codes and their retry policy.

pub mod constants;
pub mod error;
pub mod types;

pub use constants::{DataIdentifier, DtcReportType, ServiceIdentifier, SUPPRESS_POSITIVE_RESPONSE};
pub use error::{Error, NegativeResponseCode, NrcPolicy};
pub use types::{
    IoControlParameter, ResetKind, RoutineOperation, SessionKind, SessionParameterRecord,
};

/// Service id of a positive response to `request_sid`.
pub fn positive_response_sid(request_sid: u8) -> u8 {
    request_sid | 0x40
}

/// Whether a response payload is a negative response frame
/// (`7F <rejected sid> <nrc>`).
pub fn is_negative_response(payload: &[u8]) -> bool {
    payload.first() == Some(&(ServiceIdentifier::NegativeResponse as u8))
}

/// Extract the rejected service and NRC from a negative response payload.
pub fn parse_negative_response(payload: &[u8]) -> Option<(u8, NegativeResponseCode)> {
    if !is_negative_response(payload) || payload.len() < 3 {
        return None;
    }
    Some((payload[1], NegativeResponseCode::from(payload[2])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_sid_offset() {
        assert_eq!(positive_response_sid(0x22), 0x62);
        assert_eq!(positive_response_sid(0x01), 0x41);
    }

    #[test]
    fn negative_response_parsing() {
        let (sid, nrc) = parse_negative_response(&[0x7f, 0x22, 0x78]).unwrap();
        assert_eq!(sid, 0x22);
        assert_eq!(
            nrc,
            NegativeResponseCode::RequestCorrectlyReceivedResponsePending
        );
        assert!(parse_negative_response(&[0x62, 0xf1, 0x90]).is_none());
        assert!(parse_negative_response(&[0x7f, 0x22]).is_none());
    }
}
