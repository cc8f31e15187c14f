//! Diagnostic message type shared by the engine and the service layer.

use crate::session::error::Error as SessionError;
use crate::uds::{self, NegativeResponseCode, SUPPRESS_POSITIVE_RESPONSE};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    Request,
    Response,
}

/// One request or response PDU, as the engine saw it on the wire.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnosticMessage {
    pub direction: Direction,
    pub service_id: u8,
    pub sub_function: Option<u8>,
    /// Payload after service id and sub-function.
    pub data: Vec<u8>,
    pub negative: bool,
    pub nrc: Option<NegativeResponseCode>,
    /// Responding ECU, when the adapter reported headers.
    pub source: Option<u32>,
    /// Physical target, when one was addressed.
    pub target: Option<u32>,
    /// Engine-assigned monotonic sequence number.
    pub sequence: u64,
}

impl DiagnosticMessage {
    pub fn request(service_id: u8, sub_function: Option<u8>, data: &[u8]) -> Self {
        Self {
            direction: Direction::Request,
            service_id,
            sub_function,
            data: data.to_vec(),
            negative: false,
            nrc: None,
            source: None,
            target: None,
            sequence: 0,
        }
    }

    /// Whether the request asks the ECU not to answer positively.
    pub fn suppresses_response(&self) -> bool {
        self.sub_function
            .is_some_and(|sub| sub & SUPPRESS_POSITIVE_RESPONSE != 0)
    }

    /// Wire bytes: service id, optional sub-function, payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.data.len());
        bytes.push(self.service_id);
        if let Some(sub) = self.sub_function {
            bytes.push(sub);
        }
        bytes.extend(&self.data);
        bytes
    }

    /// Parse and validate a response payload against the request it answers.
    ///
    /// A positive response must carry `request sid + 0x40` and echo the
    /// sub-function; a negative response must name the rejected service.
    /// Anything else is a protocol violation.
    pub fn response_from_bytes(
        payload: &[u8],
        request: &DiagnosticMessage,
    ) -> Result<Self, crate::Error> {
        let sid = *payload
            .first()
            .ok_or_else(|| SessionError::ProtocolViolation("empty response".into()))?;

        if uds::is_negative_response(payload) {
            let (rejected, nrc) = uds::parse_negative_response(payload).ok_or_else(|| {
                SessionError::ProtocolViolation("truncated negative response".into())
            })?;
            if rejected != request.service_id {
                return Err(SessionError::ProtocolViolation(format!(
                    "negative response for service {rejected:#04x}, expected {:#04x}",
                    request.service_id
                ))
                .into());
            }
            return Ok(Self {
                direction: Direction::Response,
                service_id: sid,
                sub_function: None,
                data: payload[1..].to_vec(),
                negative: true,
                nrc: Some(nrc),
                source: None,
                target: request.target,
                sequence: request.sequence,
            });
        }

        if sid != uds::positive_response_sid(request.service_id) {
            return Err(uds::Error::InvalidServiceId(sid).into());
        }

        let mut sub_function = None;
        let mut start = 1;
        if let Some(sub) = request.sub_function {
            let echoed = *payload
                .get(1)
                .ok_or(uds::Error::InvalidResponseLength)?;
            if echoed != sub & !SUPPRESS_POSITIVE_RESPONSE {
                return Err(uds::Error::InvalidSubFunction(echoed).into());
            }
            sub_function = Some(echoed);
            start = 2;
        }

        Ok(Self {
            direction: Direction::Response,
            service_id: sid,
            sub_function,
            data: payload[start..].to_vec(),
            negative: false,
            nrc: None,
            source: None,
            target: request.target,
            sequence: request.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bytes() {
        let request = DiagnosticMessage::request(0x22, None, &[0xf1, 0x90]);
        assert_eq!(request.to_bytes(), vec![0x22, 0xf1, 0x90]);

        let request = DiagnosticMessage::request(0x10, Some(0x03), &[]);
        assert_eq!(request.to_bytes(), vec![0x10, 0x03]);
    }

    #[test]
    fn positive_response_offset_invariant() {
        let request = DiagnosticMessage::request(0x01, None, &[0x0c]);
        let response =
            DiagnosticMessage::response_from_bytes(&[0x41, 0x0c, 0x1a, 0xf8], &request).unwrap();
        assert!(!response.negative);
        assert_eq!(response.service_id, 0x41);
        assert_eq!(response.data, vec![0x0c, 0x1a, 0xf8]);
    }

    #[test]
    fn negative_response_shape() {
        let request = DiagnosticMessage::request(0x22, None, &[0xf1, 0x90]);
        let response =
            DiagnosticMessage::response_from_bytes(&[0x7f, 0x22, 0x78], &request).unwrap();
        assert!(response.negative);
        assert_eq!(
            response.nrc,
            Some(NegativeResponseCode::RequestCorrectlyReceivedResponsePending)
        );
    }

    #[test]
    fn mismatched_service_rejected() {
        let request = DiagnosticMessage::request(0x22, None, &[0xf1, 0x90]);
        assert!(DiagnosticMessage::response_from_bytes(&[0x41, 0x00], &request).is_err());
        // Negative response naming a different service
        assert!(DiagnosticMessage::response_from_bytes(&[0x7f, 0x10, 0x11], &request).is_err());
    }

    #[test]
    fn sub_function_echo_checked() {
        let request = DiagnosticMessage::request(0x10, Some(0x03), &[]);
        let ok = DiagnosticMessage::response_from_bytes(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xf4], &request);
        assert!(ok.is_ok());
        assert!(DiagnosticMessage::response_from_bytes(&[0x50, 0x02], &request).is_err());
    }

    #[test]
    fn suppressed_sub_function_still_matches_echo() {
        let request = DiagnosticMessage::request(0x3e, Some(0x80), &[]);
        assert!(request.suppresses_response());
        // If the ECU answers anyway, the echo has the suppress bit cleared.
        let response = DiagnosticMessage::response_from_bytes(&[0x7e, 0x00], &request).unwrap();
        assert_eq!(response.sub_function, Some(0x00));
    }
}
