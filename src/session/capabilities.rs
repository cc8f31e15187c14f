//! Derived protocol capability descriptors.

use std::collections::BTreeSet;

use crate::protocol::{BusCategory, ProtocolType};
use crate::uds::SessionKind;

const OBD_SERVICES: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0x07, 0x09, 0x0a];
const UDS_SERVICES: &[u8] = &[
    0x10, 0x11, 0x14, 0x19, 0x22, 0x27, 0x2e, 0x2f, 0x31, 0x3e, 0x85,
];

/// Read-only view of what a (protocol, session) pair can do.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolCapabilities {
    pub protocol: ProtocolType,
    pub session: SessionKind,
    pub max_single_frame_len: usize,
    pub max_message_len: usize,
    pub supported_services: BTreeSet<u8>,
    pub supports_keep_alive: bool,
    pub supports_security: bool,
    pub supports_routines: bool,
    pub supports_io_control: bool,
    pub supports_programming: bool,
    pub supports_coding: bool,
    pub requires_initialization: bool,
}

impl ProtocolCapabilities {
    pub fn derive(protocol: ProtocolType, session: SessionKind) -> Self {
        let uds = matches!(
            protocol,
            ProtocolType::UdsCan11Bit500K | ProtocolType::UdsCan29Bit500K
        );

        let (max_single, max_message) = match protocol.category() {
            BusCategory::Can => (7, 4095),
            BusCategory::Kwp => (7, 255),
            BusCategory::Iso9141 => (7, 255),
            BusCategory::J1850 => (7, 7),
            BusCategory::J1939 => (8, 1785),
        };

        let mut services: BTreeSet<u8> = OBD_SERVICES.iter().copied().collect();
        if uds {
            services.extend(UDS_SERVICES);
        }

        let extended = !matches!(session, SessionKind::Default);
        let programming = matches!(session, SessionKind::Programming);

        Self {
            protocol,
            session,
            max_single_frame_len: max_single,
            max_message_len: max_message,
            supported_services: services,
            supports_keep_alive: uds && session.keep_alive_required(),
            supports_security: uds,
            supports_routines: uds && extended,
            supports_io_control: uds && extended,
            supports_programming: uds && programming,
            supports_coding: uds && extended,
            requires_initialization: protocol.requires_5baud_init(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isotp_lengths() {
        let caps = ProtocolCapabilities::derive(
            ProtocolType::Iso15765_4Can11Bit500K,
            SessionKind::Default,
        );
        assert_eq!(caps.max_message_len, 4095);
        assert_eq!(caps.max_single_frame_len, 7);
        assert!(!caps.supports_routines);
    }

    #[test]
    fn kwp_and_j1850_lengths() {
        let kwp =
            ProtocolCapabilities::derive(ProtocolType::Iso14230_4KwpFast, SessionKind::Default);
        assert_eq!(kwp.max_message_len, 255);
        let j1850 =
            ProtocolCapabilities::derive(ProtocolType::SaeJ1850Vpw, SessionKind::Default);
        assert_eq!(j1850.max_message_len, 7);
    }

    #[test]
    fn uds_extended_session_unlocks_feature_set() {
        let caps =
            ProtocolCapabilities::derive(ProtocolType::UdsCan11Bit500K, SessionKind::Extended);
        assert!(caps.supports_routines);
        assert!(caps.supports_io_control);
        assert!(!caps.supports_programming);
        assert!(caps.supported_services.contains(&0x22));

        let caps =
            ProtocolCapabilities::derive(ProtocolType::UdsCan11Bit500K, SessionKind::Programming);
        assert!(caps.supports_programming);
    }

    #[test]
    fn five_baud_protocols_require_init() {
        let caps = ProtocolCapabilities::derive(ProtocolType::Iso9141_2, SessionKind::Default);
        assert!(caps.requires_initialization);
    }
}
