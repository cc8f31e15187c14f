//! Vehicle bus protocol table, implements the nine SAE/ISO OBD-II variants
//! plus UDS-on-CAN and J1939.
//!
//! Protocols are values, not a type hierarchy: every behavior the layers
//! above need (probe bytes, response validation, adapter profile, checksum
//! policy, default addressing) is a method on [`ProtocolType`], so adding a
//! protocol is adding a row.

pub mod checksum;
pub mod detect;

pub use checksum::ChecksumKind;
pub use detect::{
    CancelToken, DetectError, Detection, DetectionProgress, DetectorConfig, DetectorState,
    MakeHint, ProtocolDetector, VehicleHints,
};

use std::time::Duration;

use strum_macros::{Display, EnumIter};

use crate::adapter::{st_timeout_operand, AdapterProfile};

/// Bus family of a protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BusCategory {
    Can,
    Kwp,
    Iso9141,
    J1850,
    J1939,
}

/// The vehicle bus protocols the core can speak.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolType {
    #[strum(serialize = "SAE J1850 PWM (41.6 kbit)")]
    SaeJ1850Pwm,
    #[strum(serialize = "SAE J1850 VPW (10.4 kbit)")]
    SaeJ1850Vpw,
    #[strum(serialize = "ISO 9141-2 (5 baud init)")]
    Iso9141_2,
    #[strum(serialize = "ISO 14230-4 KWP (5 baud init)")]
    Iso14230_4Kwp5Baud,
    #[strum(serialize = "ISO 14230-4 KWP (fast init)")]
    Iso14230_4KwpFast,
    #[strum(serialize = "ISO 15765-4 CAN (11 bit, 500 kbit)")]
    Iso15765_4Can11Bit500K,
    #[strum(serialize = "ISO 15765-4 CAN (29 bit, 500 kbit)")]
    Iso15765_4Can29Bit500K,
    #[strum(serialize = "ISO 15765-4 CAN (11 bit, 250 kbit)")]
    Iso15765_4Can11Bit250K,
    #[strum(serialize = "ISO 15765-4 CAN (29 bit, 250 kbit)")]
    Iso15765_4Can29Bit250K,
    #[strum(serialize = "UDS on CAN (11 bit, 500 kbit)")]
    UdsCan11Bit500K,
    #[strum(serialize = "UDS on CAN (29 bit, 500 kbit)")]
    UdsCan29Bit500K,
    #[strum(serialize = "SAE J1939 (29 bit, 250 kbit)")]
    SaeJ1939,
}

impl ProtocolType {
    pub fn category(&self) -> BusCategory {
        use ProtocolType::*;
        match self {
            SaeJ1850Pwm | SaeJ1850Vpw => BusCategory::J1850,
            Iso9141_2 => BusCategory::Iso9141,
            Iso14230_4Kwp5Baud | Iso14230_4KwpFast => BusCategory::Kwp,
            Iso15765_4Can11Bit500K | Iso15765_4Can29Bit500K | Iso15765_4Can11Bit250K
            | Iso15765_4Can29Bit250K | UdsCan11Bit500K | UdsCan29Bit500K => BusCategory::Can,
            SaeJ1939 => BusCategory::J1939,
        }
    }

    pub fn is_can(&self) -> bool {
        matches!(self.category(), BusCategory::Can | BusCategory::J1939)
    }

    /// Arbitration id width for CAN-based protocols.
    pub fn bit_width(&self) -> Option<u8> {
        use ProtocolType::*;
        match self {
            Iso15765_4Can11Bit500K | Iso15765_4Can11Bit250K | UdsCan11Bit500K => Some(11),
            Iso15765_4Can29Bit500K | Iso15765_4Can29Bit250K | UdsCan29Bit500K | SaeJ1939 => {
                Some(29)
            }
            _ => None,
        }
    }

    pub fn baud_rate(&self) -> u32 {
        use ProtocolType::*;
        match self {
            SaeJ1850Pwm => 41_600,
            SaeJ1850Vpw => 10_400,
            Iso9141_2 | Iso14230_4Kwp5Baud | Iso14230_4KwpFast => 10_400,
            Iso15765_4Can11Bit250K | Iso15765_4Can29Bit250K | SaeJ1939 => 250_000,
            _ => 500_000,
        }
    }

    /// Functional request address and expected first response address.
    pub fn default_addresses(&self) -> (u32, u32) {
        match self.bit_width() {
            Some(11) => (0x7df, 0x7e8),
            Some(29) => (0x18db33f1, 0x18daf110),
            // K-line / J1850: functional target 0x33, tester source 0xF1.
            None => (0x33, 0xf1),
            Some(_) => unreachable!("bit_width() only returns None, Some(11), or Some(29)"),
        }
    }

    pub fn requires_5baud_init(&self) -> bool {
        matches!(
            self,
            ProtocolType::Iso9141_2 | ProtocolType::Iso14230_4Kwp5Baud
        )
    }

    /// `ATSPn` operand for this protocol.
    pub fn elm_protocol(&self) -> char {
        use ProtocolType::*;
        match self {
            SaeJ1850Pwm => '1',
            SaeJ1850Vpw => '2',
            Iso9141_2 => '3',
            Iso14230_4Kwp5Baud => '4',
            Iso14230_4KwpFast => '5',
            Iso15765_4Can11Bit500K | UdsCan11Bit500K => '6',
            Iso15765_4Can29Bit500K | UdsCan29Bit500K => '7',
            Iso15765_4Can11Bit250K => '8',
            Iso15765_4Can29Bit250K => '9',
            SaeJ1939 => 'A',
        }
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        match self.category() {
            BusCategory::Can | BusCategory::J1939 => ChecksumKind::None,
            _ => ChecksumKind::Trailing,
        }
    }

    /// The canonical probe request used during detection.
    pub fn probe_request(&self) -> &'static [u8] {
        match self.category() {
            // J1939: request PGN 0xF004 (EEC1), PGN little-endian.
            BusCategory::J1939 => &[0x04, 0xf0, 0x00],
            // OBD-II mode 01 PID 00.
            _ => &[0x01, 0x00],
        }
    }

    /// Classify a probe response as valid for this protocol. The adapter
    /// has already rejected responses containing error markers.
    pub fn validate_probe(&self, lines: &[Vec<u8>]) -> bool {
        match self.category() {
            BusCategory::Can | BusCategory::J1850 => {
                lines.iter().any(|line| line.contains(&0x41))
            }
            // KWP replies either to the OBD probe (0x41) or with a
            // StartCommunication positive (0xC1).
            BusCategory::Kwp | BusCategory::Iso9141 => lines
                .iter()
                .any(|line| line.contains(&0x41) || line.contains(&0xc1)),
            // A broadcast answering the PGN 0xF004 request carries the PGN
            // in its 29-bit id (PF 0xF0, PS 0x04), e.g. 0CF00400.
            BusCategory::J1939 => lines
                .iter()
                .any(|line| line.len() >= 8 && line.windows(2).any(|w| w == [0xf0, 0x04])),
        }
    }

    /// Profile used while probing: adapter-side ISO-TP formatting stays on
    /// so the probe is a plain two-byte request.
    pub fn detection_profile(&self, timeout: Duration) -> AdapterProfile {
        let mut profile = AdapterProfile::conditioning();
        profile.push("ATH0");
        profile.push(format!("ATSP{}", self.elm_protocol()));
        profile.push(format!("ATST{:02X}", st_timeout_operand(timeout)));
        profile
    }

    /// Profile for a live session. CAN protocols switch the adapter's
    /// automatic formatting off; the frame layer owns segmentation.
    pub fn session_profile(
        &self,
        timeout: Duration,
        headers: bool,
        request_id: Option<u32>,
    ) -> AdapterProfile {
        let mut profile = AdapterProfile::conditioning();
        profile.push(if headers { "ATH1" } else { "ATH0" });
        profile.push(format!("ATSP{}", self.elm_protocol()));
        profile.push(format!("ATST{:02X}", st_timeout_operand(timeout)));
        if self.is_can() {
            profile.push("ATCAF0");
        }
        if let Some(id) = request_id {
            if self.bit_width() == Some(11) {
                profile.push(format!("ATSH{:03X}", id & 0x7ff));
            } else if self.is_can() {
                profile.push(format!("ATSH{:08X}", id & 0x1fff_ffff));
            }
        }
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn twelve_protocols_in_the_table() {
        assert_eq!(ProtocolType::iter().count(), 12);
    }

    #[test]
    fn elm_operands_are_unique_for_obd_variants() {
        let obd: Vec<_> = ProtocolType::iter()
            .filter(|p| !matches!(p, ProtocolType::UdsCan11Bit500K | ProtocolType::UdsCan29Bit500K))
            .map(|p| p.elm_protocol())
            .collect();
        let mut deduped = obd.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(obd.len(), deduped.len());
    }

    #[test]
    fn can_addressing_defaults() {
        let (req, resp) = ProtocolType::Iso15765_4Can11Bit500K.default_addresses();
        assert_eq!((req, resp), (0x7df, 0x7e8));
        let (req, _) = ProtocolType::UdsCan29Bit500K.default_addresses();
        assert_eq!(req, 0x18db33f1);
    }

    #[test]
    fn probe_validation_rules() {
        let can = ProtocolType::Iso15765_4Can11Bit500K;
        assert!(can.validate_probe(&[vec![0x41, 0x00, 0xbe, 0x3f, 0xa8, 0x13]]));
        assert!(!can.validate_probe(&[vec![0x7f, 0x01, 0x11]]));

        let kwp = ProtocolType::Iso14230_4KwpFast;
        assert!(kwp.validate_probe(&[vec![0xc1, 0xef, 0x8f]]));
        assert!(kwp.validate_probe(&[vec![0x41, 0x00, 0x00, 0x00, 0x00, 0x00]]));

        let j1939 = ProtocolType::SaeJ1939;
        assert!(j1939.validate_probe(&[vec![
            0x0c, 0xf0, 0x04, 0x00, 0x68, 0x13, 0x7d, 0x7d, 0xff, 0xff
        ]]));
        // Length alone is not enough without the requested PGN.
        assert!(!j1939.validate_probe(&[vec![0u8; 8]]));
        // Nor is the PGN in a runt response.
        assert!(!j1939.validate_probe(&[vec![0xf0, 0x04]]));
    }

    #[test]
    fn session_profile_shapes() {
        let profile = ProtocolType::Iso15765_4Can11Bit500K.session_profile(
            Duration::from_millis(200),
            false,
            Some(0x7e0),
        );
        let commands: Vec<_> = profile.commands().collect();
        assert_eq!(
            commands,
            ["ATE0", "ATL0", "ATS0", "ATH0", "ATSP6", "ATST32", "ATCAF0", "ATSH7E0"]
        );

        let profile =
            ProtocolType::Iso9141_2.session_profile(Duration::from_millis(200), true, None);
        assert!(profile.commands().any(|c| c == "ATH1"));
        assert!(!profile.commands().any(|c| c == "ATCAF0"));
    }

    #[test]
    fn checksum_policy_per_category() {
        assert_eq!(
            ProtocolType::Iso15765_4Can11Bit500K.checksum_kind(),
            ChecksumKind::None
        );
        assert_eq!(
            ProtocolType::Iso9141_2.checksum_kind(),
            ChecksumKind::Trailing
        );
    }
}
