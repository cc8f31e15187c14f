//! Checksum policies for the non-CAN protocols.
//!
//! J1850, ISO 9141-2 and KWP2000 all close a message with a sum-modulo-256
//! byte; CAN leaves integrity to the controller. The policy is a row in the
//! protocol table, not a type hierarchy.

/// Per-protocol checksum policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChecksumKind {
    /// CAN: no in-payload checksum.
    None,
    /// Sum modulo 256 over all preceding bytes, appended as the last byte.
    /// KWP2000 computes the same sum but includes its format/header bytes,
    /// so callers hand in the full framed message.
    Trailing,
}

impl ChecksumKind {
    pub fn append(&self, frame: &mut Vec<u8>) {
        if let ChecksumKind::Trailing = self {
            frame.push(sum_modulo_256(frame));
        }
    }

    /// Validate a received message. `true` when the policy is satisfied.
    pub fn verify(&self, frame: &[u8]) -> bool {
        match self {
            ChecksumKind::None => true,
            ChecksumKind::Trailing => match frame.split_last() {
                Some((checksum, rest)) => *checksum == sum_modulo_256(rest),
                None => false,
            },
        }
    }

    /// Strip a verified trailing checksum, returning the message body.
    pub fn strip<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        match self {
            ChecksumKind::None => frame,
            ChecksumKind::Trailing => &frame[..frame.len().saturating_sub(1)],
        }
    }
}

pub fn sum_modulo_256(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_checksum_roundtrip() {
        let mut frame = vec![0x68, 0x6a, 0xf1, 0x01, 0x00];
        ChecksumKind::Trailing.append(&mut frame);
        assert_eq!(*frame.last().unwrap(), 0xc4);
        assert!(ChecksumKind::Trailing.verify(&frame));
        assert_eq!(ChecksumKind::Trailing.strip(&frame), &frame[..5]);

        frame[1] ^= 0xff;
        assert!(!ChecksumKind::Trailing.verify(&frame));
    }

    #[test]
    fn can_has_no_checksum() {
        assert!(ChecksumKind::None.verify(&[0x41, 0x00]));
        assert_eq!(ChecksumKind::None.strip(&[0x41, 0x00]), &[0x41, 0x00]);
    }
}
