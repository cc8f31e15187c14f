//! ECU registry types.
//!
//! The session engine owns the mutable registry; everything else receives
//! immutable snapshots keyed by address.

use std::collections::BTreeSet;

/// Functional role of an ECU, guessed from its response address until a
/// DID read says otherwise.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EcuKind {
    Engine,
    Transmission,
    AntiLockBrakes,
    Airbag,
    BodyControl,
    InstrumentCluster,
    Climate,
    Gateway,
    Unknown,
}

impl EcuKind {
    /// Conventional 11-bit response address mapping: 0x7E8 is almost always
    /// the engine, 0x7E9 the transmission.
    pub fn from_address(address: u32) -> Self {
        match address {
            0x7e8 => EcuKind::Engine,
            0x7e9 => EcuKind::Transmission,
            0x7ea | 0x7eb => EcuKind::AntiLockBrakes,
            0x7ec => EcuKind::BodyControl,
            0x7ed => EcuKind::InstrumentCluster,
            _ => EcuKind::Unknown,
        }
    }
}

/// Capability bitfield over the diagnostic feature set.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuCapabilities(u16);

impl EcuCapabilities {
    pub const READ_DTC: EcuCapabilities = EcuCapabilities(1 << 0);
    pub const CLEAR_DTC: EcuCapabilities = EcuCapabilities(1 << 1);
    pub const FREEZE_FRAME: EcuCapabilities = EcuCapabilities(1 << 2);
    pub const LIVE_DATA: EcuCapabilities = EcuCapabilities(1 << 3);
    pub const SECURITY: EcuCapabilities = EcuCapabilities(1 << 4);
    pub const ROUTINE: EcuCapabilities = EcuCapabilities(1 << 5);
    pub const IO_CONTROL: EcuCapabilities = EcuCapabilities(1 << 6);
    pub const CODING: EcuCapabilities = EcuCapabilities(1 << 7);
    pub const PROGRAMMING: EcuCapabilities = EcuCapabilities(1 << 8);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, capability: EcuCapabilities) {
        self.0 |= capability.0;
    }

    pub fn contains(&self, capability: EcuCapabilities) -> bool {
        self.0 & capability.0 == capability.0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for EcuCapabilities {
    type Output = EcuCapabilities;
    fn bitor(self, rhs: EcuCapabilities) -> EcuCapabilities {
        EcuCapabilities(self.0 | rhs.0)
    }
}

/// One addressable module, as learned from its responses.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ecu {
    pub address: u32,
    pub kind: EcuKind,
    pub capabilities: EcuCapabilities,
    /// Service ids seen answered positively.
    pub services: BTreeSet<u8>,
    /// Data identifiers known to be readable.
    pub data_identifiers: BTreeSet<u16>,
    /// Monotonic ms (engine epoch) of the last response.
    pub last_seen_ms: u64,
    pub online: bool,
}

impl Ecu {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            kind: EcuKind::from_address(address),
            capabilities: EcuCapabilities::empty(),
            services: BTreeSet::new(),
            data_identifiers: BTreeSet::new(),
            last_seen_ms: 0,
            online: true,
        }
    }

    /// Record a positively answered service, deriving capabilities.
    pub fn record_service(&mut self, service_id: u8, now_ms: u64) {
        self.services.insert(service_id);
        self.last_seen_ms = now_ms;
        self.online = true;

        let capability = match service_id {
            0x01 => Some(EcuCapabilities::LIVE_DATA),
            0x02 => Some(EcuCapabilities::FREEZE_FRAME),
            0x03 | 0x07 | 0x0a | 0x19 => Some(EcuCapabilities::READ_DTC),
            0x04 | 0x14 => Some(EcuCapabilities::CLEAR_DTC),
            0x27 => Some(EcuCapabilities::SECURITY),
            0x2e => Some(EcuCapabilities::CODING),
            0x2f => Some(EcuCapabilities::IO_CONTROL),
            0x31 => Some(EcuCapabilities::ROUTINE),
            0x34 | 0x35 | 0x36 | 0x37 => Some(EcuCapabilities::PROGRAMMING),
            _ => None,
        };
        if let Some(capability) = capability {
            self.capabilities.insert(capability);
        }
    }
}
