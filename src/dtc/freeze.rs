//! Freeze frame storage and decoding per SAE J1979 service 0x02.

use std::collections::BTreeMap;

use crate::obd::{self, PidValue};

/// Snapshot of live data captured by the ECU at the moment a DTC was set.
/// Raw bytes are kept for every PID; values for PIDs with a known J1979
/// formula decode on demand.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FreezeFrame {
    /// Code of the DTC that triggered this frame.
    pub dtc_code: String,
    /// Frame number, 0 for the standard frame.
    pub frame_number: u8,
    raw: BTreeMap<u8, Vec<u8>>,
}

impl FreezeFrame {
    pub fn new(dtc_code: impl Into<String>, frame_number: u8) -> Self {
        Self {
            dtc_code: dtc_code.into(),
            frame_number,
            raw: BTreeMap::new(),
        }
    }

    /// Store the raw bytes reported for a PID.
    pub fn insert(&mut self, pid: u8, data: Vec<u8>) {
        self.raw.insert(pid, data);
    }

    /// Raw bytes for a PID, unknown PIDs included.
    pub fn raw(&self, pid: u8) -> Option<&[u8]> {
        self.raw.get(&pid).map(Vec::as_slice)
    }

    /// Decoded value for a PID with a known formula, `None` otherwise.
    pub fn value(&self, pid: u8) -> Option<PidValue> {
        obd::decode_pid(pid, self.raw.get(&pid)?)
    }

    /// All decodable values in PID order.
    pub fn values(&self) -> Vec<PidValue> {
        self.raw
            .iter()
            .filter_map(|(pid, data)| obd::decode_pid(*pid, data))
            .collect()
    }

    pub fn pids(&self) -> impl Iterator<Item = u8> + '_ {
        self.raw.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
