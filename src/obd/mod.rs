//! OBD-II service set, implements the SAE J1979 request formats and the
//! scale/offset formulas for the standard PIDs.

pub mod error;

pub use error::Error;

/// OBD-II service (mode) identifiers.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
#[repr(u8)]
pub enum ObdService {
    CurrentData = 0x01,
    FreezeFrameData = 0x02,
    StoredDtcs = 0x03,
    ClearDtcs = 0x04,
    PendingDtcs = 0x07,
    VehicleInfo = 0x09,
    PermanentDtcs = 0x0a,
}

/// VIN request PID under service 0x09.
pub const VEHICLE_INFO_VIN: u8 = 0x02;

/// Positive responses echo the service with this offset added.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// A decoded live-data value. Names and units are static table entries,
/// so only serialization is derived.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PidValue {
    pub pid: u8,
    pub name: &'static str,
    pub unit: &'static str,
    pub value: f64,
}

struct PidSpec {
    pid: u8,
    name: &'static str,
    unit: &'static str,
    bytes: usize,
    decode: fn(&[u8]) -> f64,
}

fn a(data: &[u8]) -> f64 {
    data[0] as f64
}

fn ab(data: &[u8]) -> f64 {
    (data[0] as u16 as f64) * 256.0 + data[1] as f64
}

fn percent(data: &[u8]) -> f64 {
    data[0] as f64 * 100.0 / 255.0
}

fn temperature(data: &[u8]) -> f64 {
    data[0] as f64 - 40.0
}

fn fuel_trim(data: &[u8]) -> f64 {
    (data[0] as f64 - 128.0) * 100.0 / 128.0
}

/// Scale/offset table for the standard PIDs. Unknown PIDs are preserved as
/// raw bytes by the callers.
static PID_TABLE: &[PidSpec] = &[
    PidSpec { pid: 0x04, name: "Calculated engine load", unit: "%", bytes: 1, decode: percent },
    PidSpec { pid: 0x05, name: "Engine coolant temperature", unit: "°C", bytes: 1, decode: temperature },
    PidSpec { pid: 0x06, name: "Short term fuel trim bank 1", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: 0x07, name: "Long term fuel trim bank 1", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: 0x08, name: "Short term fuel trim bank 2", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: 0x09, name: "Long term fuel trim bank 2", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: 0x0a, name: "Fuel pressure", unit: "kPa", bytes: 1, decode: |d| d[0] as f64 * 3.0 },
    PidSpec { pid: 0x0b, name: "Intake manifold pressure", unit: "kPa", bytes: 1, decode: a },
    PidSpec { pid: 0x0c, name: "Engine speed", unit: "rpm", bytes: 2, decode: |d| ab(d) / 4.0 },
    PidSpec { pid: 0x0d, name: "Vehicle speed", unit: "km/h", bytes: 1, decode: a },
    PidSpec { pid: 0x0e, name: "Timing advance", unit: "°", bytes: 1, decode: |d| d[0] as f64 / 2.0 - 64.0 },
    PidSpec { pid: 0x0f, name: "Intake air temperature", unit: "°C", bytes: 1, decode: temperature },
    PidSpec { pid: 0x10, name: "MAF air flow rate", unit: "g/s", bytes: 2, decode: |d| ab(d) / 100.0 },
    PidSpec { pid: 0x11, name: "Throttle position", unit: "%", bytes: 1, decode: percent },
    PidSpec { pid: 0x1f, name: "Run time since engine start", unit: "s", bytes: 2, decode: ab },
    PidSpec { pid: 0x21, name: "Distance traveled with MIL on", unit: "km", bytes: 2, decode: ab },
    PidSpec { pid: 0x2f, name: "Fuel tank level", unit: "%", bytes: 1, decode: percent },
    PidSpec { pid: 0x31, name: "Distance since codes cleared", unit: "km", bytes: 2, decode: ab },
    PidSpec { pid: 0x33, name: "Barometric pressure", unit: "kPa", bytes: 1, decode: a },
    PidSpec { pid: 0x42, name: "Control module voltage", unit: "V", bytes: 2, decode: |d| ab(d) / 1000.0 },
    PidSpec { pid: 0x46, name: "Ambient air temperature", unit: "°C", bytes: 1, decode: temperature },
    PidSpec { pid: 0x4e, name: "Time since codes cleared", unit: "min", bytes: 2, decode: ab },
    PidSpec { pid: 0x5e, name: "Engine fuel rate", unit: "L/h", bytes: 2, decode: |d| ab(d) / 20.0 },
];

/// Decode the data bytes of a PID with a known J1979 formula. Returns `None`
/// for unknown PIDs or truncated data.
pub fn decode_pid(pid: u8, data: &[u8]) -> Option<PidValue> {
    let spec = PID_TABLE.iter().find(|spec| spec.pid == pid)?;
    if data.len() < spec.bytes {
        return None;
    }

    Some(PidValue {
        pid,
        name: spec.name,
        unit: spec.unit,
        value: (spec.decode)(&data[..spec.bytes]),
    })
}

/// Number of data bytes a PID carries, for known PIDs.
pub fn pid_data_len(pid: u8) -> Option<usize> {
    PID_TABLE.iter().find(|spec| spec.pid == pid).map(|spec| spec.bytes)
}

/// Decode a PID support bitmap (PIDs 0x00, 0x20, 0x40, ...). `base` is the
/// PID the bitmap was requested with; bit 7 of the first byte corresponds
/// to `base + 1`.
pub fn decode_support_bitmap(base: u8, data: &[u8]) -> Vec<u8> {
    let mut supported = Vec::new();
    for (byte_idx, byte) in data.iter().take(4).enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                supported.push(base + (byte_idx * 8 + bit) as u8 + 1);
            }
        }
    }
    supported
}

/// MIL state and DTC count from mode 01 PID 01.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MilStatus {
    pub mil_on: bool,
    pub dtc_count: u8,
}

impl MilStatus {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mil_on: byte & 0x80 != 0,
            dtc_count: byte & 0x7f,
        }
    }
}

/// Assemble a VIN from a service 0x09 PID 0x02 payload. The payload starts
/// with the message-count byte on CAN; non-printable and padding characters
/// are dropped before validation.
pub fn parse_vin(payload: &[u8]) -> Result<String, Error> {
    let ascii: String = payload
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric())
        .map(char::from)
        .collect();

    // Keep the trailing 17 characters, the leading message-count byte may
    // itself be alphanumeric.
    if ascii.len() < 17 {
        return Err(Error::InvalidVin(ascii));
    }
    let vin = ascii[ascii.len() - 17..].to_string();

    if vin.chars().any(|c| matches!(c, 'I' | 'O' | 'Q')) {
        return Err(Error::InvalidVin(vin));
    }
    Ok(vin)
}
