//! Typed diagnostic operations over the session engine.
//!
//! Each operation is a pure function of the engine and its parameters:
//! build the request bytes, let the engine run the exchange contract, parse
//! the payload. No state is held here beyond the engine borrow.
//! ## Example
//! ```
//! # async fn services_example(engine: &diaglink::session::SessionEngine) {
//! use diaglink::services::DiagnosticClient;
//!
//! let client = DiagnosticClient::new(engine);
//! let rpm = client.read_current_pid(0x0c).await.unwrap();
//! println!("{}: {} {}", rpm.name, rpm.value, rpm.unit);
//!
//! for dtc in client.read_stored_dtcs().await.unwrap() {
//!     println!("{} ({:?})", dtc.code, dtc.severity());
//! }
//! # }
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dtc::{self, Dtc, DtcKind, FreezeFrame};
use crate::event::EventKind;
use crate::obd::{self, MilStatus, ObdService, PidValue};
use crate::session::{DiagnosticMessage, SessionEngine};
use crate::uds::{
    DtcReportType, IoControlParameter, ResetKind, RoutineOperation, ServiceIdentifier,
    SessionKind, SessionParameterRecord,
};

/// PIDs captured into a freeze frame snapshot, beyond whatever the ECU
/// reports for PID 0x02.
const FREEZE_FRAME_PIDS: &[u8] = &[
    0x04, 0x05, 0x06, 0x07, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11, 0x1f, 0x21,
];

/// Pause before probing an ECU that was just told to reset.
const RESET_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Typed operations over a [`SessionEngine`].
pub struct DiagnosticClient<'a> {
    engine: &'a SessionEngine,
}

impl<'a> DiagnosticClient<'a> {
    pub fn new(engine: &'a SessionEngine) -> Self {
        Self { engine }
    }

    // --- OBD-II live data ---------------------------------------------

    /// Mode 01: read a live PID and decode it per J1979.
    pub async fn read_current_pid(&self, pid: u8) -> Result<PidValue, crate::Error> {
        let data = self.read_raw_pid(pid).await?;
        obd::decode_pid(pid, &data).ok_or_else(|| obd::Error::UnsupportedPid(pid).into())
    }

    /// Mode 01: read a live PID, returning the raw data bytes.
    pub async fn read_raw_pid(&self, pid: u8) -> Result<Vec<u8>, crate::Error> {
        let request =
            DiagnosticMessage::request(ObdService::CurrentData as u8, None, &[pid]);
        let response = self.engine.send(request).await?;

        match response.data.split_first() {
            Some((echoed, rest)) if *echoed == pid => Ok(rest.to_vec()),
            Some((echoed, _)) => Err(obd::Error::UnexpectedPid {
                expected: pid,
                got: *echoed,
            }
            .into()),
            None => Err(obd::Error::InvalidResponseLength(0).into()),
        }
    }

    /// Walk the PID support bitmaps (0x00, 0x20, ...) and collect every
    /// PID the ECU claims to support.
    pub async fn supported_pids(&self) -> Result<BTreeSet<u8>, crate::Error> {
        let mut supported = BTreeSet::new();
        let mut page: u8 = 0x00;

        loop {
            let data = match self.read_raw_pid(page).await {
                Ok(data) => data,
                // First page must answer; later pages are optional.
                Err(err) if page == 0x00 => return Err(err),
                Err(_) => break,
            };
            let pids = obd::decode_support_bitmap(page, &data);
            let has_next = page < 0xe0 && pids.contains(&(page + 0x20));
            supported.extend(pids);

            if !has_next {
                break;
            }
            page += 0x20;
        }
        Ok(supported)
    }

    /// Mode 01 PID 01: MIL state and stored DTC count.
    pub async fn mil_status(&self) -> Result<MilStatus, crate::Error> {
        let data = self.read_raw_pid(0x01).await?;
        let byte = *data
            .first()
            .ok_or(obd::Error::InvalidResponseLength(0))?;
        Ok(MilStatus::from_byte(byte))
    }

    // --- DTC operations -----------------------------------------------

    /// Mode 03: stored (confirmed) DTCs.
    pub async fn read_stored_dtcs(&self) -> Result<Vec<Dtc>, crate::Error> {
        self.read_obd_dtcs(ObdService::StoredDtcs, DtcKind::Stored)
            .await
    }

    /// Mode 07: pending DTCs from the current/last drive cycle.
    pub async fn read_pending_dtcs(&self) -> Result<Vec<Dtc>, crate::Error> {
        self.read_obd_dtcs(ObdService::PendingDtcs, DtcKind::Pending)
            .await
    }

    /// Mode 0A: permanent DTCs, cleared only by the ECU itself.
    pub async fn read_permanent_dtcs(&self) -> Result<Vec<Dtc>, crate::Error> {
        self.read_obd_dtcs(ObdService::PermanentDtcs, DtcKind::Permanent)
            .await
    }

    async fn read_obd_dtcs(
        &self,
        service: ObdService,
        kind: DtcKind,
    ) -> Result<Vec<Dtc>, crate::Error> {
        let request = DiagnosticMessage::request(service as u8, None, &[]);
        let response = self.engine.send(request).await?;

        // CAN responses lead with a count byte, K-line responses do not;
        // an odd payload length tells them apart.
        let pairs = if response.data.len() % 2 == 1 {
            &response.data[1..]
        } else {
            &response.data[..]
        };

        let mut dtcs = dtc::decode_dtc_pairs(pairs, kind)?;
        for dtc in &mut dtcs {
            dtc.ecu_address = response.source;
        }

        debug!("{} DTC(s) read", dtcs.len());
        self.engine.events().publish(EventKind::DtcRead {
            codes: dtcs.iter().map(|d| d.code.clone()).collect(),
        });
        Ok(dtcs)
    }

    /// Mode 04: clear DTCs and freeze frames. Positive response only.
    pub async fn clear_dtcs(&self) -> Result<(), crate::Error> {
        let request = DiagnosticMessage::request(ObdService::ClearDtcs as u8, None, &[]);
        self.engine.send(request).await?;
        Ok(())
    }

    /// UDS 0x19 0x02: DTCs by status mask, status bytes included.
    pub async fn read_dtcs_by_status_mask(&self, mask: u8) -> Result<Vec<Dtc>, crate::Error> {
        let request = DiagnosticMessage::request(
            ServiceIdentifier::ReadDtcInformation as u8,
            Some(DtcReportType::ReportDtcByStatusMask as u8),
            &[mask],
        );
        let response = self.engine.send(request).await?;

        // First byte is the availability mask, then 4-byte records.
        let records = response
            .data
            .split_first()
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let mut dtcs = dtc::decode_dtc_records(records, DtcKind::Stored)?;
        for dtc in &mut dtcs {
            dtc.ecu_address = response.source;
        }

        self.engine.events().publish(EventKind::DtcRead {
            codes: dtcs.iter().map(|d| d.code.clone()).collect(),
        });
        Ok(dtcs)
    }

    /// UDS 0x14: clear diagnostic information for the whole DTC group.
    pub async fn clear_diagnostic_information(&self) -> Result<(), crate::Error> {
        let request = DiagnosticMessage::request(
            ServiceIdentifier::ClearDiagnosticInformation as u8,
            None,
            &[0xff, 0xff, 0xff],
        );
        self.engine.send(request).await?;
        Ok(())
    }

    // --- Freeze frames ------------------------------------------------

    /// Mode 02: one PID out of freeze frame `frame_number`.
    pub async fn read_freeze_frame_pid(
        &self,
        pid: u8,
        frame_number: u8,
    ) -> Result<Vec<u8>, crate::Error> {
        let request = DiagnosticMessage::request(
            ObdService::FreezeFrameData as u8,
            None,
            &[pid, frame_number],
        );
        let response = self.engine.send(request).await?;

        match response.data.split_first() {
            Some((echoed, rest)) if *echoed == pid => {
                // The frame number echo follows the PID echo.
                Ok(rest.strip_prefix(&[frame_number]).unwrap_or(rest).to_vec())
            }
            Some((echoed, _)) => Err(obd::Error::UnexpectedPid {
                expected: pid,
                got: *echoed,
            }
            .into()),
            None => Err(obd::Error::InvalidResponseLength(0).into()),
        }
    }

    /// Snapshot the standard PIDs of one freeze frame. PID 0x02 names the
    /// DTC that captured the frame; PIDs the ECU does not answer are
    /// skipped.
    pub async fn read_freeze_frame(&self, frame_number: u8) -> Result<FreezeFrame, crate::Error> {
        let dtc_bytes = self.read_freeze_frame_pid(0x02, frame_number).await?;
        if dtc_bytes.len() < 2 {
            return Err(obd::Error::InvalidResponseLength(dtc_bytes.len()).into());
        }
        let code = dtc::decode_dtc(dtc_bytes[0], dtc_bytes[1])
            .ok_or(dtc::Error::InvalidPayloadLength(0))?;

        let mut frame = FreezeFrame::new(code, frame_number);
        for pid in FREEZE_FRAME_PIDS {
            match self.read_freeze_frame_pid(*pid, frame_number).await {
                Ok(bytes) => frame.insert(*pid, bytes),
                Err(err) => debug!("freeze frame PID {:#04x} unavailable: {}", pid, err),
            }
        }
        Ok(frame)
    }

    // --- Vehicle information ------------------------------------------

    /// Mode 09 PID 02: the 17-character VIN, reassembled across frames.
    pub async fn read_vin(&self) -> Result<String, crate::Error> {
        let request = DiagnosticMessage::request(
            ObdService::VehicleInfo as u8,
            None,
            &[obd::VEHICLE_INFO_VIN],
        );
        let response = self.engine.send(request).await?;

        match response.data.split_first() {
            Some((echoed, rest)) if *echoed == obd::VEHICLE_INFO_VIN => {
                Ok(obd::parse_vin(rest)?)
            }
            _ => Err(obd::Error::InvalidVin(hex::encode(&response.data)).into()),
        }
    }

    /// UDS 0x22: read a data identifier. The response must echo the DID.
    pub async fn read_did(&self, did: u16) -> Result<Vec<u8>, crate::Error> {
        let id = did.to_be_bytes();
        let request = DiagnosticMessage::request(
            ServiceIdentifier::ReadDataByIdentifier as u8,
            None,
            &id,
        );
        let response = self.engine.send(request).await?;

        if response.data.len() < 2 {
            return Err(crate::uds::Error::InvalidResponseLength.into());
        }
        let echoed = u16::from_be_bytes([response.data[0], response.data[1]]);
        if echoed != did {
            return Err(crate::uds::Error::InvalidDataIdentifier(echoed).into());
        }
        Ok(response.data[2..].to_vec())
    }

    // --- Session and control services ---------------------------------

    /// UDS 0x10 via the engine's state machine.
    pub async fn start_session(
        &self,
        session: SessionKind,
        ecu_address: Option<u32>,
    ) -> Result<Option<SessionParameterRecord>, crate::Error> {
        self.engine.start_session(session, ecu_address).await
    }

    pub async fn end_session(&self) -> Result<(), crate::Error> {
        self.engine.end_session().await
    }

    /// UDS 0x3E with a required response.
    pub async fn tester_present(&self) -> Result<(), crate::Error> {
        let request = DiagnosticMessage::request(
            ServiceIdentifier::TesterPresent as u8,
            Some(0x00),
            &[],
        );
        self.engine.send(request).await?;
        Ok(())
    }

    /// UDS 0x27 seed/key dialog. `compute_key` maps the ECU's seed to the
    /// key for `level`. An all-zero seed means security is already open.
    pub async fn security_access(
        &self,
        level: u8,
        compute_key: impl Fn(&[u8]) -> Vec<u8>,
    ) -> Result<(), crate::Error> {
        let request = DiagnosticMessage::request(
            ServiceIdentifier::SecurityAccess as u8,
            Some(level),
            &[],
        );
        let seed = match self.engine.send(request).await {
            Ok(response) => response.data,
            Err(err) => {
                self.engine.events().publish(EventKind::SecurityAccessAttempted {
                    level,
                    granted: false,
                });
                return Err(err);
            }
        };

        if seed.iter().all(|b| *b == 0) {
            debug!("security level {:#04x} already unlocked", level);
            self.engine.events().publish(EventKind::SecurityAccessAttempted {
                level,
                granted: true,
            });
            return Ok(());
        }

        let key = compute_key(&seed);
        let request = DiagnosticMessage::request(
            ServiceIdentifier::SecurityAccess as u8,
            Some(level + 1),
            &key,
        );
        let granted = self.engine.send(request).await;
        self.engine.events().publish(EventKind::SecurityAccessAttempted {
            level,
            granted: granted.is_ok(),
        });
        granted.map(|_| ())
    }

    /// UDS 0x31: routine control. The response must echo the routine id.
    pub async fn routine_control(
        &self,
        operation: RoutineOperation,
        routine_id: u16,
        parameters: &[u8],
    ) -> Result<Vec<u8>, crate::Error> {
        let mut data = routine_id.to_be_bytes().to_vec();
        data.extend(parameters);
        let request = DiagnosticMessage::request(
            ServiceIdentifier::RoutineControl as u8,
            Some(operation as u8),
            &data,
        );
        let response = self.engine.send(request).await?;

        if response.data.len() < 2 {
            return Err(crate::uds::Error::InvalidResponseLength.into());
        }
        let echoed = u16::from_be_bytes([response.data[0], response.data[1]]);
        if echoed != routine_id {
            return Err(crate::uds::Error::InvalidRoutineIdentifier(echoed).into());
        }
        Ok(response.data[2..].to_vec())
    }

    /// UDS 0x11: ECU reset. After a reset that reboots the module, waits
    /// briefly and probes with Tester Present; the probe failing is not an
    /// error. The rapid power shutdown pair only arms/disarms a mode and
    /// triggers no reconnect.
    pub async fn ecu_reset(&self, kind: ResetKind) -> Result<(), crate::Error> {
        let request =
            DiagnosticMessage::request(ServiceIdentifier::EcuReset as u8, Some(kind as u8), &[]);
        self.engine.send(request).await?;

        if matches!(
            kind,
            ResetKind::HardReset | ResetKind::KeyOffOnReset | ResetKind::SoftReset
        ) {
            tokio::time::sleep(RESET_RECONNECT_DELAY).await;
            if let Err(err) = self.tester_present().await {
                warn!("ECU not back after reset yet: {}", err);
            }
        }
        Ok(())
    }

    /// UDS 0x2F: input/output control by identifier.
    pub async fn io_control(
        &self,
        did: u16,
        parameter: IoControlParameter,
        state: &[u8],
    ) -> Result<Vec<u8>, crate::Error> {
        let mut data = did.to_be_bytes().to_vec();
        data.push(parameter as u8);
        data.extend(state);
        let request = DiagnosticMessage::request(
            ServiceIdentifier::InputOutputControlByIdentifier as u8,
            None,
            &data,
        );
        let response = self.engine.send(request).await?;

        if response.data.len() < 2 {
            return Err(crate::uds::Error::InvalidResponseLength.into());
        }
        let echoed = u16::from_be_bytes([response.data[0], response.data[1]]);
        if echoed != did {
            return Err(crate::uds::Error::InvalidDataIdentifier(echoed).into());
        }
        Ok(response.data[2..].to_vec())
    }
}
