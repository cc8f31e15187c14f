//! Service and data identifiers used in the UDS protocol.

/// UDS Service Identifiers as defined in ISO 14229. The OBD-II services
/// (0x01-0x0A) live in [`crate::obd::ObdService`].
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
#[repr(u8)]
pub enum ServiceIdentifier {
    DiagnosticSessionControl = 0x10,
    EcuReset = 0x11,
    ClearDiagnosticInformation = 0x14,
    ReadDtcInformation = 0x19,
    ReadDataByIdentifier = 0x22,
    ReadMemoryByAddress = 0x23,
    SecurityAccess = 0x27,
    CommunicationControl = 0x28,
    WriteDataByIdentifier = 0x2e,
    InputOutputControlByIdentifier = 0x2f,
    RoutineControl = 0x31,
    RequestDownload = 0x34,
    RequestUpload = 0x35,
    TransferData = 0x36,
    RequestTransferExit = 0x37,
    TesterPresent = 0x3e,
    ControlDtcSetting = 0x85,
    NegativeResponse = 0x7f,
}

/// Bit 7 of a sub-function byte requests a suppressed positive response.
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// ReadDTCInformation (0x19) report sub-functions used by the service layer.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum DtcReportType {
    ReportNumberOfDtcByStatusMask = 0x01,
    ReportDtcByStatusMask = 0x02,
    ReportDtcSnapshotRecordByDtcNumber = 0x04,
    ReportSupportedDtc = 0x0a,
}

/// Standardized Data Identifiers from ISO 14229 Annex C.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u16)]
pub enum DataIdentifier {
    BootSoftwareIdentification = 0xf180,
    ApplicationSoftwareIdentification = 0xf181,
    ApplicationDataIdentification = 0xf182,
    ActiveDiagnosticSession = 0xf186,
    VehicleManufacturerSparePartNumber = 0xf187,
    VehicleManufacturerEcuSoftwareNumber = 0xf188,
    VehicleManufacturerEcuSoftwareVersionNumber = 0xf189,
    SystemSupplierIdentifier = 0xf18a,
    EcuManufacturingDate = 0xf18b,
    EcuSerialNumber = 0xf18c,
    Vin = 0xf190,
    SystemNameOrEngineType = 0xf197,
}
