//! Frame layer behavior end to end: multi-frame reception with flow
//! control, and segmented transmission paced by the peer's flow control.

use diaglink::adapter::Elm327;
use diaglink::protocol::ProtocolType;
use diaglink::services::DiagnosticClient;
use diaglink::session::{DiagnosticMessage, ProtocolConfig, SessionEngine};
use diaglink::transport::mock::Expect;
use diaglink::transport::MockTransport;

fn can_config() -> ProtocolConfig {
    ProtocolConfig::builder()
        .preferred_protocol(ProtocolType::Iso15765_4Can11Bit500K)
        .padding(false, 0x00)
        .build()
        .unwrap()
}

#[tokio::test]
async fn multi_frame_vin_reassembly() {
    let mut mock = MockTransport::with_defaults();
    // FF announces 20 bytes; the engine answers with flow control and the
    // ECU streams two consecutive frames.
    mock.on_obd("020902", "1014490201314847");
    mock.on(
        Expect::Exact("300000".into()),
        "21434D3832363333\r2241303034333532\r\r>",
    );

    let sent = mock.sent();
    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), can_config());
    engine.initialize().await.unwrap();

    let client = DiagnosticClient::new(&engine);
    let vin = client.read_vin().await.unwrap();

    assert_eq!(vin, "1HGCM82633A004352");
    // The engine must have answered the first frame with flow control.
    assert_eq!(sent.count_of("300000"), 1);
}

#[tokio::test]
async fn segmented_request_honors_flow_control() {
    let mut mock = MockTransport::with_defaults();
    // WriteDataByIdentifier with a 10-byte record: FF + 1 CF.
    mock.on_obd("100D2EF1900A0B0C", "300000");
    mock.on_obd("210D0E0F10111213", "036EF190");

    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), can_config());
    engine.initialize().await.unwrap();

    let record = [0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11, 0x12, 0x13];
    let mut data = vec![0xf1, 0x90];
    data.extend(record);
    let response = engine
        .send(DiagnosticMessage::request(0x2e, None, &data))
        .await
        .unwrap();

    assert!(!response.negative);
    assert_eq!(response.data, vec![0xf1, 0x90]);
}

#[tokio::test]
async fn flow_control_overflow_aborts_transmission() {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("100D2EF1900A0B0C", "320000");

    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), can_config());
    engine.initialize().await.unwrap();

    let mut data = vec![0xf1, 0x90];
    data.extend([0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11, 0x12, 0x13]);
    let err = engine
        .send(DiagnosticMessage::request(0x2e, None, &data))
        .await
        .unwrap_err();

    assert_eq!(err, diaglink::Error::IsoTp(diaglink::isotp::Error::Overflow));
}

#[tokio::test]
async fn out_of_order_consecutive_frame_rejects_message() {
    let mut mock = MockTransport::with_defaults();
    // Sequence number jumps from FF to CF #2.
    mock.on_obd("020902", "1014490201314847");
    mock.on(
        Expect::Exact("300000".into()),
        "2241303034333532\r\r>",
    );

    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), can_config());
    engine.initialize().await.unwrap();

    let err = engine
        .send(DiagnosticMessage::request(0x09, None, &[0x02]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        diaglink::Error::IsoTp(diaglink::isotp::Error::OutOfOrder)
    );
}
