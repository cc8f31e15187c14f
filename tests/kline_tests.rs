//! K-line (ISO 9141-2) exchanges: header parsing and checksum policy.

use diaglink::adapter::Elm327;
use diaglink::protocol::ProtocolType;
use diaglink::services::DiagnosticClient;
use diaglink::session::{ProtocolConfig, SessionEngine};
use diaglink::transport::MockTransport;

fn kline_config(headers: bool) -> ProtocolConfig {
    ProtocolConfig::builder()
        .preferred_protocol(ProtocolType::Iso9141_2)
        .headers(headers)
        .build()
        .unwrap()
}

#[tokio::test]
async fn headered_response_verifies_checksum_and_source() {
    let mut mock = MockTransport::with_defaults();
    // 48 6B 10: ISO 9141 header from ECU 0x10; trailing 0x22 is the sum.
    mock.on_obd("010C", "486B10410C1AF822");

    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), kline_config(true));
    engine.initialize().await.unwrap();

    let client = DiagnosticClient::new(&engine);
    let rpm = client.read_current_pid(0x0c).await.unwrap();
    assert_eq!(rpm.value, 1726.0);

    let ecus = engine.ecus();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].address, 0x10);
}

#[tokio::test]
async fn corrupted_checksum_is_a_protocol_violation() {
    let mut mock = MockTransport::with_defaults();
    let sent = mock.sent();
    mock.on_obd("010C", "486B10410C1AF823");

    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), kline_config(true));
    engine.initialize().await.unwrap();

    let err = engine
        .send(diaglink::session::DiagnosticMessage::request(
            0x01,
            None,
            &[0x0c],
        ))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "protocol_violation");
    // Violations are surfaced immediately, not retried.
    assert_eq!(sent.count_of("010C"), 1);
}

#[tokio::test]
async fn headerless_kline_passes_payload_through() {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("0103", "43014304200000");

    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), kline_config(false));
    engine.initialize().await.unwrap();

    let client = DiagnosticClient::new(&engine);
    let dtcs = client.read_stored_dtcs().await.unwrap();
    let codes: Vec<&str> = dtcs.iter().map(|d| d.code.as_str()).collect();
    // Padding pair (0, 0) is skipped.
    assert_eq!(codes, vec!["P0143", "P0420"]);
}
