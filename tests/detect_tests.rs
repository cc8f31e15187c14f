//! Protocol detection against a scripted adapter.

use std::time::Duration;

use diaglink::adapter::Elm327;
use diaglink::protocol::{
    DetectError, DetectionProgress, DetectorConfig, DetectorState, ProtocolDetector, ProtocolType,
    VehicleHints,
};
use diaglink::transport::mock::{Expect, MockChunk};
use diaglink::transport::MockTransport;
use tokio_stream::StreamExt;

fn quick_config() -> DetectorConfig {
    DetectorConfig {
        test_timeout: Duration::from_millis(300),
        retries_per_protocol: 1,
        retry_delay: Duration::from_millis(10),
        ..DetectorConfig::default()
    }
}

#[tokio::test]
async fn first_candidate_wins_when_vehicle_answers() {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("0100", "4100BE3FA813");

    let mut adapter = Elm327::new(Box::new(mock));
    adapter.reset().await.unwrap();

    let mut detector =
        ProtocolDetector::new(&mut adapter, quick_config(), VehicleHints::default());
    let detection = detector.detect().await.unwrap();

    assert_eq!(detection.protocol, ProtocolType::Iso15765_4Can11Bit500K);
    assert_eq!(
        detection.tested,
        vec![ProtocolType::Iso15765_4Can11Bit500K]
    );
    assert_eq!(
        detector.state(),
        DetectorState::Detected(ProtocolType::Iso15765_4Can11Bit500K)
    );
}

#[tokio::test]
async fn detection_is_deterministic_for_the_nth_candidate() {
    let mut mock = MockTransport::with_defaults();
    // First candidate sees a silent bus, the second one answers.
    mock.expect_next(
        Expect::Exact("0100".into()),
        vec![MockChunk::new(Duration::ZERO, "NO DATA\r\r>")],
    );
    mock.on_obd("0100", "4100BE3FA813");

    let mut adapter = Elm327::new(Box::new(mock));
    adapter.reset().await.unwrap();

    let mut detector =
        ProtocolDetector::new(&mut adapter, quick_config(), VehicleHints::default());
    let detection = detector.detect().await.unwrap();

    assert_eq!(detection.protocol, ProtocolType::Iso15765_4Can29Bit500K);
    assert_eq!(
        detection.tested,
        vec![
            ProtocolType::Iso15765_4Can11Bit500K,
            ProtocolType::Iso15765_4Can29Bit500K,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn silent_vehicle_exhausts_candidates() {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("0100", "NO DATA");

    let mut adapter = Elm327::new(Box::new(mock));
    adapter.reset().await.unwrap();

    let mut detector =
        ProtocolDetector::new(&mut adapter, quick_config(), VehicleHints::default());
    let err = detector.detect().await.unwrap_err();

    assert_eq!(err, diaglink::Error::Detect(DetectError::NoProtocolFound));
    assert_eq!(detector.state(), DetectorState::Failed(DetectError::NoProtocolFound));
}

#[tokio::test]
async fn cancellation_reports_partial_tested_set() {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("0100", "4100BE3FA813");

    let mut adapter = Elm327::new(Box::new(mock));
    adapter.reset().await.unwrap();

    let mut detector =
        ProtocolDetector::new(&mut adapter, quick_config(), VehicleHints::default());
    detector.cancel_token().cancel();

    let err = detector.detect().await.unwrap_err();
    assert_eq!(err, diaglink::Error::Detect(DetectError::Cancelled));
    assert_eq!(detector.state(), DetectorState::Cancelled);
}

#[tokio::test]
async fn progress_stream_narrates_the_run() {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("0100", "4100BE3FA813");

    let mut adapter = Elm327::new(Box::new(mock));
    adapter.reset().await.unwrap();

    let mut detector =
        ProtocolDetector::new(&mut adapter, quick_config(), VehicleHints::default());
    let mut progress = detector.progress();
    detector.detect().await.unwrap();

    let started = progress.next().await.unwrap();
    assert!(matches!(started, DetectionProgress::Started { total: 8 }));

    let testing = progress.next().await.unwrap();
    assert!(matches!(
        testing,
        DetectionProgress::Testing {
            protocol: ProtocolType::Iso15765_4Can11Bit500K,
            index: 0,
            ..
        }
    ));

    let tested = progress.next().await.unwrap();
    assert!(matches!(
        tested,
        DetectionProgress::TestedProtocol { success: true, .. }
    ));

    let detected = progress.next().await.unwrap();
    assert!(matches!(detected, DetectionProgress::Detected { .. }));
}

#[tokio::test(start_paused = true)]
async fn global_deadline_bounds_the_run() {
    let mut mock = MockTransport::with_defaults();
    // Every probe needs 300 ms of bus silence before NO DATA.
    mock.on_chunks(
        Expect::Exact("0100".into()),
        vec![MockChunk::new(Duration::from_millis(300), "NO DATA\r\r>")],
    );

    let mut adapter = Elm327::new(Box::new(mock));
    adapter.reset().await.unwrap();

    let config = DetectorConfig {
        test_timeout: Duration::from_millis(500),
        total_timeout: Duration::from_millis(400),
        retries_per_protocol: 1,
        ..DetectorConfig::default()
    };
    let mut detector = ProtocolDetector::new(&mut adapter, config, VehicleHints::default());
    let err = detector.detect().await.unwrap_err();
    assert_eq!(err, diaglink::Error::Detect(DetectError::Timeout));
}
