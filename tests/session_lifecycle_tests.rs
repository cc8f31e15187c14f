//! Session lifecycle: start/end, keep-alive, loss detection, reset.

use std::time::Duration;

use diaglink::adapter::Elm327;
use diaglink::event::EventKind;
use diaglink::protocol::ProtocolType;
use diaglink::session::{
    ProtocolConfig, ProtocolState, SessionEngine, SessionFault,
};
use diaglink::transport::mock::{Expect, MockChunk};
use diaglink::transport::MockTransport;
use diaglink::uds::SessionKind;
use tokio_stream::StreamExt;

fn can_config() -> ProtocolConfig {
    ProtocolConfig::builder()
        .preferred_protocol(ProtocolType::Iso15765_4Can11Bit500K)
        .padding(false, 0x00)
        .keep_alive_interval(Duration::from_millis(2000))
        .build()
        .unwrap()
}

fn session_mock() -> MockTransport {
    let mut mock = MockTransport::with_defaults();
    mock.on_obd("021003", "065003003201F4");
    mock.on_obd("021001", "065001003201F4");
    mock
}

async fn ready_engine(mock: MockTransport) -> SessionEngine {
    let engine = SessionEngine::new(Elm327::new(Box::new(mock)), can_config());
    engine.initialize().await.unwrap();
    engine
}

#[tokio::test]
async fn extended_session_parses_timing_record() {
    let engine = ready_engine(session_mock()).await;

    let record = engine
        .start_session(SessionKind::Extended, None)
        .await
        .unwrap()
        .expect("timing record expected");

    assert_eq!(record.p2_server_max, Duration::from_millis(50));
    assert_eq!(record.p2_star_server_max, Duration::from_millis(5000));
    assert_eq!(
        engine.state(),
        ProtocolState::SessionActive(SessionKind::Extended)
    );
}

#[tokio::test]
async fn end_session_returns_to_ready() {
    let engine = ready_engine(session_mock()).await;

    engine
        .start_session(SessionKind::Extended, None)
        .await
        .unwrap();
    engine.end_session().await.unwrap();

    assert_eq!(engine.state(), ProtocolState::Ready);
    let backlog = engine.events().backlog();
    assert!(backlog.iter().any(|e| matches!(
        &e.kind,
        EventKind::SessionEnded { reason, .. } if reason == "requested"
    )));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_ticks_while_session_active() {
    let mut mock = session_mock();
    // Suppressed Tester Present: the bus stays silent, the adapter says so.
    mock.on_obd("023E80", "NO DATA");

    let sent = mock.sent();
    let engine = ready_engine(mock).await;
    engine
        .start_session(SessionKind::Extended, None)
        .await
        .unwrap();

    let mut events = engine.events().subscribe();
    let mut seen = 0;
    while seen < 2 {
        let event = tokio::time::timeout(Duration::from_secs(30), events.next())
            .await
            .expect("keep-alive events expected")
            .unwrap();
        if matches!(event.kind, EventKind::KeepAliveSent { success: true }) {
            seen += 1;
        }
    }
    assert!(sent.count_of("023E80") >= 2);
    assert_eq!(
        engine.state(),
        ProtocolState::SessionActive(SessionKind::Extended)
    );
}

#[tokio::test(start_paused = true)]
async fn keep_alive_loss_enters_session_lost() {
    let mut mock = session_mock();
    // Tester Present never gets a prompt back: hard timeout every attempt.
    mock.on_chunks(
        Expect::Exact("023E80".into()),
        vec![MockChunk::new(Duration::from_secs(3600), ">")],
    );

    let engine = ready_engine(mock).await;
    let mut events = engine.events().subscribe();

    engine
        .start_session(SessionKind::Extended, None)
        .await
        .unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = events.next().await.unwrap();
            if let EventKind::SessionEnded { reason, .. } = &event.kind {
                break reason.clone();
            }
        }
    })
    .await
    .expect("session loss expected");

    assert_eq!(ended, "keep_alive_lost");
    assert_eq!(
        engine.state(),
        ProtocolState::Error(SessionFault::SessionLost)
    );

    // Only reset leaves the error state.
    let err = engine
        .send(diaglink::session::DiagnosticMessage::request(
            0x01,
            None,
            &[0x0c],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "session");

    engine.reset().await.unwrap();
    assert_eq!(engine.state(), ProtocolState::Ready);
    assert_eq!(engine.last_sequence(), 0);
}

#[tokio::test]
async fn session_events_are_ordered_and_timestamped() {
    let engine = ready_engine(session_mock()).await;
    engine
        .start_session(SessionKind::Extended, None)
        .await
        .unwrap();
    engine.end_session().await.unwrap();

    let backlog = engine.events().backlog();
    assert!(!backlog.is_empty());
    for pair in backlog.windows(2) {
        assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
    }

    let started_at = backlog
        .iter()
        .position(|e| matches!(e.kind, EventKind::SessionStarted { .. }))
        .unwrap();
    let ended_at = backlog
        .iter()
        .position(|e| matches!(e.kind, EventKind::SessionEnded { .. }))
        .unwrap();
    assert!(started_at < ended_at);
}
