//! Diagnostic session engine, implements the uniform request/response
//! contract above OBD-II and UDS.
//!
//! The engine owns the adapter, the protocol state machine, message
//! sequencing, retries, NRC policy and the Tester Present timer. All
//! exchanges for one engine are serialized through an exclusive lock on the
//! adapter; state transitions use a separate lock so observers stay
//! consistent while an exchange is in flight.
//! ## Example
//! ```
//! # async fn engine_example(adapter: diaglink::adapter::Elm327) {
//! use diaglink::session::{DiagnosticMessage, ProtocolConfig, SessionEngine};
//!
//! let engine = SessionEngine::new(adapter, ProtocolConfig::default());
//! engine.initialize().await.unwrap();
//!
//! let response = engine
//!     .send(DiagnosticMessage::request(0x01, None, &[0x0c]))
//!     .await
//!     .unwrap();
//! println!("RPM raw: {:?}", response.data);
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod ecu;
pub mod error;
pub mod message;
pub mod state;

pub use capabilities::ProtocolCapabilities;
pub use config::{ProtocolConfig, ProtocolConfigBuilder};
pub use ecu::{Ecu, EcuCapabilities, EcuKind};
pub use error::{ConfigError, Error};
pub use message::{DiagnosticMessage, Direction};
pub use state::{ProtocolState, SessionFault};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::Elm327;
use crate::event::{EventBus, EventKind};
use crate::isotp::constants::{DEFAULT_N_BS_MS, DEFAULT_N_CR_MS};
use crate::isotp::{self, Assembler, AssemblerAction, IsoTpFrame, Transmitter, TxAction};
use crate::protocol::{DetectorConfig, ProtocolDetector, ProtocolType, VehicleHints};
use crate::uds::{self, NrcPolicy, ServiceIdentifier, SessionKind, SessionParameterRecord};

const KEEP_ALIVE_FAILURE_LIMIT: u32 = 3;
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_millis(500);
/// Deadline for the prompt after writing an intermediate frame.
const FRAME_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// The session engine. Cheap to clone; all clones share one adapter and
/// one state machine.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    /// Serializes all exchanges (the message mutex).
    adapter: AsyncMutex<Elm327>,
    /// Observer-consistent state (the state mutex).
    state: Mutex<ProtocolState>,
    protocol: Mutex<Option<ProtocolType>>,
    config: ProtocolConfig,
    sequence: AtomicU64,
    events: EventBus,
    ecus: Mutex<HashMap<u32, Ecu>>,
    keep_alive: Mutex<Option<KeepAliveHandle>>,
    /// P2* adopted from the ECU's session parameter record.
    adopted_extended: Mutex<Option<Duration>>,
}

struct KeepAliveHandle {
    stop: watch::Sender<bool>,
}

impl SessionEngine {
    pub fn new(adapter: Elm327, config: ProtocolConfig) -> Self {
        let events = EventBus::new(config.event_backlog);
        Self {
            inner: Arc::new(Inner {
                adapter: AsyncMutex::new(adapter),
                state: Mutex::new(ProtocolState::Uninitialized),
                protocol: Mutex::new(None),
                config,
                sequence: AtomicU64::new(0),
                events,
                ecus: Mutex::new(HashMap::new()),
                keep_alive: Mutex::new(None),
                adopted_extended: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ProtocolState {
        *self.inner.state.lock().unwrap()
    }

    pub fn protocol(&self) -> Option<ProtocolType> {
        *self.inner.protocol.lock().unwrap()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// Telemetry handle; subscribe before driving the engine to see
    /// everything.
    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Capability view for the current protocol and session.
    pub fn capabilities(&self) -> Option<ProtocolCapabilities> {
        let protocol = self.protocol()?;
        let session = self
            .state()
            .active_session()
            .unwrap_or(SessionKind::Default);
        Some(ProtocolCapabilities::derive(protocol, session))
    }

    /// Immutable snapshot of the ECU registry.
    pub fn ecus(&self) -> Vec<Ecu> {
        let mut ecus: Vec<Ecu> = self.inner.ecus.lock().unwrap().values().cloned().collect();
        ecus.sort_by_key(|ecu| ecu.address);
        ecus
    }

    /// Sequence number of the most recently transmitted request.
    pub fn last_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Bring the engine to Ready: reset the adapter, pick the protocol
    /// (preferred or auto-detected) and apply its session profile.
    pub async fn initialize(&self) -> Result<ProtocolType, crate::Error> {
        self.inner.expect_state("initialize", |s| {
            matches!(s, ProtocolState::Uninitialized)
        })?;

        let mut adapter = self.inner.adapter.lock().await;
        adapter.reset().await?;

        let protocol = match self.inner.config.preferred_protocol {
            Some(protocol) => protocol,
            None => {
                let detector_config = DetectorConfig::default();
                let started = Instant::now();
                let mut detector =
                    ProtocolDetector::new(&mut adapter, detector_config, VehicleHints::default());
                let detection = detector.detect().await?;
                self.inner.events.publish(EventKind::ProtocolDetected {
                    protocol: detection.protocol,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                detection.protocol
            }
        };

        let profile = protocol.session_profile(
            self.inner.config.response_timeout,
            self.inner.config.headers,
            self.inner.config.target_address,
        );
        adapter.apply_profile(&profile).await?;
        drop(adapter);

        *self.inner.protocol.lock().unwrap() = Some(protocol);
        self.inner.transition(ProtocolState::Ready);
        info!("engine ready on {}", protocol);
        Ok(protocol)
    }

    /// Send a request and await its validated response.
    pub async fn send(&self, request: DiagnosticMessage) -> Result<DiagnosticMessage, crate::Error> {
        self.inner.send_message(request, None).await
    }

    /// As [`send`], overriding the response deadline.
    ///
    /// [`send`]: SessionEngine::send
    pub async fn send_with_timeout(
        &self,
        request: DiagnosticMessage,
        timeout: Duration,
    ) -> Result<DiagnosticMessage, crate::Error> {
        self.inner.send_message(request, Some(timeout)).await
    }

    /// Raw hex exchange bypassing message validation. The engine must
    /// still be initialized; the exchange is serialized like any other.
    pub async fn send_raw(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, crate::Error> {
        self.inner.expect_state("send_raw", ProtocolState::can_send)?;
        let mut adapter = self.inner.adapter.lock().await;
        adapter.exchange(payload, timeout).await
    }

    /// Enter a diagnostic session on the ECU, starting the Tester Present
    /// timer when the session needs it.
    pub async fn start_session(
        &self,
        session: SessionKind,
        ecu_address: Option<u32>,
    ) -> Result<Option<SessionParameterRecord>, crate::Error> {
        self.inner.expect_state("start_session", ProtocolState::can_send)?;

        if let Some(address) = ecu_address {
            self.inner.retarget(address).await?;
        }

        let request =
            DiagnosticMessage::request(ServiceIdentifier::DiagnosticSessionControl as u8,
                Some(session.sub_function(false)), &[]);
        let response = self.inner.send_message(request, None).await?;

        let record = SessionParameterRecord::parse(&response.data);
        if let Some(record) = record {
            // The ECU's own P2* bounds response-pending waits better than
            // our static default.
            *self.inner.adopted_extended.lock().unwrap() = Some(record.p2_star_server_max);
        }

        self.inner.transition(ProtocolState::SessionActive(session));
        self.inner.events.publish(EventKind::SessionStarted {
            session,
            ecu_address,
        });

        if session.keep_alive_required() {
            self.start_keep_alive(session);
        }
        Ok(record)
    }

    /// Return the ECU to the default session and stop the keep-alive.
    pub async fn end_session(&self) -> Result<(), crate::Error> {
        let session = self
            .state()
            .active_session()
            .ok_or_else(|| Error::InvalidState {
                operation: "end_session",
                state: self.state(),
            })?;

        self.stop_keep_alive();

        // Best effort: the ECU falls back by itself once Tester Present
        // stops.
        let request = DiagnosticMessage::request(
            ServiceIdentifier::DiagnosticSessionControl as u8,
            Some(SessionKind::Default.sub_function(false)),
            &[],
        );
        if let Err(err) = self.inner.send_message(request, None).await {
            warn!("default session restore failed: {}", err);
        }

        *self.inner.adopted_extended.lock().unwrap() = None;
        self.inner.transition(ProtocolState::Ready);
        self.inner.events.publish(EventKind::SessionEnded {
            session,
            reason: "requested".into(),
        });
        Ok(())
    }

    /// Recover from the Error state: re-initialize the adapter, clear
    /// counters, return to Ready.
    pub async fn reset(&self) -> Result<(), crate::Error> {
        self.inner.expect_state("reset", |s| {
            !matches!(s, ProtocolState::Shutdown | ProtocolState::Uninitialized)
        })?;

        self.stop_keep_alive();

        let protocol = self.protocol().ok_or(Error::InvalidState {
            operation: "reset",
            state: ProtocolState::Uninitialized,
        })?;

        let mut adapter = self.inner.adapter.lock().await;
        adapter.reset().await?;
        let profile = protocol.session_profile(
            self.inner.config.response_timeout,
            self.inner.config.headers,
            self.inner.config.target_address,
        );
        adapter.apply_profile(&profile).await?;
        drop(adapter);

        self.inner.sequence.store(0, Ordering::SeqCst);
        *self.inner.adopted_extended.lock().unwrap() = None;
        self.inner.transition(ProtocolState::Ready);
        Ok(())
    }

    /// Terminal: cancel timers and stop accepting work. The transport is
    /// released when the engine is dropped.
    pub async fn shutdown(&self) {
        self.stop_keep_alive();
        self.inner.transition(ProtocolState::Shutdown);
    }

    fn start_keep_alive(&self, session: SessionKind) {
        let (stop, mut stopped) = watch::channel(false);
        let inner = self.inner.clone();
        let interval = self.inner.config.keep_alive_interval;

        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut ticker =
                tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }

                if !matches!(
                    *inner.state.lock().unwrap(),
                    ProtocolState::SessionActive(_)
                ) {
                    break;
                }

                match inner.keep_alive_tick().await {
                    Ok(()) => {
                        failures = 0;
                        inner
                            .events
                            .publish(EventKind::KeepAliveSent { success: true });
                    }
                    Err(err) => {
                        failures += 1;
                        warn!("keep-alive failed ({failures}): {err}");
                        inner
                            .events
                            .publish(EventKind::KeepAliveSent { success: false });

                        if failures >= KEEP_ALIVE_FAILURE_LIMIT {
                            inner.transition(ProtocolState::Error(SessionFault::SessionLost));
                            inner.events.publish(EventKind::SessionEnded {
                                session,
                                reason: "keep_alive_lost".into(),
                            });
                            break;
                        }
                    }
                }
            }
        });

        *self.inner.keep_alive.lock().unwrap() = Some(KeepAliveHandle { stop });
    }

    fn stop_keep_alive(&self) {
        if let Some(handle) = self.inner.keep_alive.lock().unwrap().take() {
            let _ = handle.stop.send(true);
        }
    }
}

impl Inner {
    fn expect_state(
        &self,
        operation: &'static str,
        accept: impl Fn(&ProtocolState) -> bool,
    ) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        if accept(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: *state,
            })
        }
    }

    fn transition(&self, to: ProtocolState) {
        let from = {
            let mut state = self.state.lock().unwrap();
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        info!("state {} -> {}", from, to);
        self.events.publish(EventKind::StateChanged { from, to });
    }

    fn current_protocol(&self) -> Result<ProtocolType, Error> {
        self.protocol.lock().unwrap().ok_or(Error::InvalidState {
            operation: "send",
            state: ProtocolState::Uninitialized,
        })
    }

    fn extended_timeout(&self) -> Duration {
        self.adopted_extended
            .lock()
            .unwrap()
            .unwrap_or(self.config.extended_timeout)
            .max(self.config.extended_timeout)
    }

    /// Point subsequent requests at a physical ECU address.
    async fn retarget(&self, address: u32) -> Result<(), crate::Error> {
        let protocol = self.current_protocol()?;
        if !protocol.is_can() {
            return Ok(());
        }
        let command = match protocol.bit_width() {
            Some(11) => format!("ATSH{:03X}", address & 0x7ff),
            _ => format!("ATSH{:08X}", address & 0x1fff_ffff),
        };
        let mut adapter = self.adapter.lock().await;
        adapter.command(&command, FRAME_WRITE_TIMEOUT).await?;
        Ok(())
    }

    /// The exchange contract: serialize, transmit, await a validated
    /// response, applying the NRC policy table and the retry budget.
    async fn send_message(
        &self,
        mut request: DiagnosticMessage,
        timeout_override: Option<Duration>,
    ) -> Result<DiagnosticMessage, crate::Error> {
        self.expect_state("send", ProtocolState::can_send)?;
        let protocol = self.current_protocol()?;

        request.direction = Direction::Request;
        request.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if request.target.is_none() {
            request.target = self.config.target_address;
        }

        let timeout =
            timeout_override.unwrap_or_else(|| self.config.timeout_for(request.service_id));
        let bytes = request.to_bytes();

        let mut adapter = self.adapter.lock().await;
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut nrc_retry_used = false;

        loop {
            self.events.publish(EventKind::MessageSent {
                sequence: request.sequence,
                service_id: request.service_id,
                bytes: bytes.clone(),
            });
            if self.config.structured_logging {
                debug!(sequence = request.sequence, "TX {}", hex::encode(&bytes));
            }

            let outcome = self
                .transmit_and_receive(
                    &mut adapter,
                    protocol,
                    &bytes,
                    timeout,
                    request.suppresses_response(),
                )
                .await;

            let (source, payload) = match outcome {
                Ok(None) => {
                    let mut response = DiagnosticMessage::request(
                        uds::positive_response_sid(request.service_id),
                        None,
                        &[],
                    );
                    response.direction = Direction::Response;
                    response.sequence = request.sequence;
                    return Ok(response);
                }
                Ok(Some(pair)) => pair,
                Err(err) => {
                    self.publish_exchange_error(&request, &err, timeout);
                    if attempt < self.config.max_retries && is_recoverable(&err) {
                        attempt += 1;
                        warn!(
                            "attempt {}/{} failed ({}), retrying",
                            attempt, self.config.max_retries, err
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                    if matches!(
                        err,
                        crate::Error::Transport(crate::transport::Error::Disconnected)
                    ) {
                        self.transition(ProtocolState::Error(SessionFault::Transport));
                    }
                    if attempt > 0 {
                        return Err(Error::RetriesExhausted {
                            attempts: attempt + 1,
                            last_error: err.to_string(),
                        }
                        .into());
                    }
                    return Err(err);
                }
            };

            // NRC 0x78 extends the timer transparently, without consuming
            // a retry.
            let (source, payload) = {
                let mut pending = (source, payload);
                loop {
                    match uds::parse_negative_response(&pending.1) {
                        Some((_, nrc)) if nrc.policy() == NrcPolicy::ExtendTimer => {
                            self.events.publish(EventKind::NegativeResponseReceived {
                                service_id: request.service_id,
                                nrc,
                            });
                            debug!("response pending, extending timer");
                            pending = self
                                .receive_pdu(&mut adapter, protocol, self.extended_timeout(), Vec::new())
                                .await?;
                        }
                        _ => break pending,
                    }
                }
            };

            let mut response = match DiagnosticMessage::response_from_bytes(&payload, &request) {
                Ok(response) => response,
                Err(err) => {
                    // Malformed responses are protocol violations, never
                    // retried.
                    self.events.publish(EventKind::ErrorOccurred {
                        context: "validate_response".into(),
                        error: err.to_string(),
                    });
                    return Err(err);
                }
            };
            response.source = source;

            if response.negative {
                let nrc = response.nrc.expect("negative response carries an NRC");
                self.events.publish(EventKind::NegativeResponseReceived {
                    service_id: request.service_id,
                    nrc,
                });

                let retry = match nrc.policy() {
                    NrcPolicy::RetryAfterBackoff => attempt < self.config.max_retries,
                    NrcPolicy::RetryOnce => {
                        !nrc_retry_used && attempt < self.config.max_retries
                    }
                    _ => false,
                };
                if retry {
                    if nrc.policy() == NrcPolicy::RetryOnce {
                        nrc_retry_used = true;
                    }
                    attempt += 1;
                    warn!("NRC {:#04x}, retrying after backoff", nrc.byte());
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }

                warn!(
                    "service {:#04x} rejected with NRC {:#04x}",
                    request.service_id,
                    nrc.byte()
                );
                return Err(uds::Error::NegativeResponse(nrc).into());
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            self.events.publish(EventKind::MessageReceived {
                sequence: request.sequence,
                service_id: response.service_id,
                elapsed_ms,
                bytes: payload.clone(),
            });
            if self.config.structured_logging {
                debug!(
                    sequence = request.sequence,
                    elapsed_ms, "RX {}", hex::encode(&payload)
                );
            }
            self.record_ecu(protocol, source, request.service_id);
            return Ok(response);
        }
    }

    fn publish_exchange_error(
        &self,
        request: &DiagnosticMessage,
        err: &crate::Error,
        timeout: Duration,
    ) {
        match err {
            crate::Error::Adapter(crate::adapter::Error::Timeout)
            | crate::Error::Adapter(crate::adapter::Error::NoData)
            | crate::Error::IsoTp(isotp::Error::Timeout) => {
                self.events.publish(EventKind::TimeoutOccurred {
                    service_id: request.service_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            _ => {
                self.events.publish(EventKind::ErrorOccurred {
                    context: "exchange".into(),
                    error: err.to_string(),
                });
            }
        }
    }

    /// One transmission. Returns `None` when no response is expected,
    /// otherwise the reassembled response payload and its source address.
    async fn transmit_and_receive(
        &self,
        adapter: &mut Elm327,
        protocol: ProtocolType,
        bytes: &[u8],
        timeout: Duration,
        suppressed: bool,
    ) -> Result<Option<(Option<u32>, Vec<u8>)>, crate::Error> {
        if protocol.is_can() {
            self.transmit_can(adapter, protocol, bytes, timeout, suppressed)
                .await
        } else {
            self.transmit_kline(adapter, protocol, bytes, timeout, suppressed)
                .await
        }
    }

    async fn transmit_can(
        &self,
        adapter: &mut Elm327,
        protocol: ProtocolType,
        bytes: &[u8],
        timeout: Duration,
        suppressed: bool,
    ) -> Result<Option<(Option<u32>, Vec<u8>)>, crate::Error> {
        let cfg = self.config.isotp();
        let mut tx = Transmitter::new(bytes, &cfg)?;
        let first = tx.take_first()?;

        if suppressed && tx.is_complete() {
            adapter.send_frame(&first, KEEP_ALIVE_TIMEOUT).await?;
            return Ok(None);
        }

        let mut lines = adapter.exchange(&first, timeout).await?;

        // Flow-control-paced consecutive frames.
        while !tx.is_complete() {
            let line = match lines.is_empty() {
                false => lines.remove(0),
                true => {
                    let mut more = adapter
                        .continue_read(Duration::from_millis(DEFAULT_N_BS_MS))
                        .await
                        .map_err(|_| isotp::Error::FlowControl)?;
                    if more.is_empty() {
                        return Err(isotp::Error::FlowControl.into());
                    }
                    lines.append(&mut more);
                    lines.remove(0)
                }
            };

            let (_, frame_bytes) = self.split_header(protocol, &line);
            let frame = IsoTpFrame::parse(&frame_bytes)?;
            match tx.on_flow_control(&frame)? {
                TxAction::Wait => continue,
                TxAction::Send {
                    frames,
                    separation_time,
                } => {
                    for frame in frames {
                        let mut more = adapter.send_frame(&frame, FRAME_WRITE_TIMEOUT).await?;
                        lines.append(&mut more);
                        if !separation_time.is_zero() {
                            tokio::time::sleep(separation_time).await;
                        }
                    }
                }
            }
        }

        if suppressed {
            return Ok(None);
        }
        self.receive_can(adapter, protocol, timeout, lines)
            .await
            .map(Some)
    }

    /// Reassemble one ISO-TP response from already-received lines plus
    /// whatever else arrives before the deadline.
    async fn receive_can(
        &self,
        adapter: &mut Elm327,
        protocol: ProtocolType,
        timeout: Duration,
        mut lines: Vec<Vec<u8>>,
    ) -> Result<(Option<u32>, Vec<u8>), crate::Error> {
        let mut assembler = Assembler::new(self.config.isotp());
        let mut source = None;

        loop {
            while !lines.is_empty() {
                let line = lines.remove(0);
                let (line_source, frame_bytes) = self.split_header(protocol, &line);

                let frame = match IsoTpFrame::parse(&frame_bytes) {
                    Ok(frame) => frame,
                    // Noise between frames (other ids, status text already
                    // filtered) is skipped, not fatal.
                    Err(isotp::Error::UnknownFrameType) => continue,
                    Err(err) => return Err(err.into()),
                };
                if matches!(frame, IsoTpFrame::FlowControl { .. }) {
                    // Late flow control for a completed transmission.
                    continue;
                }

                match assembler.push(&frame)? {
                    AssemblerAction::Complete(message) => {
                        return Ok((line_source.or(source), message));
                    }
                    AssemblerAction::SendFlowControl(fc) => {
                        source = line_source.or(source);
                        let mut more = adapter.send_frame(&fc, FRAME_WRITE_TIMEOUT).await?;
                        lines.append(&mut more);
                    }
                    AssemblerAction::Pending => {
                        source = line_source.or(source);
                    }
                }
            }

            let wait = if assembler.is_receiving() {
                Duration::from_millis(DEFAULT_N_CR_MS)
            } else {
                timeout
            };
            match adapter.continue_read(wait).await {
                Ok(more) => lines = more,
                Err(
                    err @ crate::Error::Adapter(crate::adapter::Error::Timeout)
                    | err @ crate::Error::Adapter(crate::adapter::Error::NoData),
                ) => {
                    if assembler.is_receiving() {
                        return Err(isotp::Error::Timeout.into());
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transmit_kline(
        &self,
        adapter: &mut Elm327,
        protocol: ProtocolType,
        bytes: &[u8],
        timeout: Duration,
        suppressed: bool,
    ) -> Result<Option<(Option<u32>, Vec<u8>)>, crate::Error> {
        if suppressed {
            adapter.send_frame(bytes, KEEP_ALIVE_TIMEOUT).await?;
            return Ok(None);
        }

        let lines = adapter.exchange(bytes, timeout).await?;
        let line = lines
            .into_iter()
            .next()
            .ok_or(crate::adapter::Error::NoData)?;
        self.parse_kline(protocol, line).map(Some)
    }

    fn parse_kline(
        &self,
        protocol: ProtocolType,
        line: Vec<u8>,
    ) -> Result<(Option<u32>, Vec<u8>), crate::Error> {
        if !self.config.headers {
            return Ok((None, line));
        }

        // With headers the adapter passes the checksum through; a bad sum
        // is a protocol violation, not a retryable fault.
        let checksum = protocol.checksum_kind();
        if !checksum.verify(&line) {
            return Err(Error::ProtocolViolation("checksum mismatch".into()).into());
        }
        let body = checksum.strip(&line);
        if body.len() < 4 {
            return Err(Error::ProtocolViolation("truncated framed message".into()).into());
        }
        // [format, target, source, payload...]
        Ok((Some(body[2] as u32), body[3..].to_vec()))
    }

    /// Re-read after a response-pending: nothing to transmit, just await
    /// the final answer.
    async fn receive_pdu(
        &self,
        adapter: &mut Elm327,
        protocol: ProtocolType,
        timeout: Duration,
        lines: Vec<Vec<u8>>,
    ) -> Result<(Option<u32>, Vec<u8>), crate::Error> {
        if protocol.is_can() {
            self.receive_can(adapter, protocol, timeout, lines).await
        } else {
            let lines = adapter.continue_read(timeout).await?;
            let line = lines
                .into_iter()
                .next()
                .ok_or(crate::adapter::Error::NoData)?;
            self.parse_kline(protocol, line)
        }
    }

    fn split_header(&self, protocol: ProtocolType, line: &[u8]) -> (Option<u32>, Vec<u8>) {
        if !self.config.headers {
            return (None, line.to_vec());
        }
        match protocol.bit_width() {
            Some(11) if line.len() > 2 => (
                Some(((line[0] as u32) << 8 | line[1] as u32) & 0x7ff),
                line[2..].to_vec(),
            ),
            Some(29) if line.len() > 4 => (
                Some(u32::from_be_bytes([line[0], line[1], line[2], line[3]]) & 0x1fff_ffff),
                line[4..].to_vec(),
            ),
            _ => (None, line.to_vec()),
        }
    }

    fn record_ecu(&self, protocol: ProtocolType, source: Option<u32>, service_id: u8) {
        let address = source.unwrap_or_else(|| protocol.default_addresses().1);
        let now_ms = self.events.now_ms();

        let discovered = {
            let mut ecus = self.ecus.lock().unwrap();
            let known = ecus.contains_key(&address);
            ecus.entry(address)
                .or_insert_with(|| Ecu::new(address))
                .record_service(service_id, now_ms);
            !known
        };
        if discovered {
            debug!("discovered ECU {:#x}", address);
            self.events.publish(EventKind::EcuDiscovered { address });
        }
    }

    /// One Tester Present tick: `3E 80`, suppressed positive response.
    /// Shares the adapter lock with user exchanges, so keep-alives never
    /// interleave inside another request/response pair.
    async fn keep_alive_tick(&self) -> Result<(), crate::Error> {
        let protocol = self.current_protocol()?;
        let bytes = [
            ServiceIdentifier::TesterPresent as u8,
            uds::SUPPRESS_POSITIVE_RESPONSE,
        ];

        let mut adapter = self.adapter.lock().await;
        let mut last_err: Option<crate::Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let result = if protocol.is_can() {
                let mut tx = Transmitter::new(&bytes, &self.config.isotp())?;
                let first = tx.take_first()?;
                adapter.send_frame(&first, KEEP_ALIVE_TIMEOUT).await
            } else {
                adapter.send_frame(&bytes, KEEP_ALIVE_TIMEOUT).await
            };

            match result {
                Ok(_) => return Ok(()),
                Err(err) if is_recoverable(&err) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| crate::adapter::Error::Timeout.into()))
    }
}

fn is_recoverable(err: &crate::Error) -> bool {
    match err {
        crate::Error::Adapter(err) => err.is_recoverable(),
        crate::Error::Transport(crate::transport::Error::Io(_)) => true,
        crate::Error::Transport(crate::transport::Error::Disconnected) => false,
        _ => false,
    }
}
