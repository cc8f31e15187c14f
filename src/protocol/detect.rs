//! Protocol auto-detection.
//!
//! Tries candidate protocols in a prioritized order. Each attempt applies
//! the candidate's adapter profile, sends the canonical probe and
//! classifies the response. The first validated positive response wins.
//! ## Example
//! ```
//! # async fn detect_example(adapter: &mut diaglink::adapter::Elm327) {
//! use diaglink::protocol::{DetectorConfig, ProtocolDetector, VehicleHints};
//!
//! let mut detector = ProtocolDetector::new(adapter, DetectorConfig::default(), VehicleHints::default());
//! let detection = detector.detect().await.unwrap();
//! println!("vehicle speaks {}", detection.protocol);
//! # }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use futures_core::stream::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::Elm327;
use crate::protocol::ProtocolType;

const PROGRESS_BUFFER: usize = 64;

/// Detector tuning. Defaults follow the common ELM327 timing envelope.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Per-probe response deadline; doubled for 5-baud init protocols.
    pub test_timeout: Duration,
    /// Deadline for the whole run.
    pub total_timeout: Duration,
    /// Probe attempts per candidate.
    pub retries_per_protocol: u32,
    /// Pause between probe attempts.
    pub retry_delay: Duration,
    /// Protocol to try first, when not skipped.
    pub preferred: Option<ProtocolType>,
    /// Candidates excluded from the run.
    pub skip: HashSet<ProtocolType>,
    /// Append J1939 to the candidate list (heavy-duty vehicles).
    pub include_j1939: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_millis(3000),
            total_timeout: Duration::from_millis(30000),
            retries_per_protocol: 2,
            retry_delay: Duration::from_millis(200),
            preferred: None,
            skip: HashSet::new(),
            include_j1939: false,
        }
    }
}

/// Vehicle knowledge that refines the candidate order.
#[derive(Debug, Clone, Default)]
pub struct VehicleHints {
    pub model_year: Option<u16>,
    pub make: Option<MakeHint>,
}

/// Make families with known bus preferences.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MakeHint {
    GeneralMotors,
    Ford,
    European,
    Asian,
    HeavyDuty,
}

/// Cooperative cancellation flag, observed between candidates and between
/// retries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DetectError {
    #[error("No Protocol Detected")]
    NoProtocolFound,
    #[error("Detection Timeout")]
    Timeout,
    #[error("Detection Cancelled")]
    Cancelled,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub protocol: ProtocolType,
    pub elapsed_ms: u64,
    /// Candidates probed, detection order, the winner last.
    pub tested: Vec<ProtocolType>,
}

/// Progress events emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionProgress {
    Started {
        total: usize,
    },
    Testing {
        protocol: ProtocolType,
        index: usize,
        total: usize,
        fraction: f32,
    },
    TestedProtocol {
        protocol: ProtocolType,
        success: bool,
        elapsed_ms: u64,
    },
    Detected {
        protocol: ProtocolType,
        elapsed_ms: u64,
    },
    Failed {
        error: DetectError,
        tested: Vec<ProtocolType>,
    },
    Cancelled {
        tested: Vec<ProtocolType>,
    },
}

/// Read-only projection of the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorState {
    Idle,
    Detecting {
        current: ProtocolType,
        fraction: f32,
    },
    Detected(ProtocolType),
    Failed(DetectError),
    Cancelled,
}

/// Compute the candidate order for a config + hint pair.
pub fn candidate_order(config: &DetectorConfig, hints: &VehicleHints) -> Vec<ProtocolType> {
    use ProtocolType::*;

    let mut order = vec![
        Iso15765_4Can11Bit500K,
        Iso15765_4Can29Bit500K,
        Iso15765_4Can11Bit250K,
        Iso15765_4Can29Bit250K,
        Iso14230_4KwpFast,
        Iso9141_2,
        SaeJ1850Vpw,
        SaeJ1850Pwm,
    ];

    // 2008+ vehicles are CAN by mandate.
    if hints.model_year.is_some_and(|year| year >= 2008) {
        order.retain(|p| p.is_can());
    }

    let move_before = |order: &mut Vec<ProtocolType>, what: ProtocolType, before: ProtocolType| {
        if let (Some(from), Some(_)) = (
            order.iter().position(|p| *p == what),
            order.iter().position(|p| *p == before),
        ) {
            order.remove(from);
            let to = order.iter().position(|p| *p == before).unwrap();
            order.insert(to, what);
        }
    };

    match hints.make {
        Some(MakeHint::GeneralMotors) => move_before(&mut order, SaeJ1850Vpw, Iso14230_4KwpFast),
        Some(MakeHint::Ford) => move_before(&mut order, SaeJ1850Pwm, Iso14230_4KwpFast),
        // KWP fast already precedes J1850 in the default order.
        Some(MakeHint::European) => move_before(&mut order, Iso14230_4KwpFast, Iso9141_2),
        Some(MakeHint::Asian) => move_before(&mut order, Iso9141_2, Iso14230_4KwpFast),
        Some(MakeHint::HeavyDuty) => {
            move_before(&mut order, Iso15765_4Can29Bit500K, Iso15765_4Can11Bit500K);
            move_before(&mut order, Iso15765_4Can29Bit250K, Iso15765_4Can11Bit250K);
        }
        None => {}
    }

    if config.include_j1939 && !order.contains(&SaeJ1939) {
        order.push(SaeJ1939);
    }

    if let Some(preferred) = config.preferred {
        if !config.skip.contains(&preferred) {
            order.retain(|p| *p != preferred);
            order.insert(0, preferred);
        }
    }

    order.retain(|p| !config.skip.contains(p));
    order
}

/// Probes an adapter for the vehicle's protocol. One suspended probe at a
/// time; the cancel token is observed between candidates and retries.
pub struct ProtocolDetector<'a> {
    adapter: &'a mut Elm327,
    config: DetectorConfig,
    hints: VehicleHints,
    cancel: CancelToken,
    state: Arc<Mutex<DetectorState>>,
    progress: broadcast::Sender<DetectionProgress>,
}

impl<'a> ProtocolDetector<'a> {
    pub fn new(adapter: &'a mut Elm327, config: DetectorConfig, hints: VehicleHints) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_BUFFER);
        Self {
            adapter,
            config,
            hints,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(DetectorState::Idle)),
            progress,
        }
    }

    /// Token to cancel this run from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current state projection.
    pub fn state(&self) -> DetectorState {
        self.state.lock().unwrap().clone()
    }

    /// Live progress events. Subscribe before calling [`detect`].
    ///
    /// [`detect`]: ProtocolDetector::detect
    pub fn progress(&self) -> impl Stream<Item = DetectionProgress> {
        let mut rx = self.progress.subscribe();
        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn emit(&self, event: DetectionProgress) {
        // No subscribers is fine.
        let _ = self.progress.send(event);
    }

    fn set_state(&self, state: DetectorState) {
        *self.state.lock().unwrap() = state;
    }

    /// Run detection to completion.
    pub async fn detect(&mut self) -> Result<Detection, crate::Error> {
        let candidates = candidate_order(&self.config, &self.hints);
        let total = candidates.len();
        let started = Instant::now();
        let mut tested = Vec::new();

        info!("protocol detection started, {} candidate(s)", total);
        self.emit(DetectionProgress::Started { total });

        for (index, protocol) in candidates.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(tested);
            }
            if started.elapsed() > self.config.total_timeout {
                return self.finish_failed(DetectError::Timeout, tested);
            }

            let fraction = index as f32 / total as f32;
            self.set_state(DetectorState::Detecting {
                current: protocol,
                fraction,
            });
            self.emit(DetectionProgress::Testing {
                protocol,
                index,
                total,
                fraction,
            });

            let candidate_started = Instant::now();
            let success = self.try_candidate(protocol).await;
            let elapsed_ms = candidate_started.elapsed().as_millis() as u64;
            tested.push(protocol);

            self.emit(DetectionProgress::TestedProtocol {
                protocol,
                success,
                elapsed_ms,
            });

            if success {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!("detected {} in {} ms", protocol, elapsed_ms);
                self.set_state(DetectorState::Detected(protocol));
                self.emit(DetectionProgress::Detected {
                    protocol,
                    elapsed_ms,
                });
                return Ok(Detection {
                    protocol,
                    elapsed_ms,
                    tested,
                });
            }
        }

        if self.cancel.is_cancelled() {
            self.finish_cancelled(tested)
        } else {
            self.finish_failed(DetectError::NoProtocolFound, tested)
        }
    }

    async fn try_candidate(&mut self, protocol: ProtocolType) -> bool {
        let profile = protocol.detection_profile(self.config.test_timeout);
        if let Err(err) = self.adapter.apply_profile(&profile).await {
            warn!("profile for {} rejected: {}", protocol, err);
            return false;
        }

        let mut timeout = self.config.test_timeout;
        if protocol.requires_5baud_init() {
            timeout *= 2;
        }

        for attempt in 0..self.config.retries_per_protocol.max(1) {
            if self.cancel.is_cancelled() {
                return false;
            }
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            match self.adapter.exchange(protocol.probe_request(), timeout).await {
                Ok(lines) => {
                    if protocol.validate_probe(&lines) {
                        return true;
                    }
                    debug!("{}: probe response not valid", protocol);
                }
                Err(err) => {
                    debug!("{}: probe failed: {}", protocol, err);
                }
            }
        }
        false
    }

    fn finish_cancelled(&self, tested: Vec<ProtocolType>) -> Result<Detection, crate::Error> {
        warn!("protocol detection cancelled after {} candidate(s)", tested.len());
        self.set_state(DetectorState::Cancelled);
        self.emit(DetectionProgress::Cancelled { tested });
        Err(DetectError::Cancelled.into())
    }

    fn finish_failed(
        &self,
        error: DetectError,
        tested: Vec<ProtocolType>,
    ) -> Result<Detection, crate::Error> {
        warn!("protocol detection failed: {}", error);
        self.set_state(DetectorState::Failed(error.clone()));
        self.emit(DetectionProgress::Failed {
            error: error.clone(),
            tested,
        });
        Err(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProtocolType::*;

    #[test]
    fn default_order() {
        let order = candidate_order(&DetectorConfig::default(), &VehicleHints::default());
        assert_eq!(
            order,
            vec![
                Iso15765_4Can11Bit500K,
                Iso15765_4Can29Bit500K,
                Iso15765_4Can11Bit250K,
                Iso15765_4Can29Bit250K,
                Iso14230_4KwpFast,
                Iso9141_2,
                SaeJ1850Vpw,
                SaeJ1850Pwm,
            ]
        );
    }

    #[test]
    fn modern_vehicles_probe_can_only() {
        let hints = VehicleHints {
            model_year: Some(2019),
            make: None,
        };
        let order = candidate_order(&DetectorConfig::default(), &hints);
        assert!(order.iter().all(|p| p.is_can()));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn gm_prefers_vpw_over_other_legacy_buses() {
        let hints = VehicleHints {
            model_year: None,
            make: Some(MakeHint::GeneralMotors),
        };
        let order = candidate_order(&DetectorConfig::default(), &hints);
        let vpw = order.iter().position(|p| *p == SaeJ1850Vpw).unwrap();
        let kwp = order.iter().position(|p| *p == Iso14230_4KwpFast).unwrap();
        assert!(vpw < kwp);
    }

    #[test]
    fn asian_prefers_iso9141_over_kwp() {
        let hints = VehicleHints {
            model_year: None,
            make: Some(MakeHint::Asian),
        };
        let order = candidate_order(&DetectorConfig::default(), &hints);
        let iso = order.iter().position(|p| *p == Iso9141_2).unwrap();
        let kwp = order.iter().position(|p| *p == Iso14230_4KwpFast).unwrap();
        assert!(iso < kwp);
    }

    #[test]
    fn heavy_duty_prefers_29bit() {
        let hints = VehicleHints {
            model_year: None,
            make: Some(MakeHint::HeavyDuty),
        };
        let order = candidate_order(&DetectorConfig::default(), &hints);
        assert_eq!(order[0], Iso15765_4Can29Bit500K);
    }

    #[test]
    fn preferred_is_prepended_unless_skipped() {
        let mut config = DetectorConfig {
            preferred: Some(Iso9141_2),
            ..DetectorConfig::default()
        };
        let order = candidate_order(&config, &VehicleHints::default());
        assert_eq!(order[0], Iso9141_2);
        assert_eq!(order.iter().filter(|p| **p == Iso9141_2).count(), 1);

        config.skip.insert(Iso9141_2);
        let order = candidate_order(&config, &VehicleHints::default());
        assert!(!order.contains(&Iso9141_2));
    }

    #[test]
    fn j1939_is_opt_in() {
        let order = candidate_order(&DetectorConfig::default(), &VehicleHints::default());
        assert!(!order.contains(&SaeJ1939));

        let config = DetectorConfig {
            include_j1939: true,
            ..DetectorConfig::default()
        };
        let order = candidate_order(&config, &VehicleHints::default());
        assert_eq!(*order.last().unwrap(), SaeJ1939);
    }
}
