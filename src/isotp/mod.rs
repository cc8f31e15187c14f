//! ISO Transport Protocol (ISO-TP) implementation, implements ISO 15765-2.
//!
//! The module is a pure codec: [`IsoTpFrame`] parses and encodes single CAN
//! frames, [`Transmitter`] segments an outgoing message honoring the peer's
//! flow control, and [`Assembler`] reconstructs an incoming message of up to
//! 4095 bytes. The session engine owns the timing side (N_Bs / N_Cr
//! deadlines, STmin pacing) so the state machines here stay synchronous and
//! testable.
//! ## Example:
//! ```
//! use diaglink::isotp::{Assembler, IsoTpConfig, IsoTpFrame, Transmitter};
//!
//! let cfg = IsoTpConfig::default();
//! let mut tx = Transmitter::new(&[0x3e, 0x00], &cfg).unwrap();
//! let frame = tx.take_first().unwrap();
//! assert_eq!(&frame[..2], &[0x02, 0x3e]);
//! assert!(tx.is_complete());
//! ```

pub mod constants;
pub mod error;
pub mod types;

pub use error::Error;
pub use types::{encode_separation_time, FlowControlConfig, FlowStatus};

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::isotp::constants::{FrameType, CAN_DL, FRAME_TYPE_MASK, MAX_MESSAGE_LEN};

/// Configuration for the frames this side emits.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct IsoTpConfig {
    /// Transmit data length, 8 for classic CAN.
    pub tx_dl: usize,
    /// Padding byte for short frames, `None` disables padding.
    pub padding: Option<u8>,
    /// Block size advertised in flow control frames we send.
    pub block_size: u8,
    /// STmin advertised in flow control frames we send.
    pub separation_time_min: Duration,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            tx_dl: CAN_DL,
            padding: Some(0xaa),
            block_size: 0,
            separation_time_min: Duration::ZERO,
        }
    }
}

/// A single decoded ISO-TP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IsoTpFrame {
    Single {
        data: Vec<u8>,
    },
    First {
        /// Declared total message length, 8-4095.
        length: usize,
        data: Vec<u8>,
    },
    Consecutive {
        /// Sequence number, 1-15 then wrapping to 0.
        sn: u8,
        data: Vec<u8>,
    },
    FlowControl {
        status: FlowStatus,
        config: FlowControlConfig,
    },
}

impl IsoTpFrame {
    /// Decode a raw CAN payload into a frame. Padding bytes beyond the
    /// PCI-declared data are preserved by the caller where relevant.
    pub fn parse(raw: &[u8]) -> Result<IsoTpFrame, Error> {
        let pci = *raw.first().ok_or(Error::MalformedFrame)?;

        match (pci & FRAME_TYPE_MASK).into() {
            FrameType::Single => {
                let len = (pci & 0x0f) as usize;
                if len == 0 || len > 7 || raw.len() < len + 1 {
                    // CAN-FD escape sequence not supported
                    return Err(Error::MalformedFrame);
                }
                Ok(IsoTpFrame::Single {
                    data: raw[1..len + 1].to_vec(),
                })
            }
            FrameType::First => {
                if raw.len() < 2 {
                    return Err(Error::MalformedFrame);
                }
                let length = ((pci as usize) << 8 | raw[1] as usize) & 0xfff;
                if length < 8 {
                    return Err(Error::MalformedFrame);
                }
                Ok(IsoTpFrame::First {
                    length,
                    data: raw[2..].to_vec(),
                })
            }
            FrameType::Consecutive => Ok(IsoTpFrame::Consecutive {
                sn: pci & 0x0f,
                data: raw[1..].to_vec(),
            }),
            FrameType::FlowControl => {
                let status = match pci & 0x0f {
                    0x0 => FlowStatus::ContinueToSend,
                    0x1 => FlowStatus::Wait,
                    0x2 => FlowStatus::Overflow,
                    _ => return Err(Error::MalformedFrame),
                };
                // Wait and overflow frames may omit the BS/STmin bytes.
                let config = FlowControlConfig::try_from(raw).unwrap_or_default();
                Ok(IsoTpFrame::FlowControl { status, config })
            }
            FrameType::Unknown => Err(Error::UnknownFrameType),
        }
    }

    /// Encode this frame into a raw CAN payload, padded per config.
    pub fn encode(&self, cfg: &IsoTpConfig) -> Vec<u8> {
        let mut buf = match self {
            IsoTpFrame::Single { data } => {
                let mut buf = vec![FrameType::Single as u8 | data.len() as u8];
                buf.extend(data);
                buf
            }
            IsoTpFrame::First { length, data } => {
                let b0 = FrameType::First as u8 | ((length >> 8) & 0x0f) as u8;
                let b1 = (length & 0xff) as u8;
                let mut buf = vec![b0, b1];
                buf.extend(data);
                buf
            }
            IsoTpFrame::Consecutive { sn, data } => {
                let mut buf = vec![FrameType::Consecutive as u8 | (sn & 0x0f)];
                buf.extend(data);
                buf
            }
            IsoTpFrame::FlowControl { status, config } => {
                vec![
                    FrameType::FlowControl as u8 | *status as u8,
                    config.block_size,
                    encode_separation_time(config.separation_time_min),
                ]
            }
        };

        if let Some(padding) = cfg.padding {
            while buf.len() < cfg.tx_dl {
                buf.push(padding);
            }
        }
        buf
    }
}

/// Segment a payload into the complete frame train, assuming the peer will
/// answer flow control with ContinueToSend and block size 0. For
/// flow-control-aware sending use [`Transmitter`].
pub fn segment(payload: &[u8], cfg: &IsoTpConfig) -> Result<Vec<Vec<u8>>, Error> {
    let mut tx = Transmitter::new(payload, cfg)?;
    let mut frames = vec![tx.take_first()?];
    frames.extend(tx.next_block(0));
    Ok(frames)
}

/// Action the sender must take after receiving a flow control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TxAction {
    /// Send these frames, separated by at least `separation_time`.
    Send {
        frames: Vec<Vec<u8>>,
        separation_time: Duration,
    },
    /// Peer asked to wait; restart the N_Bs timer and await another FC.
    Wait,
}

/// Sender side of one segmented message. Exactly one transmitter may be
/// outstanding per address pair.
#[derive(Debug)]
pub struct Transmitter {
    frames: VecDeque<Vec<u8>>,
    first_taken: bool,
    single: bool,
}

impl Transmitter {
    pub fn new(payload: &[u8], cfg: &IsoTpConfig) -> Result<Self, Error> {
        if payload.is_empty() || cfg.tx_dl < 2 {
            return Err(Error::MalformedFrame);
        }
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(Error::DataTooLarge);
        }

        let mut frames = VecDeque::new();
        let single = payload.len() <= cfg.tx_dl - 1;

        if single {
            frames.push_back(
                IsoTpFrame::Single {
                    data: payload.to_vec(),
                }
                .encode(cfg),
            );
        } else {
            frames.push_back(
                IsoTpFrame::First {
                    length: payload.len(),
                    data: payload[..cfg.tx_dl - 2].to_vec(),
                }
                .encode(cfg),
            );
            let chunks = payload[cfg.tx_dl - 2..].chunks(cfg.tx_dl - 1);
            for (idx, chunk) in chunks.enumerate() {
                let sn = ((idx + 1) & 0x0f) as u8;
                frames.push_back(
                    IsoTpFrame::Consecutive {
                        sn,
                        data: chunk.to_vec(),
                    }
                    .encode(cfg),
                );
            }
        }

        debug!("TX plan: {} frame(s)", frames.len());
        Ok(Self {
            frames,
            first_taken: false,
            single,
        })
    }

    /// The single frame or first frame, to be sent before any flow control
    /// arrives.
    pub fn take_first(&mut self) -> Result<Vec<u8>, Error> {
        if self.first_taken {
            return Err(Error::FlowControl);
        }
        self.first_taken = true;
        self.frames.pop_front().ok_or(Error::MalformedFrame)
    }

    /// React to the peer's flow control frame.
    pub fn on_flow_control(&mut self, frame: &IsoTpFrame) -> Result<TxAction, Error> {
        if !self.first_taken || self.single {
            return Err(Error::FlowControl);
        }

        let IsoTpFrame::FlowControl { status, config } = frame else {
            return Err(Error::FlowControl);
        };

        match status {
            FlowStatus::Overflow => Err(Error::Overflow),
            FlowStatus::Wait => Ok(TxAction::Wait),
            FlowStatus::ContinueToSend => {
                debug!(
                    "RX FC, bs {} stmin {:?}",
                    config.block_size, config.separation_time_min
                );
                Ok(TxAction::Send {
                    frames: self.next_block(config.block_size),
                    separation_time: config.separation_time_min,
                })
            }
        }
    }

    /// Drain up to `block_size` consecutive frames (0 drains all).
    pub fn next_block(&mut self, block_size: u8) -> Vec<Vec<u8>> {
        let count = if block_size == 0 {
            self.frames.len()
        } else {
            (block_size as usize).min(self.frames.len())
        };
        self.frames.drain(..count).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.first_taken && self.frames.is_empty()
    }
}

/// What the receiver owes the bus after pushing one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerAction {
    /// Mid-message, nothing to send.
    Pending,
    /// First frame accepted: send this flow control frame.
    SendFlowControl(Vec<u8>),
    /// Message complete.
    Complete(Vec<u8>),
}

enum AssemblyState {
    Idle,
    Receiving {
        expected: usize,
        buf: Vec<u8>,
        next_sn: u8,
    },
}

/// Receiver side state machine for one address pair. Exactly one message is
/// reassembled at a time; a new first frame while receiving discards the
/// in-flight message.
pub struct Assembler {
    cfg: IsoTpConfig,
    state: AssemblyState,
}

impl Assembler {
    pub fn new(cfg: IsoTpConfig) -> Self {
        Self {
            cfg,
            state: AssemblyState::Idle,
        }
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, AssemblyState::Receiving { .. })
    }

    /// Abort the in-flight message, e.g. on an N_Cr timeout.
    pub fn reset(&mut self) {
        self.state = AssemblyState::Idle;
    }

    /// Parse and push one raw CAN payload.
    pub fn push_bytes(&mut self, raw: &[u8]) -> Result<AssemblerAction, Error> {
        self.push(&IsoTpFrame::parse(raw)?)
    }

    pub fn push(&mut self, frame: &IsoTpFrame) -> Result<AssemblerAction, Error> {
        match frame {
            IsoTpFrame::Single { data } => {
                self.state = AssemblyState::Idle;
                debug!("RX SF, length {}", data.len());
                Ok(AssemblerAction::Complete(data.clone()))
            }
            IsoTpFrame::First { length, data } => {
                debug!("RX FF, length {}", length);
                let mut buf = Vec::with_capacity(*length);
                buf.extend(&data[..data.len().min(*length)]);
                self.state = AssemblyState::Receiving {
                    expected: *length,
                    buf,
                    next_sn: 1,
                };

                let fc = IsoTpFrame::FlowControl {
                    status: FlowStatus::ContinueToSend,
                    config: FlowControlConfig {
                        block_size: self.cfg.block_size,
                        separation_time_min: self.cfg.separation_time_min,
                    },
                }
                .encode(&self.cfg);
                Ok(AssemblerAction::SendFlowControl(fc))
            }
            IsoTpFrame::Consecutive { sn, data } => {
                let AssemblyState::Receiving {
                    expected,
                    buf,
                    next_sn,
                } = &mut self.state
                else {
                    return Err(Error::OutOfOrder);
                };

                if sn != next_sn {
                    debug!("RX CF out of order: expected {} got {}", next_sn, sn);
                    self.state = AssemblyState::Idle;
                    return Err(Error::OutOfOrder);
                }

                let remaining = *expected - buf.len();
                let take = remaining.min(data.len());
                buf.extend(&data[..take]);
                *next_sn = (*next_sn + 1) & 0x0f;

                if buf.len() == *expected {
                    let message = std::mem::take(buf);
                    self.state = AssemblyState::Idle;
                    debug!("RX complete, length {}", message.len());
                    Ok(AssemblerAction::Complete(message))
                } else {
                    Ok(AssemblerAction::Pending)
                }
            }
            IsoTpFrame::FlowControl { .. } => {
                // FC belongs to the transmit side; receiving one here means
                // the peer lost sync.
                Err(Error::FlowControl)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(len: usize) {
        let cfg = IsoTpConfig::default();
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let frames = segment(&payload, &cfg).unwrap();
        let mut assembler = Assembler::new(cfg);

        let mut result = None;
        for frame in &frames {
            match assembler.push_bytes(frame).unwrap() {
                AssemblerAction::Complete(message) => result = Some(message),
                AssemblerAction::SendFlowControl(fc) => {
                    assert_eq!(fc[0], 0x30);
                }
                AssemblerAction::Pending => {}
            }
        }
        assert_eq!(result.expect("message must complete"), payload);
    }

    #[test]
    fn roundtrip_all_shapes() {
        for len in [1, 6, 7, 8, 62, 63, 64, 256, 4095] {
            roundtrip(len);
        }
    }

    #[test]
    fn oversize_payload_rejected() {
        let cfg = IsoTpConfig::default();
        assert_eq!(
            Transmitter::new(&[0u8; 4096], &cfg).unwrap_err(),
            Error::DataTooLarge
        );
    }

    #[test]
    fn single_frame_encoding() {
        let cfg = IsoTpConfig::default();
        let mut tx = Transmitter::new(&[0x01, 0x0c], &cfg).unwrap();
        let frame = tx.take_first().unwrap();
        assert_eq!(frame, vec![0x02, 0x01, 0x0c, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
        assert!(tx.is_complete());
    }

    #[test]
    fn no_padding_when_disabled() {
        let cfg = IsoTpConfig {
            padding: None,
            ..IsoTpConfig::default()
        };
        let mut tx = Transmitter::new(&[0x3e, 0x00], &cfg).unwrap();
        assert_eq!(tx.take_first().unwrap(), vec![0x02, 0x3e, 0x00]);
    }

    #[test]
    fn first_frame_carries_length() {
        let cfg = IsoTpConfig::default();
        let payload = vec![0x55; 20];
        let mut tx = Transmitter::new(&payload, &cfg).unwrap();
        let ff = tx.take_first().unwrap();
        assert_eq!(ff[0], 0x10);
        assert_eq!(ff[1], 20);

        let fc = IsoTpFrame::parse(&[0x30, 0x00, 0x00]).unwrap();
        let TxAction::Send { frames, .. } = tx.on_flow_control(&fc).unwrap() else {
            panic!("expected send action");
        };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 0x21);
        assert_eq!(frames[1][0], 0x22);
        assert!(tx.is_complete());
    }

    #[test]
    fn sequence_numbers_wrap() {
        let cfg = IsoTpConfig::default();
        // 6 + 16 * 7 = 118 bytes: SN runs 1..=15, 0, 1
        let payload = vec![0x11; 118];
        let frames = segment(&payload, &cfg).unwrap();
        assert_eq!(frames[15][0] & 0x0f, 15);
        assert_eq!(frames[16][0] & 0x0f, 0);
        roundtrip(118);
    }

    #[test]
    fn out_of_order_cf_discards_message() {
        let cfg = IsoTpConfig::default();
        let payload = vec![0x22; 30];
        let frames = segment(&payload, &cfg).unwrap();

        let mut assembler = Assembler::new(cfg);
        assembler.push_bytes(&frames[0]).unwrap();
        assembler.push_bytes(&frames[1]).unwrap();
        // Skip frame 2, deliver frame 3
        assert_eq!(
            assembler.push_bytes(&frames[3]).unwrap_err(),
            Error::OutOfOrder
        );
        assert!(!assembler.is_receiving());
    }

    #[test]
    fn block_size_pacing() {
        let cfg = IsoTpConfig::default();
        let payload = vec![0x33; 64];
        let mut tx = Transmitter::new(&payload, &cfg).unwrap();
        tx.take_first().unwrap();

        // 64 bytes: FF carries 6, then 9 consecutive frames
        let fc = IsoTpFrame::parse(&[0x30, 0x04, 0x00]).unwrap();
        let TxAction::Send { frames, .. } = tx.on_flow_control(&fc).unwrap() else {
            panic!("expected send action");
        };
        assert_eq!(frames.len(), 4);
        assert!(!tx.is_complete());

        let TxAction::Send { frames, .. } = tx.on_flow_control(&fc).unwrap() else {
            panic!("expected send action");
        };
        assert_eq!(frames.len(), 4);
        assert!(!tx.is_complete());

        let TxAction::Send { frames, .. } = tx.on_flow_control(&fc).unwrap() else {
            panic!("expected send action");
        };
        assert_eq!(frames.len(), 1);
        assert!(tx.is_complete());
    }

    #[test]
    fn wait_and_overflow_flow_status() {
        let cfg = IsoTpConfig::default();
        let mut tx = Transmitter::new(&vec![0x44; 32], &cfg).unwrap();
        tx.take_first().unwrap();

        let wait = IsoTpFrame::parse(&[0x31, 0x00, 0x00]).unwrap();
        assert_eq!(tx.on_flow_control(&wait).unwrap(), TxAction::Wait);

        let overflow = IsoTpFrame::parse(&[0x32, 0x00, 0x00]).unwrap();
        assert_eq!(tx.on_flow_control(&overflow).unwrap_err(), Error::Overflow);
    }

    #[test]
    fn reassembled_length_is_exact() {
        // Declared length 10, but the last CF carries padding: the padding
        // must not leak into the message.
        let cfg = IsoTpConfig::default();
        let mut assembler = Assembler::new(cfg);
        assembler
            .push_bytes(&[0x10, 0x0a, 1, 2, 3, 4, 5, 6])
            .unwrap();
        let action = assembler
            .push_bytes(&[0x21, 7, 8, 9, 10, 0xaa, 0xaa, 0xaa])
            .unwrap();
        assert_eq!(
            action,
            AssemblerAction::Complete(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])
        );
    }

    #[test]
    fn malformed_frames_rejected() {
        assert_eq!(IsoTpFrame::parse(&[]).unwrap_err(), Error::MalformedFrame);
        // Zero-length SF (CAN-FD escape)
        assert_eq!(
            IsoTpFrame::parse(&[0x00, 1, 2, 3]).unwrap_err(),
            Error::MalformedFrame
        );
        // FF declaring less than 8 bytes
        assert_eq!(
            IsoTpFrame::parse(&[0x10, 0x05, 1, 2, 3, 4, 5, 6]).unwrap_err(),
            Error::MalformedFrame
        );
        assert_eq!(
            IsoTpFrame::parse(&[0x40, 0x00]).unwrap_err(),
            Error::UnknownFrameType
        );
    }
}
