//! Protocol state machine types.

use std::fmt;

use crate::uds::SessionKind;

/// Lifecycle of one session engine.
///
/// `Uninitialized -> Ready <-> SessionActive -> Ready -> Shutdown`; `Error`
/// may be entered from any non-terminal state and is left only via `reset`
/// or `shutdown`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolState {
    Uninitialized,
    Ready,
    SessionActive(SessionKind),
    Error(SessionFault),
    Shutdown,
}

impl ProtocolState {
    /// Exchanges are accepted in Ready and SessionActive only.
    pub fn can_send(&self) -> bool {
        matches!(self, ProtocolState::Ready | ProtocolState::SessionActive(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolState::Shutdown)
    }

    pub fn active_session(&self) -> Option<SessionKind> {
        match self {
            ProtocolState::SessionActive(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Uninitialized => write!(f, "Uninitialized"),
            ProtocolState::Ready => write!(f, "Ready"),
            ProtocolState::SessionActive(kind) => write!(f, "SessionActive({})", kind.name()),
            ProtocolState::Error(fault) => write!(f, "Error({fault})"),
            ProtocolState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Why the engine entered the Error state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionFault {
    /// Keep-alive lost the ECU.
    SessionLost,
    /// The transport reported a permanent failure.
    Transport,
    /// Unrecoverable protocol violation.
    Protocol,
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFault::SessionLost => write!(f, "SessionLost"),
            SessionFault::Transport => write!(f, "Transport"),
            SessionFault::Protocol => write!(f, "Protocol"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_gating() {
        assert!(!ProtocolState::Uninitialized.can_send());
        assert!(ProtocolState::Ready.can_send());
        assert!(ProtocolState::SessionActive(SessionKind::Extended).can_send());
        assert!(!ProtocolState::Error(SessionFault::SessionLost).can_send());
        assert!(!ProtocolState::Shutdown.can_send());
    }
}
