//! Per-board bootloader session
//!
//! A [`BoardSession`] is a sans-IO state machine: it hands out the next
//! message to transmit and is told when that message left, which reply
//! arrived and what time it is. The orchestrator owns the bus and the clock.

mod board;

pub use board::{BoardSession, SessionStats};

use std::fmt;

use serde::Serialize;

/// Protocol state of one board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Handshaking,
    Erasing,
    Transferring,
    Verifying,
    Rebooting,
    Done,
    Failed(FailureReason),
}

impl SessionState {
    /// `Done` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Erasing => write!(f, "erasing"),
            Self::Transferring => write!(f, "transferring"),
            Self::Verifying => write!(f, "verifying"),
            Self::Rebooting => write!(f, "rebooting"),
            Self::Done => write!(f, "done"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Why a board did not finish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Board never answered the handshake
    NoResponse,
    /// Board kept refusing a data chunk
    TransferRejected,
    /// Board computed a different image checksum
    ChecksumMismatch,
    /// Board stopped answering after the handshake
    Timeout,
    Cancelled,
    /// The bus failed underneath the session
    BusError,
    /// Image would overwrite write-protected or unmapped flash
    ProtectedRegion,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoResponse => "no response",
            Self::TransferRejected => "transfer rejected",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::BusError => "bus error",
            Self::ProtectedRegion => "protected region",
        };
        f.write_str(text)
    }
}

/// Final outcome for one board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlashResult {
    Success,
    Failed { reason: FailureReason },
}

impl FlashResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Outcome of a terminal state; `None` while the session is live
    pub fn from_state(state: &SessionState) -> Option<Self> {
        match state {
            SessionState::Done => Some(Self::Success),
            SessionState::Failed(reason) => Some(Self::Failed { reason: *reason }),
            _ => None,
        }
    }
}

impl fmt::Display for FlashResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// What a session does after the erase is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMode {
    /// Erase, transfer, verify and reboot
    #[default]
    Flash,
    /// Stop once the application region is erased
    EraseOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_with_status_tag() {
        let json = serde_json::to_value(FlashResult::Failed {
            reason: FailureReason::ChecksumMismatch,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "failed", "reason": "checksum_mismatch"})
        );
        assert_eq!(
            serde_json::to_value(FlashResult::Success).unwrap(),
            serde_json::json!({"status": "success"})
        );
    }

    #[test]
    fn test_result_from_state() {
        assert_eq!(FlashResult::from_state(&SessionState::Erasing), None);
        assert_eq!(
            FlashResult::from_state(&SessionState::Failed(FailureReason::Cancelled)),
            Some(FlashResult::Failed {
                reason: FailureReason::Cancelled
            })
        );
        assert!(SessionState::Done.is_terminal());
        assert!(!SessionState::Rebooting.is_terminal());
    }
}
