//! Build commit broadcast by running applications
//!
//! Each application periodically sends a frame on its board's commit
//! identifier: the first four bytes hold the git hash (little-endian, the
//! low 28 bits are the short hash) and the last byte is 1 when the build
//! came from a clean tree.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BoardTarget;
use crate::protocol::Frame;
use crate::transport::{BusTransport, TransportError};

const SHORT_HASH_MASK: u32 = 0x0FFF_FFFF;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Commit frame needs at least 4 bytes, got {0}")]
pub struct ShortCommitFrame(pub usize);

/// Commit an application was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    /// Short hash (7 hex digits)
    pub hash: u32,
    /// Built without uncommitted changes
    pub clean: bool,
}

impl CommitInfo {
    pub fn decode(frame: &Frame) -> Result<Self, ShortCommitFrame> {
        let payload = frame.payload();
        let Some(word) = payload.get(..4) else {
            return Err(ShortCommitFrame(payload.len()));
        };
        let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);

        Ok(Self {
            hash: raw & SHORT_HASH_MASK,
            clean: payload.last() == Some(&0x01),
        })
    }

    /// Hash as git prints it
    pub fn short_hash(&self) -> String {
        format!("{:07x}", self.hash)
    }
}

impl fmt::Display for CommitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.short_hash(),
            if self.clean { "clean" } else { "dirty" }
        )
    }
}

/// What one board reported, if anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardCommit {
    pub board: String,
    pub commit: Option<CommitInfo>,
}

/// Listen until every target with a commit identifier has reported, or
/// `timeout` passes.
///
/// Targets without a commit identifier are skipped. The result follows
/// target order; boards that stayed quiet have no commit.
pub async fn collect_commits(
    transport: &dyn BusTransport,
    targets: &[BoardTarget],
    timeout: Duration,
) -> Result<Vec<BoardCommit>, TransportError> {
    let listening: HashMap<u32, &str> = targets
        .iter()
        .filter_map(|t| t.commit_id.map(|id| (id, t.name.as_str())))
        .collect();
    let mut found: HashMap<&str, CommitInfo> = HashMap::new();
    let deadline = Instant::now() + timeout;

    while found.len() < listening.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(frame) = transport.receive(remaining).await? else {
            continue;
        };
        let Some(&board) = listening.get(&frame.id()) else {
            continue;
        };
        if found.contains_key(board) {
            continue;
        }
        match CommitInfo::decode(&frame) {
            Ok(commit) => {
                info!(board, %commit, "Board reported its commit");
                found.insert(board, commit);
            }
            Err(e) => debug!(board, %frame, error = %e, "Ignoring commit frame"),
        }
    }

    Ok(targets
        .iter()
        .filter(|t| t.commit_id.is_some())
        .map(|t| BoardCommit {
            board: t.name.clone(),
            commit: found.get(t.name.as_str()).copied(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockBus;
    use pretty_assertions::assert_eq;

    fn commit_frame(id: u32, hash: u32, clean: u8) -> Frame {
        let mut payload = hash.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0, 0, 0, clean]);
        Frame::new(id, &payload).unwrap()
    }

    #[test]
    fn test_decode_short_hash_and_tree_state() {
        let commit = CommitInfo::decode(&commit_frame(204, 0xA1B2_C3D4, 0x01)).unwrap();
        assert_eq!(commit.short_hash(), "1b2c3d4");
        assert!(commit.clean);
        assert_eq!(commit.to_string(), "1b2c3d4 (clean)");

        let dirty = CommitInfo::decode(&commit_frame(204, 0x0000_0ABC, 0x00)).unwrap();
        assert_eq!(dirty.short_hash(), "0000abc");
        assert!(!dirty.clean);
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let frame = Frame::new(204, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(CommitInfo::decode(&frame), Err(ShortCommitFrame(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_reports_quiet_boards() {
        let bus = MockBus::new(&MockConfig::default());
        bus.inject(Frame::new(0x123, &[0xFF; 8]).unwrap());
        bus.inject(commit_frame(140, 0x0BAD_CAFE, 0x00));
        bus.inject(commit_frame(204, 0x0123_4567, 0x01));
        // Repeats keep the first report
        bus.inject(commit_frame(204, 0x0765_4321, 0x00));

        let targets = vec![
            BoardTarget::new("VC", 1210, 1211).with_commit_id(204),
            BoardTarget::new("BMS", 1200, 1201).with_commit_id(140),
            BoardTarget::new("FSM", 1220, 1221).with_commit_id(302),
            BoardTarget::new("h7dev", 1300, 1301),
        ];

        let started = Instant::now();
        let commits = collect_commits(&bus, &targets, Duration::from_millis(500))
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(
            commits,
            vec![
                BoardCommit {
                    board: "VC".to_string(),
                    commit: Some(CommitInfo { hash: 0x0123_4567, clean: true }),
                },
                BoardCommit {
                    board: "BMS".to_string(),
                    commit: Some(CommitInfo { hash: 0x0BAD_CAFE, clean: false }),
                },
                BoardCommit {
                    board: "FSM".to_string(),
                    commit: None,
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_returns_once_everyone_reported() {
        let bus = MockBus::new(&MockConfig::default());
        bus.inject(commit_frame(302, 0x0000_0001, 0x01));
        let targets = vec![BoardTarget::new("FSM", 1220, 1221).with_commit_id(302)];

        let started = Instant::now();
        let commits = collect_commits(&bus, &targets, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(commits[0].commit.map(|c| c.short_hash()), Some("0000001".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_propagates_lost_bus() {
        let bus = MockBus::new(&MockConfig::default());
        bus.set_connected(false);
        let targets = vec![BoardTarget::new("VC", 1210, 1211).with_commit_id(204)];

        let err = collect_commits(&bus, &targets, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::ConnectionClosed);
    }
}
