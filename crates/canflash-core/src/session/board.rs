//! Bootloader protocol state machine for one board

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{FailureReason, FlashMode, SessionState};
use crate::config::{BoardTarget, RetryConfig};
use crate::image::FirmwareImage;
use crate::protocol::{ProtocolMessage, MAX_CHUNK_LEN};

/// Per-board traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames handed to the transport, retransmissions included
    pub frames_sent: u32,
    pub retransmissions: u32,
    pub chunks_acked: u32,
    pub bytes_acked: u32,
}

/// Drives one board from handshake to reboot.
///
/// At most one message is outstanding. The outbound message is queued by a
/// state change or a retry, handed out by [`poll_transmit`], and its reply
/// deadline is armed by [`on_sent`].
///
/// [`poll_transmit`]: BoardSession::poll_transmit
/// [`on_sent`]: BoardSession::on_sent
pub struct BoardSession {
    target: BoardTarget,
    image: Arc<FirmwareImage>,
    retry: RetryConfig,
    mode: FlashMode,
    state: SessionState,
    /// Segment holding the in-flight chunk
    segment: usize,
    /// Offset of the in-flight chunk within its segment
    offset: usize,
    retries: u32,
    outbound: Option<ProtocolMessage>,
    transmit_pending: bool,
    deadline: Option<Instant>,
    stats: SessionStats,
}

impl BoardSession {
    pub fn new(target: BoardTarget, image: Arc<FirmwareImage>, retry: RetryConfig) -> Self {
        Self {
            target,
            image,
            retry,
            mode: FlashMode::Flash,
            state: SessionState::Idle,
            segment: 0,
            offset: 0,
            retries: 0,
            outbound: None,
            transmit_pending: false,
            deadline: None,
            stats: SessionStats::default(),
        }
    }

    pub fn with_mode(mut self, mode: FlashMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn target(&self) -> &BoardTarget {
        &self.target
    }

    pub fn image(&self) -> &Arc<FirmwareImage> {
        &self.image
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Reply deadline of the message on the wire
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Message sent and still awaiting its reply
    pub fn in_flight(&self) -> Option<&ProtocolMessage> {
        match self.deadline {
            Some(_) => self.outbound.as_ref(),
            None => None,
        }
    }

    /// Begin the handshake
    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.enter(SessionState::Handshaking, ProtocolMessage::Ping);
        }
    }

    /// Message waiting to be transmitted, if any
    pub fn poll_transmit(&self) -> Option<&ProtocolMessage> {
        if self.transmit_pending {
            self.outbound.as_ref()
        } else {
            None
        }
    }

    /// The queued message was handed to the transport at `now`
    pub fn on_sent(&mut self, now: Instant) {
        if !self.transmit_pending {
            return;
        }
        self.transmit_pending = false;
        self.stats.frames_sent += 1;

        if self.state == SessionState::Rebooting {
            // Reboot is not acknowledged
            self.outbound = None;
            self.state = SessionState::Done;
            info!(board = %self.target.name, "Board rebooted into application");
            return;
        }

        if let Some(policy) = self.retry.for_state(&self.state) {
            self.deadline = Some(now + policy.timeout());
        }
    }

    /// Feed a reply received on this board's response identifier
    pub fn on_message(&mut self, message: &ProtocolMessage) {
        match (self.state, message) {
            (SessionState::Handshaking, ProtocolMessage::AckPing) => {
                let size_bytes = self.image.total_size();
                self.enter(
                    SessionState::Erasing,
                    ProtocolMessage::EraseRequest { size_bytes },
                );
            }
            (SessionState::Erasing, ProtocolMessage::EraseAck) => match self.mode {
                FlashMode::EraseOnly => self.finish(),
                FlashMode::Flash => {
                    self.segment = 0;
                    self.offset = 0;
                    let chunk = self.current_chunk();
                    self.enter(SessionState::Transferring, chunk);
                }
            },
            (SessionState::Transferring, ProtocolMessage::DataAck { offset }) => {
                match self.in_flight_chunk(*offset) {
                    Some(len) => self.advance(len),
                    None => debug!(
                        board = %self.target.name,
                        offset = %format!("{:#010x}", offset),
                        "Ignoring stale DataAck"
                    ),
                }
            }
            (SessionState::Transferring, ProtocolMessage::DataNack { offset, reason }) => {
                if self.transmit_pending || self.in_flight_chunk(*offset).is_none() {
                    debug!(board = %self.target.name, offset, "Ignoring stale DataNack");
                    return;
                }
                warn!(
                    board = %self.target.name,
                    offset = %format!("{:#010x}", offset),
                    %reason,
                    "Chunk rejected"
                );
                if !self.retry_or_fail(FailureReason::TransferRejected) {
                    debug!(board = %self.target.name, "Retries exhausted on nack");
                }
            }
            (SessionState::Verifying, ProtocolMessage::VerifyAck) => {
                self.enter(SessionState::Rebooting, ProtocolMessage::Reboot);
            }
            (SessionState::Verifying, ProtocolMessage::VerifyNack) => {
                self.fail(FailureReason::ChecksumMismatch);
            }
            (state, message) => {
                debug!(
                    board = %self.target.name,
                    %state,
                    reply = message.name(),
                    "Ignoring reply outside its state"
                );
            }
        }
    }

    /// Resend or fail when the reply deadline has passed
    pub fn on_tick(&mut self, now: Instant) {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return,
        }

        let reason = match self.state {
            SessionState::Handshaking => FailureReason::NoResponse,
            _ => FailureReason::Timeout,
        };
        self.retry_or_fail(reason);
    }

    /// Abort a live session
    pub fn cancel(&mut self) {
        self.fail(FailureReason::Cancelled);
    }

    /// Force a terminal failure; no-op once terminal
    pub fn fail(&mut self, reason: FailureReason) {
        if self.is_terminal() {
            return;
        }
        warn!(board = %self.target.name, state = %self.state, %reason, "Board failed");
        self.state = SessionState::Failed(reason);
        self.outbound = None;
        self.transmit_pending = false;
        self.deadline = None;
    }

    fn enter(&mut self, state: SessionState, message: ProtocolMessage) {
        info!(board = %self.target.name, %state, "State changed");
        self.state = state;
        self.queue(message);
        self.retries = 0;
    }

    fn queue(&mut self, message: ProtocolMessage) {
        self.outbound = Some(message);
        self.transmit_pending = true;
        self.deadline = None;
    }

    fn finish(&mut self) {
        info!(board = %self.target.name, "Erase complete");
        self.state = SessionState::Done;
        self.outbound = None;
        self.transmit_pending = false;
        self.deadline = None;
    }

    /// Requeue the outbound message, or fail with `reason` when the budget is
    /// spent. Returns whether a resend was queued.
    fn retry_or_fail(&mut self, reason: FailureReason) -> bool {
        let Some(policy) = self.retry.for_state(&self.state) else {
            return false;
        };
        if self.retries >= policy.max_retries {
            self.fail(reason);
            return false;
        }

        self.retries += 1;
        self.stats.retransmissions += 1;
        self.transmit_pending = true;
        self.deadline = None;
        warn!(
            board = %self.target.name,
            state = %self.state,
            request = self.outbound.as_ref().map(ProtocolMessage::name).unwrap_or("-"),
            attempt = self.retries,
            "Retransmitting"
        );
        true
    }

    /// Length of the outbound chunk if it starts at `offset`
    fn in_flight_chunk(&self, offset: u32) -> Option<usize> {
        match &self.outbound {
            Some(ProtocolMessage::DataChunk {
                offset: current,
                data,
                ..
            }) if *current == offset => Some(data.len()),
            _ => None,
        }
    }

    fn advance(&mut self, len: usize) {
        self.stats.chunks_acked += 1;
        self.stats.bytes_acked += len as u32;

        self.offset += len;
        let segments = self.image.segments();
        if self.offset >= segments[self.segment].len() {
            self.segment += 1;
            self.offset = 0;
        }

        if self.segment >= segments.len() {
            let crc32 = self.image.crc32();
            self.enter(SessionState::Verifying, ProtocolMessage::VerifyRequest { crc32 });
        } else {
            let chunk = self.current_chunk();
            self.queue(chunk);
            self.retries = 0;
        }
    }

    fn current_chunk(&self) -> ProtocolMessage {
        let segments = self.image.segments();
        let segment = &segments[self.segment];
        let end = (self.offset + MAX_CHUNK_LEN).min(segment.len());

        ProtocolMessage::DataChunk {
            offset: segment.base_address + self.offset as u32,
            data: segment.data.slice(self.offset..end),
            is_last: self.segment + 1 == segments.len() && end == segment.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::image::ImageFormat;
    use crate::protocol::NackReason;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn image() -> Arc<FirmwareImage> {
        Arc::new(
            FirmwareImage::from_pieces(
                ImageFormat::IntelHex,
                vec![(0x0802_0000, vec![1, 2, 3]), (0x0802_0100, vec![4, 5])],
                None,
            )
            .unwrap(),
        )
    }

    fn session(max_retries: u32) -> BoardSession {
        BoardSession::new(
            BoardTarget::new("VC", 1210, 1211),
            image(),
            RetryConfig::uniform(RetryPolicy::new(100, max_retries)),
        )
    }

    /// Take the queued message and mark it sent
    fn transmit(session: &mut BoardSession, now: Instant) -> ProtocolMessage {
        let message = session.poll_transmit().cloned().expect("nothing queued");
        session.on_sent(now);
        message
    }

    fn chunk(offset: u32, data: &'static [u8], is_last: bool) -> ProtocolMessage {
        ProtocolMessage::DataChunk {
            offset,
            data: Bytes::from_static(data),
            is_last,
        }
    }

    /// Walk a fresh session into `Transferring`
    fn into_transfer(session: &mut BoardSession, now: Instant) {
        session.start();
        transmit(session, now);
        session.on_message(&ProtocolMessage::AckPing);
        transmit(session, now);
        session.on_message(&ProtocolMessage::EraseAck);
    }

    #[test]
    fn test_full_exchange() {
        let now = Instant::now();
        let mut s = session(2);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.poll_transmit().is_none());

        s.start();
        assert_eq!(transmit(&mut s, now), ProtocolMessage::Ping);
        assert_eq!(s.deadline(), Some(now + TIMEOUT));

        s.on_message(&ProtocolMessage::AckPing);
        assert_eq!(s.state(), SessionState::Erasing);
        assert_eq!(
            transmit(&mut s, now),
            ProtocolMessage::EraseRequest { size_bytes: 5 }
        );

        s.on_message(&ProtocolMessage::EraseAck);
        assert_eq!(s.state(), SessionState::Transferring);

        let expected = [
            chunk(0x0802_0000, &[1, 2], false),
            chunk(0x0802_0002, &[3], false),
            chunk(0x0802_0100, &[4, 5], true),
        ];
        for want in expected {
            let sent = transmit(&mut s, now);
            assert_eq!(sent, want);
            let ProtocolMessage::DataChunk { offset, .. } = sent else {
                unreachable!()
            };
            s.on_message(&ProtocolMessage::DataAck { offset });
        }

        assert_eq!(s.state(), SessionState::Verifying);
        assert_eq!(
            transmit(&mut s, now),
            ProtocolMessage::VerifyRequest {
                crc32: s.image().crc32()
            }
        );

        s.on_message(&ProtocolMessage::VerifyAck);
        assert_eq!(s.state(), SessionState::Rebooting);
        assert_eq!(transmit(&mut s, now), ProtocolMessage::Reboot);
        assert_eq!(s.state(), SessionState::Done);
        assert!(s.poll_transmit().is_none());
        assert_eq!(s.deadline(), None);

        assert_eq!(
            s.stats(),
            SessionStats {
                frames_sent: 7,
                retransmissions: 0,
                chunks_acked: 3,
                bytes_acked: 5,
            }
        );
    }

    #[test]
    fn test_stale_ack_does_not_advance() {
        let now = Instant::now();
        let mut s = session(2);
        into_transfer(&mut s, now);

        transmit(&mut s, now);
        s.on_message(&ProtocolMessage::DataAck {
            offset: 0x0802_0002,
        });
        assert_eq!(s.stats().chunks_acked, 0);
        assert!(s.poll_transmit().is_none());
        assert_eq!(
            s.in_flight(),
            Some(&chunk(0x0802_0000, &[1, 2], false))
        );
    }

    #[test]
    fn test_timeout_resends_same_chunk() {
        let now = Instant::now();
        let mut s = session(2);
        into_transfer(&mut s, now);
        let first = transmit(&mut s, now);

        // Not yet due
        s.on_tick(now + TIMEOUT - Duration::from_millis(1));
        assert!(s.poll_transmit().is_none());

        s.on_tick(now + TIMEOUT);
        assert_eq!(s.poll_transmit(), Some(&first));
        assert_eq!(s.stats().retransmissions, 1);
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn test_handshake_exhaustion_is_no_response() {
        let mut now = Instant::now();
        let mut s = session(2);
        s.start();

        for _ in 0..3 {
            assert_eq!(transmit(&mut s, now), ProtocolMessage::Ping);
            now += TIMEOUT;
            s.on_tick(now);
        }
        assert_eq!(s.state(), SessionState::Failed(FailureReason::NoResponse));
        assert_eq!(s.stats().frames_sent, 3);
        assert_eq!(s.stats().retransmissions, 2);
    }

    #[test]
    fn test_erase_exhaustion_is_timeout() {
        let mut now = Instant::now();
        let mut s = session(0);
        s.start();
        transmit(&mut s, now);
        s.on_message(&ProtocolMessage::AckPing);
        transmit(&mut s, now);

        now += TIMEOUT;
        s.on_tick(now);
        assert_eq!(s.state(), SessionState::Failed(FailureReason::Timeout));
    }

    #[test]
    fn test_nack_consumes_retries() {
        let now = Instant::now();
        let mut s = session(1);
        into_transfer(&mut s, now);

        let nack = ProtocolMessage::DataNack {
            offset: 0x0802_0000,
            reason: NackReason::WriteFailed,
        };
        transmit(&mut s, now);
        s.on_message(&nack);
        assert_eq!(s.state(), SessionState::Transferring);

        // Duplicate nack before the resend goes out is ignored
        s.on_message(&nack);
        assert_eq!(s.stats().retransmissions, 1);

        transmit(&mut s, now);
        s.on_message(&nack);
        assert_eq!(
            s.state(),
            SessionState::Failed(FailureReason::TransferRejected)
        );
    }

    #[test]
    fn test_ack_resets_retry_budget() {
        let mut now = Instant::now();
        let mut s = session(1);
        into_transfer(&mut s, now);

        transmit(&mut s, now);
        now += TIMEOUT;
        s.on_tick(now);
        transmit(&mut s, now);
        s.on_message(&ProtocolMessage::DataAck {
            offset: 0x0802_0000,
        });

        // Next chunk gets a fresh budget
        transmit(&mut s, now);
        now += TIMEOUT;
        s.on_tick(now);
        assert_eq!(s.state(), SessionState::Transferring);
        assert_eq!(s.stats().retransmissions, 2);
    }

    #[test]
    fn test_verify_nack_fails_immediately() {
        let now = Instant::now();
        let mut s = session(5);
        into_transfer(&mut s, now);
        for offset in [0x0802_0000, 0x0802_0002, 0x0802_0100] {
            transmit(&mut s, now);
            s.on_message(&ProtocolMessage::DataAck { offset });
        }
        transmit(&mut s, now);

        s.on_message(&ProtocolMessage::VerifyNack);
        assert_eq!(
            s.state(),
            SessionState::Failed(FailureReason::ChecksumMismatch)
        );
        assert_eq!(s.stats().retransmissions, 0);
    }

    #[test]
    fn test_reply_outside_state_ignored() {
        let now = Instant::now();
        let mut s = session(2);
        s.start();
        transmit(&mut s, now);
        s.on_message(&ProtocolMessage::AckPing);
        transmit(&mut s, now);

        // Late duplicate of the handshake reply
        s.on_message(&ProtocolMessage::AckPing);
        s.on_message(&ProtocolMessage::VerifyAck);
        assert_eq!(s.state(), SessionState::Erasing);
        assert!(s.poll_transmit().is_none());
    }

    #[test]
    fn test_erase_only_stops_after_erase() {
        let now = Instant::now();
        let mut s = session(2).with_mode(FlashMode::EraseOnly);
        s.start();
        transmit(&mut s, now);
        s.on_message(&ProtocolMessage::AckPing);
        transmit(&mut s, now);
        s.on_message(&ProtocolMessage::EraseAck);

        assert_eq!(s.state(), SessionState::Done);
        assert!(s.poll_transmit().is_none());
    }

    #[test]
    fn test_cancel_is_terminal() {
        let now = Instant::now();
        let mut s = session(2);
        into_transfer(&mut s, now);
        s.cancel();
        assert_eq!(s.state(), SessionState::Failed(FailureReason::Cancelled));

        // Terminal states are sticky
        s.fail(FailureReason::BusError);
        s.on_message(&ProtocolMessage::DataAck {
            offset: 0x0802_0000,
        });
        assert_eq!(s.state(), SessionState::Failed(FailureReason::Cancelled));
        assert_eq!(s.in_flight(), None);
    }
}
