//! Mock bus with simulated bootloaders
//!
//! Each [`MockBoard`] behaves like the real bootloader: it keeps the bytes
//! written to it, computes the image CRC on verify and can be told to
//! misbehave. Replies are queued with the configured latency and handed out
//! by `receive` in order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{BusTransport, TransportError};
use crate::config::MockConfig;
use crate::image::CRC32;
use crate::protocol::{self, Frame, NackReason, ProtocolMessage};

#[derive(Debug, Clone, Default)]
struct Faults {
    /// Reply tag -> replies still to swallow
    drop_replies: HashMap<u8, usize>,
    silent_after: Option<u8>,
    unresponsive: bool,
    nack_chunks: usize,
    nack_verify: bool,
    corrupt_address: Option<u32>,
}

/// Simulated bootloader behind one request/response identifier pair
#[derive(Debug, Clone)]
pub struct MockBoard {
    request_id: u32,
    response_id: u32,
    faults: Faults,
    flash: BTreeMap<u32, u8>,
    erase_size: Option<u32>,
    silent: bool,
    rebooted: bool,
    received: Vec<ProtocolMessage>,
}

impl MockBoard {
    pub fn new(request_id: u32, response_id: u32) -> Self {
        Self {
            request_id,
            response_id,
            faults: Faults::default(),
            flash: BTreeMap::new(),
            erase_size: None,
            silent: false,
            rebooted: false,
            received: Vec::new(),
        }
    }

    /// Swallow the first `count` replies carrying `reply_tag`
    pub fn drop_replies(mut self, reply_tag: u8, count: usize) -> Self {
        self.faults.drop_replies.insert(reply_tag, count);
        self
    }

    /// Answer the first request carrying `request_tag`, then go quiet
    pub fn silent_after(mut self, request_tag: u8) -> Self {
        self.faults.silent_after = Some(request_tag);
        self
    }

    /// Never answer anything
    pub fn unresponsive(mut self) -> Self {
        self.faults.unresponsive = true;
        self
    }

    /// Refuse the next `count` chunk writes
    pub fn nack_chunks(mut self, count: usize) -> Self {
        self.faults.nack_chunks = count;
        self
    }

    /// Refuse every verify request
    pub fn nack_verify(mut self) -> Self {
        self.faults.nack_verify = true;
        self
    }

    /// Store the inverted value whenever `address` is written
    pub fn corrupt_byte(mut self, address: u32) -> Self {
        self.faults.corrupt_address = Some(address);
        self
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    /// Written bytes by address
    pub fn flash(&self) -> &BTreeMap<u32, u8> {
        &self.flash
    }

    /// Written bytes in address order
    pub fn contents(&self) -> Vec<u8> {
        self.flash.values().copied().collect()
    }

    /// Size announced by the last erase request
    pub fn erase_size(&self) -> Option<u32> {
        self.erase_size
    }

    pub fn rebooted(&self) -> bool {
        self.rebooted
    }

    /// Every decoded request, in arrival order
    pub fn received(&self) -> &[ProtocolMessage] {
        &self.received
    }

    /// Number of received requests carrying `tag`
    pub fn count_received(&self, tag: u8) -> usize {
        self.received.iter().filter(|m| m.tag() == tag).count()
    }

    fn handle(&mut self, message: ProtocolMessage) -> Option<ProtocolMessage> {
        self.received.push(message.clone());
        if self.silent || self.faults.unresponsive {
            return None;
        }
        let request_tag = message.tag();

        let reply = match message {
            ProtocolMessage::Ping => Some(ProtocolMessage::AckPing),
            ProtocolMessage::EraseRequest { size_bytes } => {
                self.flash.clear();
                self.erase_size = Some(size_bytes);
                Some(ProtocolMessage::EraseAck)
            }
            ProtocolMessage::DataChunk { offset, data, .. } => Some(self.write(offset, &data)),
            ProtocolMessage::VerifyRequest { crc32 } => {
                let actual = CRC32.checksum(&self.contents());
                if self.faults.nack_verify || actual != crc32 {
                    Some(ProtocolMessage::VerifyNack)
                } else {
                    Some(ProtocolMessage::VerifyAck)
                }
            }
            ProtocolMessage::Reboot => {
                self.rebooted = true;
                None
            }
            // Board-to-host messages
            _ => None,
        };

        if self.faults.silent_after == Some(request_tag) {
            self.silent = true;
        }

        let reply = reply?;
        if let Some(remaining) = self.faults.drop_replies.get_mut(&reply.tag()) {
            if *remaining > 0 {
                *remaining -= 1;
                return None;
            }
        }
        Some(reply)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> ProtocolMessage {
        let nack = |reason| ProtocolMessage::DataNack { offset, reason };

        if self.erase_size.is_none() {
            return nack(NackReason::NotErased);
        }
        if self.faults.nack_chunks > 0 {
            self.faults.nack_chunks -= 1;
            return nack(NackReason::WriteFailed);
        }
        if offset.checked_add(data.len() as u32).is_none() {
            return nack(NackReason::OutOfRange);
        }

        for (address, byte) in (offset..).zip(data) {
            let value = if self.faults.corrupt_address == Some(address) {
                !byte
            } else {
                *byte
            };
            self.flash.insert(address, value);
        }
        ProtocolMessage::DataAck { offset }
    }
}

/// In-memory bus for testing and dry runs
pub struct MockBus {
    latency: Duration,
    connected: AtomicBool,
    /// Sends left before the bus drops
    fail_after: Mutex<Option<usize>>,
    boards: Mutex<Vec<MockBoard>>,
    inbox: Mutex<VecDeque<(Instant, Frame)>>,
    sent: Mutex<Vec<Frame>>,
}

impl MockBus {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            latency: Duration::from_millis(config.latency_ms),
            connected: AtomicBool::new(true),
            fail_after: Mutex::new(None),
            boards: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Attach a simulated board
    pub fn add_board(&self, board: MockBoard) {
        self.boards.lock().push(board);
    }

    /// Snapshot of the board listening on `request_id`
    pub fn board(&self, request_id: u32) -> Option<MockBoard> {
        self.boards
            .lock()
            .iter()
            .find(|b| b.request_id == request_id)
            .cloned()
    }

    /// Queue a frame as if a board had sent it
    pub fn inject(&self, frame: Frame) {
        self.inbox.lock().push_back((Instant::now(), frame));
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Let `sends` more frames through, then fail every operation
    pub fn disconnect_after(&self, sends: usize) {
        *self.fail_after.lock() = Some(sends);
    }

    /// Every frame sent so far
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    fn take_send_budget(&self) -> bool {
        let mut fail_after = self.fail_after.lock();
        match fail_after.as_mut() {
            Some(0) => {
                self.connected.store(false, Ordering::SeqCst);
                false
            }
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) || !self.take_send_budget() {
            return Err(TransportError::BusUnavailable(
                "mock bus disconnected".to_string(),
            ));
        }
        self.sent.lock().push(*frame);

        let reply = {
            let mut boards = self.boards.lock();
            match boards.iter_mut().find(|b| b.request_id == frame.id()) {
                Some(board) => match protocol::decode(frame) {
                    Ok(message) => board.handle(message).map(|r| (board.response_id, r)),
                    Err(e) => {
                        tracing::debug!(%frame, error = %e, "Mock board ignored frame");
                        None
                    }
                },
                None => None,
            }
        };

        if let Some((id, message)) = reply {
            let frame = protocol::encode(&message, id)
                .map_err(|e| TransportError::BusUnavailable(e.to_string()))?;
            self.inbox
                .lock()
                .push_back((Instant::now() + self.latency, frame));
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }

            let next = self.inbox.lock().front().map(|(at, _)| *at);
            match next {
                Some(at) if at <= Instant::now() => {
                    return Ok(self.inbox.lock().pop_front().map(|(_, frame)| frame));
                }
                Some(at) if at <= deadline => tokio::time::sleep_until(at).await,
                _ => {
                    tokio::time::sleep_until(deadline).await;
                    return Ok(None);
                }
            }
        }
    }
}
