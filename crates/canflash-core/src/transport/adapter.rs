//! Bus transport trait

use std::time::Duration;

use async_trait::async_trait;

use super::TransportError;
use crate::protocol::Frame;

/// Shared CAN bus as seen by the orchestrator.
///
/// One instance carries the traffic of every board; frames are told apart by
/// identifier only.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Put one frame on the bus
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next received frame.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Must be cancel-safe:
    /// dropping the future before it completes loses no frame.
    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, TransportError>;
}
