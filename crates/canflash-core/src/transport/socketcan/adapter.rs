//! SocketCAN adapter for raw bootloader frames

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};
use tokio::sync::mpsc;

use crate::config::SocketCanConfig;
use crate::protocol::Frame;
use crate::transport::{BusTransport, TransportError};

/// Attempts at a write the kernel queue refuses before giving up
const WRITE_ATTEMPTS: u32 = 100;

type Incoming = Result<Frame, TransportError>;

/// Raw CAN socket shared by every board session
pub struct SocketCanBus {
    interface: String,
    extended_ids: bool,
    socket: Arc<Mutex<CanSocket>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    running: Arc<AtomicBool>,
}

impl SocketCanBus {
    pub async fn new(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open CAN socket on {}: {}",
                config.interface, e
            ))
        })?;

        // Set socket to non-blocking for async operation
        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        // Frames queued before we opened belong to someone else
        Self::drain_socket(&socket);

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let bus = Self {
            interface: config.interface.clone(),
            extended_ids: config.extended_ids,
            socket: Arc::new(Mutex::new(socket)),
            incoming: tokio::sync::Mutex::new(incoming_rx),
            running: Arc::new(AtomicBool::new(true)),
        };
        bus.start_listener(incoming_tx);

        tracing::info!(
            interface = %bus.interface,
            extended_ids = bus.extended_ids,
            "CAN bus opened"
        );
        Ok(bus)
    }

    fn drain_socket(socket: &CanSocket) {
        while let Ok(frame) = socket.read_frame() {
            tracing::debug!(?frame, "Drained stale frame from socket");
        }
    }

    fn start_listener(&self, incoming_tx: mpsc::UnboundedSender<Incoming>) {
        let socket = self.socket.clone();
        let running = self.running.clone();
        let extended_ids = self.extended_ids;

        // Exits on its own once `running` clears or the receiver is dropped
        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let read = socket.lock().read_frame();
                match read {
                    Ok(can_frame) => {
                        let Some(frame) = from_can_frame(&can_frame, extended_ids) else {
                            continue;
                        };
                        tracing::trace!(%frame, "Frame received");
                        if incoming_tx.send(Ok(frame)).is_err() {
                            // Bus dropped
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::error!(error = %e, "SocketCAN read error");
                        let _ = incoming_tx.send(Err(TransportError::ReceiveFailed(e.to_string())));
                        break;
                    }
                }
            }
            tracing::debug!("SocketCAN listener stopped");
        });
    }

    fn to_can_frame(&self, frame: &Frame) -> Result<CanFrame, TransportError> {
        let id = if self.extended_ids {
            ExtendedId::new(frame.id()).map(Id::Extended)
        } else {
            u16::try_from(frame.id())
                .ok()
                .and_then(StandardId::new)
                .map(Id::Standard)
        }
        .ok_or_else(|| {
            TransportError::InvalidConfig(format!("Invalid CAN ID: 0x{:X}", frame.id()))
        })?;

        CanFrame::new(id, frame.payload()).ok_or_else(|| {
            TransportError::BusUnavailable(format!("Cannot build CAN frame for {}", frame))
        })
    }
}

/// Keep data frames in the configured identifier format
fn from_can_frame(can_frame: &CanFrame, extended_ids: bool) -> Option<Frame> {
    let CanFrame::Data(data) = can_frame else {
        return None;
    };
    let id = match data.id() {
        Id::Standard(id) if !extended_ids => u32::from(id.as_raw()),
        Id::Extended(id) if extended_ids => id.as_raw(),
        _ => return None,
    };
    Frame::new(id, data.data()).ok()
}

#[async_trait]
impl BusTransport for SocketCanBus {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let can_frame = self.to_can_frame(frame)?;
        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || {
            let mut attempts = 0;
            loop {
                match socket.lock().write_frame(&can_frame) {
                    Ok(()) => return Ok(()),
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock && attempts < WRITE_ATTEMPTS => {
                        attempts += 1;
                    }
                    Err(e) => return Err(TransportError::BusUnavailable(e.to_string())),
                }
                // TX queue full, give the controller time to drain it
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .await
        .map_err(|e| TransportError::BusUnavailable(format!("Task join error: {}", e)))??;

        tracing::trace!(%frame, "Frame sent");
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        match tokio::time::timeout(timeout, incoming.recv()).await {
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
