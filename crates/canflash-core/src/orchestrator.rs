//! Flash orchestration over one shared bus
//!
//! One control loop owns every [`BoardSession`]. Each pass it transmits at
//! most one queued frame per session (rotating the starting session), then
//! waits on the transport until the earliest reply deadline or a control
//! command, routes whatever arrived by response identifier, and checks
//! deadlines. The run ends when every session is terminal.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{BoardTarget, RetryConfig};
use crate::error::{ConfigError, FlashError};
use crate::image::FirmwareImage;
use crate::protocol::{self, Frame};
pub use crate::session::FlashMode;
use crate::session::{BoardSession, FailureReason, FlashResult, SessionState, SessionStats};
use crate::transport::{BusTransport, TransportError};

const EVENT_CAPACITY: usize = 1024;

/// One board and the image it receives
#[derive(Debug, Clone)]
pub struct FlashJob {
    pub target: BoardTarget,
    pub image: Arc<FirmwareImage>,
}

impl FlashJob {
    pub fn new(target: BoardTarget, image: Arc<FirmwareImage>) -> Self {
        Self { target, image }
    }
}

/// Progress notification published during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlashEvent {
    StateChanged {
        board: String,
        state: SessionState,
    },
    ChunkAcked {
        board: String,
        bytes_acked: u32,
        total_bytes: u32,
    },
    Retransmit {
        board: String,
        state: SessionState,
        /// Retransmissions so far for this board
        count: u32,
    },
    Finished {
        board: String,
        result: FlashResult,
    },
}

impl FlashEvent {
    pub fn board(&self) -> &str {
        match self {
            Self::StateChanged { board, .. }
            | Self::ChunkAcked { board, .. }
            | Self::Retransmit { board, .. }
            | Self::Finished { board, .. } => board,
        }
    }
}

#[derive(Debug)]
enum ControlCommand {
    Cancel(String),
    CancelAll,
}

/// Handle for cancelling boards while a run is in progress
#[derive(Debug, Clone)]
pub struct FlashControl {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl FlashControl {
    /// Cancel one board of the running flash. Returns false once the
    /// orchestrator is gone.
    pub fn cancel(&self, board: impl Into<String>) -> bool {
        self.tx.send(ControlCommand::Cancel(board.into())).is_ok()
    }

    /// Cancel every live board of the running flash
    pub fn cancel_all(&self) -> bool {
        self.tx.send(ControlCommand::CancelAll).is_ok()
    }
}

/// Outcome of one board
#[derive(Debug, Clone, Serialize)]
pub struct BoardReport {
    pub name: String,
    pub result: FlashResult,
    /// Time from run start until the board finished
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub frames_sent: u32,
    pub retransmissions: u32,
    pub bytes_acked: u32,
    pub total_bytes: u32,
}

/// Outcome of a run: every target exactly once, in job order
#[derive(Debug, Clone, Serialize)]
pub struct FlashReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mode: FlashMode,
    pub boards: Vec<BoardReport>,
    /// Bus failure that ended the run early
    #[serde(serialize_with = "serialize_transport_error")]
    pub transport_error: Option<TransportError>,
}

impl FlashReport {
    /// Every board succeeded
    pub fn is_success(&self) -> bool {
        self.boards.iter().all(|b| b.result.is_success())
    }

    pub fn result(&self, board: &str) -> Option<FlashResult> {
        self.boards.iter().find(|b| b.name == board).map(|b| b.result)
    }

    /// Result per board name
    pub fn results(&self) -> BTreeMap<String, FlashResult> {
        self.boards
            .iter()
            .map(|b| (b.name.clone(), b.result))
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &BoardReport> {
        self.boards.iter().filter(|b| !b.result.is_success())
    }

    /// Turn a bus failure recorded in the report into a run-level error
    pub fn into_result(self) -> Result<Self, FlashError> {
        match self.transport_error {
            Some(e) => Err(FlashError::Transport(e)),
            None => Ok(self),
        }
    }
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

fn serialize_transport_error<S: Serializer>(
    value: &Option<TransportError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Flash `image` onto every target with default settings
pub async fn flash_all(
    image: Arc<FirmwareImage>,
    targets: &[BoardTarget],
    transport: Arc<dyn BusTransport>,
) -> Result<FlashReport, FlashError> {
    FlashOrchestrator::new(transport)
        .flash_all(image, targets)
        .await
}

/// Last values published for a session
#[derive(Clone, Copy)]
struct Observed {
    state: SessionState,
    stats: SessionStats,
}

struct Slot {
    session: BoardSession,
    observed: Observed,
    elapsed: Option<Duration>,
}

impl Slot {
    fn new(session: BoardSession) -> Self {
        let observed = Observed {
            state: session.state(),
            stats: session.stats(),
        };
        Self {
            session,
            observed,
            elapsed: None,
        }
    }

    fn is_live(&self) -> bool {
        !self.session.is_terminal()
    }
}

/// What woke the control loop
enum Wake {
    Control(ControlCommand),
    Received(Result<Option<Frame>, TransportError>),
}

/// Runs board sessions over one transport
pub struct FlashOrchestrator {
    transport: Arc<dyn BusTransport>,
    retry: RetryConfig,
    mode: FlashMode,
    events: broadcast::Sender<FlashEvent>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
}

impl FlashOrchestrator {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            retry: RetryConfig::default(),
            mode: FlashMode::Flash,
            events,
            control_tx,
            control_rx,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_mode(mut self, mode: FlashMode) -> Self {
        self.mode = mode;
        self
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.events.subscribe()
    }

    pub fn control(&self) -> FlashControl {
        FlashControl {
            tx: self.control_tx.clone(),
        }
    }

    /// Flash the same image onto every target
    pub async fn flash_all(
        &mut self,
        image: Arc<FirmwareImage>,
        targets: &[BoardTarget],
    ) -> Result<FlashReport, FlashError> {
        let jobs = targets
            .iter()
            .map(|target| FlashJob::new(target.clone(), image.clone()))
            .collect();
        self.flash_jobs(jobs).await
    }

    /// Flash each job's image onto its board.
    ///
    /// Board failures and bus loss are recorded in the report; only invalid
    /// jobs (duplicate names or identifiers) fail the call.
    pub async fn flash_jobs(&mut self, jobs: Vec<FlashJob>) -> Result<FlashReport, FlashError> {
        check_jobs(&jobs)?;

        // Commands sent while no run was active do not apply to this one
        while let Ok(command) = self.control_rx.try_recv() {
            debug!(?command, "Discarding control command from before the run");
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(%run_id, boards = jobs.len(), mode = ?self.mode, "Flash run started");

        let mut slots: Vec<Slot> = jobs
            .into_iter()
            .map(|job| {
                let session =
                    BoardSession::new(job.target, job.image, self.retry).with_mode(self.mode);
                Slot::new(session)
            })
            .collect();

        for slot in &mut slots {
            self.preflight(slot);
            self.publish(slot, started);
        }

        let transport = self.transport.clone();
        let mut transport_error = None;
        let mut cursor = 0;

        loop {
            while let Ok(command) = self.control_rx.try_recv() {
                self.apply(command, &mut slots, started);
            }
            if !slots.iter().any(Slot::is_live) {
                break;
            }

            if let Err(e) = self
                .transmit_pass(transport.as_ref(), &mut slots, cursor, started)
                .await
            {
                self.abort(&mut slots, &e, started);
                transport_error = Some(e);
                break;
            }
            cursor = (cursor + 1) % slots.len();
            if !slots.iter().any(Slot::is_live) {
                break;
            }

            let now = Instant::now();
            let wait = slots
                .iter()
                .filter_map(|s| s.session.deadline())
                .min()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);

            let wake = tokio::select! {
                Some(command) = self.control_rx.recv() => Wake::Control(command),
                received = transport.receive(wait) => Wake::Received(received),
            };

            match wake {
                Wake::Control(command) => self.apply(command, &mut slots, started),
                Wake::Received(Ok(Some(frame))) => self.dispatch(&mut slots, &frame, started),
                Wake::Received(Ok(None)) => {}
                Wake::Received(Err(e)) => {
                    self.abort(&mut slots, &e, started);
                    transport_error = Some(e);
                    break;
                }
            }

            let now = Instant::now();
            for slot in slots.iter_mut().filter(|s| s.is_live()) {
                slot.session.on_tick(now);
                self.publish(slot, started);
            }
        }

        let boards: Vec<BoardReport> = slots
            .into_iter()
            .map(|slot| {
                let stats = slot.session.stats();
                BoardReport {
                    name: slot.session.name().to_string(),
                    result: FlashResult::from_state(&slot.session.state()).unwrap_or(
                        FlashResult::Failed {
                            reason: FailureReason::Cancelled,
                        },
                    ),
                    elapsed: slot.elapsed.unwrap_or_else(|| started.elapsed()),
                    frames_sent: stats.frames_sent,
                    retransmissions: stats.retransmissions,
                    bytes_acked: stats.bytes_acked,
                    total_bytes: slot.session.image().total_size(),
                }
            })
            .collect();

        let succeeded = boards.iter().filter(|b| b.result.is_success()).count();
        info!(
            %run_id,
            succeeded,
            failed = boards.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flash run finished"
        );

        Ok(FlashReport {
            run_id,
            started_at,
            mode: self.mode,
            boards,
            transport_error,
        })
    }

    /// Refuse images that would touch write-protected flash, start the rest
    fn preflight(&self, slot: &mut Slot) {
        let session = &slot.session;
        let violation = session
            .target()
            .mcu
            .as_ref()
            .and_then(|mcu| mcu.check_image(session.image()).err());

        if let Some(violation) = violation {
            warn!(board = %session.name(), %violation, "Image does not fit flash layout");
            slot.session.fail(FailureReason::ProtectedRegion);
            return;
        }

        if let Some(mcu) = &session.target().mcu {
            let sectors: Vec<u32> = mcu.sectors_for(session.image()).iter().map(|s| s.id).collect();
            debug!(board = %session.name(), mcu = %mcu.name, ?sectors, "Sectors to erase");
        }
        slot.session.start();
    }

    async fn transmit_pass(
        &self,
        transport: &dyn BusTransport,
        slots: &mut [Slot],
        cursor: usize,
        started: Instant,
    ) -> Result<(), TransportError> {
        let count = slots.len();
        for step in 0..count {
            let slot = &mut slots[(cursor + step) % count];
            let Some(message) = slot.session.poll_transmit() else {
                continue;
            };
            let name = message.name();

            let frame = match protocol::encode(message, slot.session.target().request_id) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(board = %slot.session.name(), request = name, error = %e, "Cannot encode request");
                    slot.session.fail(FailureReason::TransferRejected);
                    self.publish(slot, started);
                    continue;
                }
            };

            debug!(board = %slot.session.name(), request = name, %frame, "Sending");
            transport.send(&frame).await?;
            slot.session.on_sent(Instant::now());
            self.publish(slot, started);
        }
        Ok(())
    }

    /// Hand a received frame to the live session listening on its identifier
    fn dispatch(&self, slots: &mut [Slot], frame: &Frame, started: Instant) {
        let Some(slot) = slots
            .iter_mut()
            .find(|s| s.is_live() && s.session.target().response_id == frame.id())
        else {
            trace!(%frame, "Dropping frame for no live session");
            return;
        };

        match protocol::decode(frame) {
            Ok(message) => {
                debug!(board = %slot.session.name(), reply = message.name(), "Received");
                slot.session.on_message(&message);
                self.publish(slot, started);
            }
            Err(e) => {
                debug!(board = %slot.session.name(), %frame, error = %e, "Dropping undecodable frame");
            }
        }
    }

    fn apply(&self, command: ControlCommand, slots: &mut [Slot], started: Instant) {
        match command {
            ControlCommand::Cancel(board) => {
                match slots.iter_mut().find(|s| s.session.name() == board) {
                    Some(slot) => {
                        info!(%board, "Cancelling board");
                        slot.session.cancel();
                        self.publish(slot, started);
                    }
                    None => debug!(%board, "Cancel for unknown board ignored"),
                }
            }
            ControlCommand::CancelAll => {
                info!("Cancelling all boards");
                for slot in slots.iter_mut() {
                    slot.session.cancel();
                    self.publish(slot, started);
                }
            }
        }
    }

    fn abort(&self, slots: &mut [Slot], err: &TransportError, started: Instant) {
        error!(error = %err, "Bus failed, aborting run");
        for slot in slots.iter_mut() {
            slot.session.fail(FailureReason::BusError);
            self.publish(slot, started);
        }
    }

    /// Emit events for whatever changed since the last call
    fn publish(&self, slot: &mut Slot, started: Instant) {
        let state = slot.session.state();
        let stats = slot.session.stats();
        let board = slot.session.name();

        if stats.retransmissions > slot.observed.stats.retransmissions {
            self.emit(FlashEvent::Retransmit {
                board: board.to_string(),
                state,
                count: stats.retransmissions,
            });
        }
        if stats.bytes_acked != slot.observed.stats.bytes_acked {
            self.emit(FlashEvent::ChunkAcked {
                board: board.to_string(),
                bytes_acked: stats.bytes_acked,
                total_bytes: slot.session.image().total_size(),
            });
        }
        if state != slot.observed.state {
            self.emit(FlashEvent::StateChanged {
                board: board.to_string(),
                state,
            });
        }
        if let (Some(result), None) = (FlashResult::from_state(&state), slot.elapsed) {
            let elapsed = started.elapsed();
            info!(
                %board,
                %result,
                elapsed_ms = elapsed.as_millis() as u64,
                frames = stats.frames_sent,
                retransmissions = stats.retransmissions,
                "Board finished"
            );
            self.emit(FlashEvent::Finished {
                board: board.to_string(),
                result,
            });
            slot.elapsed = Some(elapsed);
        }

        slot.observed = Observed { state, stats };
    }

    fn emit(&self, event: FlashEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Names and identifiers must be unique across one run
fn check_jobs(jobs: &[FlashJob]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    for job in jobs {
        let target = &job.target;
        if !names.insert(target.name.as_str()) {
            return Err(ConfigError::Duplicate {
                what: "board name",
                value: target.name.clone(),
            });
        }
        for id in [target.request_id, target.response_id] {
            if !ids.insert(id) {
                return Err(ConfigError::Duplicate {
                    what: "CAN identifier",
                    value: format!("{:#x}", id),
                });
            }
        }
    }
    Ok(())
}
