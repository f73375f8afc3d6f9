//! canflash-core - CAN bootloader flashing engine
//!
//! This crate flashes firmware onto several boards sharing one CAN bus. It
//! parses build artifacts into addressed segments, speaks a small
//! request/confirm bootloader protocol over 8-byte frames, and runs one
//! session per board from a single control loop.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FlashOrchestrator                         │
//! │  one control loop, routes frames by response identifier     │
//! │                                                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │BoardSession  │  │BoardSession  │  │BoardSession  │  ...  │
//! │  │ (board "VC") │  │ (board "BMS")│  │ (board "FSM")│       │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘       │
//! │         └─────────┬───────┴─────────────────┘               │
//! │             ┌─────┴─────┐        ┌─────────────────┐        │
//! │             │  codec    │        │ FirmwareImage   │        │
//! │             │ (frames)  │        │ (shared, Arc)   │        │
//! │             └─────┬─────┘        └─────────────────┘        │
//! │          ┌────────┴────────┐                                │
//! │          │  BusTransport   │                                │
//! │          │ (SocketCAN/mock)│                                │
//! │          └─────────────────┘                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod commit;
pub mod config;
pub mod error;
pub mod image;
pub mod layout;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod transport;

pub use commit::{collect_commits, BoardCommit, CommitInfo};
pub use config::{BoardTarget, FlashConfig, RetryConfig, RetryPolicy, TransportConfig};
pub use error::{ConfigError, FlashError};
pub use image::{FirmwareImage, ImageFormat, MalformedImage, Segment};
pub use layout::{FlashSector, Microcontroller};
pub use orchestrator::{
    flash_all, BoardReport, FlashControl, FlashEvent, FlashJob, FlashMode, FlashOrchestrator,
    FlashReport,
};
pub use protocol::{Frame, NackReason, ProtocolMessage, UnknownMessage};
pub use session::{BoardSession, FailureReason, FlashResult, SessionState};
pub use transport::{create_transport, BusTransport, TransportError};

// Re-export raw CAN transport (Linux + socketcan feature only)
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use transport::socketcan::SocketCanBus;
