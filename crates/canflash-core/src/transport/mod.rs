//! Transport layer for bootloader traffic
//!
//! This module provides bus transports for talking to boards:
//! - SocketCAN adapter for raw CAN frames (Linux only)
//! - Mock bus with simulated bootloaders for testing and dry runs
//!
//! # Example
//!
//! ```ignore
//! use canflash_core::transport::{create_transport, BusTransport};
//! use canflash_core::config::TransportConfig;
//!
//! let config = TransportConfig::Mock(Default::default());
//! let transport = create_transport(&config, &targets).await?;
//! transport.send(&frame).await?;
//! let reply = transport.receive(Duration::from_millis(200)).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::BusTransport;
pub use error::TransportError;

use std::sync::Arc;

use crate::config::{BoardTarget, TransportConfig};

/// Create a bus transport based on configuration.
///
/// `targets` are the boards about to be flashed; the mock transport
/// simulates a healthy bootloader behind each of them.
pub async fn create_transport(
    config: &TransportConfig,
    targets: &[BoardTarget],
) -> Result<Arc<dyn BusTransport>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let _ = targets;
            let bus = socketcan::SocketCanBus::new(cfg).await?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => {
            let bus = mock::MockBus::new(cfg);
            for target in targets {
                bus.add_board(mock::MockBoard::new(target.request_id, target.response_id));
            }
            Ok(Arc::new(bus))
        }
    }
}
