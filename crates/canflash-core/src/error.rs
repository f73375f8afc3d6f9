//! Run-level errors
//!
//! Frame decode problems and per-board failures never surface here: the
//! former are dropped by the control loop and the latter land in the
//! [`FlashReport`](crate::FlashReport). Only conditions that stop the whole
//! run (or keep it from starting) become a [`FlashError`].

use std::path::PathBuf;

use thiserror::Error;

use crate::image::MalformedImage;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum FlashError {
    /// The firmware artifact could not be decoded; flashing cannot start
    #[error("Malformed image: {0}")]
    Image(#[from] MalformedImage),

    /// The bus went away during the run
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid CAN identifier '{0}'")]
    InvalidId(String),

    #[error("Unknown board or group '{0}'")]
    UnknownBoard(String),

    #[error("Board '{board}' references unknown MCU '{mcu}'")]
    UnknownMcu { board: String, mcu: String },

    #[error("Duplicate {what}: {value}")]
    Duplicate { what: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}
