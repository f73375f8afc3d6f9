//! canflash - flash firmware onto CAN bootloader boards
//!
//! Loads the board catalog, resolves the selected boards and their images,
//! and runs every board concurrently over one CAN bus.

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use canflash_core::FlashMode;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "canflash")]
#[command(author, version, about = "Flash firmware onto CAN bootloader boards")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML, or YAML by extension)
    #[arg(short, long, env = "CANFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// SocketCAN interface, overrides the configured transport
    #[arg(short, long, env = "CANFLASH_INTERFACE")]
    interface: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash firmware onto the selected boards
    Flash {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        images: ImageArgs,
    },

    /// Erase the application sectors of the selected boards
    Erase {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        images: ImageArgs,
    },

    /// List the configured boards and groups
    Boards,

    /// Show the build commit each running application broadcasts
    Commits {
        #[command(flatten)]
        selection: Selection,

        /// How long to listen before giving up on quiet boards
        #[arg(long, value_name = "MS", default_value_t = 2000)]
        timeout_ms: u64,
    },
}

/// Boards to operate on; nothing selected means every board
#[derive(Args, Debug, Default)]
struct Selection {
    /// Board group from the config
    #[arg(short, long = "group", value_name = "GROUP")]
    groups: Vec<String>,

    /// Single board from the config
    #[arg(short, long = "board", value_name = "BOARD")]
    boards: Vec<String>,
}

impl Selection {
    fn names(&self) -> Vec<String> {
        self.groups.iter().chain(&self.boards).cloned().collect()
    }
}

#[derive(Args, Debug, Default)]
struct ImageArgs {
    /// One image for every selected board, instead of per-board artifacts
    #[arg(long, value_name = "PATH")]
    image: Option<PathBuf>,

    /// Firmware build directory that artifact paths are relative to
    #[arg(long, env = "CANFLASH_BUILD_DIR", value_name = "DIR")]
    build_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(interface) = &cli.interface {
        config::use_interface(&mut config, interface);
    }

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    let success = match &cli.command {
        Commands::Flash { selection, images } => {
            if let Some(dir) = &images.build_dir {
                config.build_dir = Some(dir.clone());
            }
            commands::run(
                &config,
                &selection.names(),
                images.image.as_deref(),
                FlashMode::Flash,
                &ctx,
            )
            .await?
        }

        Commands::Erase { selection, images } => {
            if let Some(dir) = &images.build_dir {
                config.build_dir = Some(dir.clone());
            }
            commands::run(
                &config,
                &selection.names(),
                images.image.as_deref(),
                FlashMode::EraseOnly,
                &ctx,
            )
            .await?
        }

        Commands::Boards => {
            commands::boards(&config, &ctx)?;
            true
        }

        Commands::Commits {
            selection,
            timeout_ms,
        } => {
            commands::commits(
                &config,
                &selection.names(),
                Duration::from_millis(*timeout_ms),
                &ctx,
            )
            .await?
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `-v` forces debug; otherwise `RUST_LOG`, falling back to warn
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
