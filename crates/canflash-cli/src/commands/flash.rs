//! Flash and erase commands - firmware update over the bus

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use canflash_core::{
    create_transport, BoardTarget, FirmwareImage, FlashConfig, FlashJob, FlashMode,
    FlashOrchestrator, FlashReport,
};
use tokio::task::JoinHandle;

use super::progress::BoardProgress;
use crate::output::{OutputContext, OutputFormat, ReportRow};

/// Flash (or erase) the selected boards. Returns whether every board succeeded.
pub async fn run(
    config: &FlashConfig,
    selection: &[String],
    image: Option<&Path>,
    mode: FlashMode,
    ctx: &OutputContext,
) -> Result<bool> {
    let targets = config
        .resolve_targets(selection)
        .context("Failed to resolve boards")?;
    if targets.is_empty() {
        bail!("No boards selected; add [[boards]] to the config file");
    }

    let jobs = build_jobs(targets, image, ctx)?;
    let verb = match mode {
        FlashMode::Flash => "Updating",
        FlashMode::EraseOnly => "Erasing",
    };
    ctx.info(&format!(
        "{} {} board{}",
        verb,
        jobs.len(),
        if jobs.len() == 1 { "" } else { "s" }
    ));

    let board_targets: Vec<BoardTarget> = jobs.iter().map(|j| j.target.clone()).collect();
    let transport = create_transport(&config.transport, &board_targets)
        .await
        .context("Failed to open CAN bus")?;

    let mut orchestrator = FlashOrchestrator::new(transport)
        .with_retry(config.retry)
        .with_mode(mode);

    let control = orchestrator.control();
    ctrlc::set_handler(move || {
        control.cancel_all();
    })
    .context("Failed to install Ctrl-C handler")?;

    let progress = BoardProgress::new(&jobs, ctx.quiet || ctx.format == OutputFormat::Json)?;
    let display = progress.spawn(orchestrator.subscribe());

    let report = orchestrator.flash_jobs(jobs).await;
    // Closes the event channel so the display task ends
    drop(orchestrator);
    wait_for_display(display).await;

    let report = report.context("Flash run failed")?;
    render(&report, mode, ctx);
    Ok(report.is_success())
}

/// Pair every target with its image. `--image` overrides per-board artifacts;
/// boards sharing an artifact share one parsed image.
fn build_jobs(
    targets: Vec<BoardTarget>,
    image: Option<&Path>,
    ctx: &OutputContext,
) -> Result<Vec<FlashJob>> {
    let mut loaded: HashMap<PathBuf, Arc<FirmwareImage>> = HashMap::new();
    let mut jobs = Vec::with_capacity(targets.len());

    for target in targets {
        let path = match (image, &target.artifact) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(artifact)) => artifact.clone(),
            (None, None) => bail!(
                "Board {} has no artifact configured; pass --image",
                target.name
            ),
        };

        let firmware = match loaded.get(&path).cloned() {
            Some(firmware) => firmware,
            None => {
                let firmware = Arc::new(FirmwareImage::load(&path).with_context(|| {
                    format!("Failed to load firmware for board {}", target.name)
                })?);
                ctx.info(&format!(
                    "{}: {} ({} bytes, CRC {:#010x})",
                    target.name,
                    path.display(),
                    firmware.total_size(),
                    firmware.crc32()
                ));
                loaded.insert(path, firmware.clone());
                firmware
            }
        };

        jobs.push(FlashJob::new(target, firmware));
    }

    Ok(jobs)
}

/// A broken progress display never fails the run
async fn wait_for_display(display: JoinHandle<()>) {
    if let Err(e) = display.await {
        tracing::debug!(error = %e, "Progress display task failed");
    }
}

fn render(report: &FlashReport, mode: FlashMode, ctx: &OutputContext) {
    match ctx.format {
        OutputFormat::Json => ctx.print_json(report),
        OutputFormat::Table => {
            let rows: Vec<ReportRow> = report.boards.iter().map(ReportRow::from).collect();
            ctx.print(&rows);
        }
    }

    if let Some(err) = &report.transport_error {
        ctx.error(&format!("Bus failure: {}", err));
    }

    let failed: Vec<&str> = report.failed().map(|b| b.name.as_str()).collect();
    if failed.is_empty() {
        let done = match mode {
            FlashMode::Flash => "updated",
            FlashMode::EraseOnly => "erased",
        };
        let n = report.boards.len();
        ctx.success(&format!(
            "{} board{} {} successfully",
            n,
            if n == 1 { "" } else { "s" },
            done
        ));
    } else if failed.len() < report.boards.len() {
        ctx.warn(&format!(
            "{} of {} boards failed: {}",
            failed.len(),
            report.boards.len(),
            failed.join(", ")
        ));
    } else {
        ctx.error("Every board failed");
    }
}
