//! Commits command - which build each running board carries

use std::time::Duration;

use anyhow::{bail, Context, Result};
use canflash_core::{collect_commits, create_transport, BoardCommit, BoardTarget, FlashConfig};

use crate::output::{CommitRow, OutputContext};

/// Listen for commit broadcasts. Returns whether every board reported.
pub async fn commits(
    config: &FlashConfig,
    selection: &[String],
    timeout: Duration,
    ctx: &OutputContext,
) -> Result<bool> {
    let targets = listening_targets(
        config
            .resolve_targets(selection)
            .context("Failed to resolve boards")?,
    )?;

    let transport = create_transport(&config.transport, &targets)
        .await
        .context("Failed to open CAN bus")?;
    ctx.info(&format!(
        "Listening for {} board{} ({:.1}s)",
        targets.len(),
        if targets.len() == 1 { "" } else { "s" },
        timeout.as_secs_f64()
    ));

    let reports = collect_commits(transport.as_ref(), &targets, timeout)
        .await
        .context("Bus failure while listening")?;

    let rows: Vec<CommitRow> = reports.iter().map(CommitRow::from).collect();
    ctx.print(&rows);

    let quiet = quiet_boards(&reports);
    if quiet.is_empty() {
        Ok(true)
    } else {
        ctx.warn(&format!("No commit seen from: {}", quiet.join(", ")));
        Ok(false)
    }
}

/// Selected boards that broadcast a commit; at least one is required
fn listening_targets(targets: Vec<BoardTarget>) -> Result<Vec<BoardTarget>> {
    let listening: Vec<BoardTarget> = targets
        .into_iter()
        .filter(|t| t.commit_id.is_some())
        .collect();
    if listening.is_empty() {
        bail!("No selected board has a commit_id configured");
    }
    Ok(listening)
}

fn quiet_boards(reports: &[BoardCommit]) -> Vec<&str> {
    reports
        .iter()
        .filter(|r| r.commit.is_none())
        .map(|r| r.board.as_str())
        .collect()
}
