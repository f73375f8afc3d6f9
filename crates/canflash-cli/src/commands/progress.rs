//! Per-board progress bars fed by orchestrator events

use std::collections::HashMap;

use anyhow::Result;
use canflash_core::{FlashEvent, FlashJob, FlashResult};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

pub struct BoardProgress {
    bars: HashMap<String, ProgressBar>,
}

impl BoardProgress {
    /// One bar per job, sized to its image
    pub fn new(jobs: &[FlashJob], hidden: bool) -> Result<Self> {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:>6.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("=>-");
        let width = jobs.iter().map(|j| j.target.name.len()).max().unwrap_or(0);

        let bars = jobs
            .iter()
            .map(|job| {
                let bar = multi.add(ProgressBar::new(u64::from(job.image.total_size())));
                bar.set_style(style.clone());
                bar.set_prefix(format!("{:>width$}", job.target.name));
                bar.set_message("waiting");
                (job.target.name.clone(), bar)
            })
            .collect();

        Ok(Self { bars })
    }

    /// Render events until the orchestrator drops its sender
    pub fn spawn(self, mut events: broadcast::Receiver<FlashEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.apply(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Progress display fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            for bar in self.bars.values() {
                if !bar.is_finished() {
                    bar.abandon();
                }
            }
        })
    }

    fn apply(&self, event: &FlashEvent) {
        let Some(bar) = self.bars.get(event.board()) else {
            return;
        };

        match event {
            FlashEvent::StateChanged { state, .. } => bar.set_message(state.to_string()),
            FlashEvent::ChunkAcked {
                bytes_acked,
                total_bytes,
                ..
            } => {
                bar.set_length(u64::from(*total_bytes));
                bar.set_position(u64::from(*bytes_acked));
            }
            FlashEvent::Retransmit { state, count, .. } => {
                bar.set_message(format!("{} ({} resent)", state, count));
            }
            FlashEvent::Finished { result, .. } => match result {
                FlashResult::Success => bar.finish_with_message("done".green().to_string()),
                FlashResult::Failed { reason } => {
                    bar.abandon_with_message(format!("failed: {}", reason).red().to_string())
                }
            },
        }
    }
}
