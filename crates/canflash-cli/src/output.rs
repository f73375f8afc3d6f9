//! Output formatting for canflash (table, json)

use canflash_core::{BoardCommit, BoardReport, BoardTarget, FlashResult};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Human-readable chatter is suppressed in quiet mode and for JSON output
    fn chatty(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Table
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if self.chatty() {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if self.chatty() {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => self.print_json(&data),
        }
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, data: &T) {
        println!(
            "{}",
            serde_json::to_string_pretty(data).unwrap_or_else(|_| "null".to_string())
        );
    }
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Catalog entry for the boards command
#[derive(Debug, Tabled, Serialize)]
pub struct BoardRow {
    #[tabled(rename = "Board")]
    pub name: String,
    #[tabled(rename = "Request ID")]
    pub request_id: String,
    #[tabled(rename = "Response ID")]
    pub response_id: String,
    #[tabled(rename = "MCU")]
    pub mcu: String,
    #[tabled(rename = "Artifact")]
    pub artifact: String,
}

impl From<&BoardTarget> for BoardRow {
    fn from(target: &BoardTarget) -> Self {
        Self {
            name: target.name.clone(),
            request_id: format_id(target.request_id),
            response_id: format_id(target.response_id),
            mcu: target
                .mcu
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_else(|| "-".to_string()),
            artifact: target
                .artifact
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Group membership for the boards command
#[derive(Debug, Tabled, Serialize)]
pub struct GroupRow {
    #[tabled(rename = "Group")]
    pub name: String,
    #[tabled(rename = "Boards")]
    pub boards: String,
}

/// Per-board outcome of a flash or erase run
#[derive(Debug, Tabled, Serialize)]
pub struct ReportRow {
    #[tabled(rename = "Board")]
    pub board: String,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "Bytes")]
    pub bytes: String,
    #[tabled(rename = "Frames")]
    pub frames: u32,
    #[tabled(rename = "Retries")]
    pub retries: u32,
    #[tabled(rename = "Time")]
    pub elapsed: String,
}

impl From<&BoardReport> for ReportRow {
    fn from(report: &BoardReport) -> Self {
        let result = match report.result {
            FlashResult::Success => "ok".to_string(),
            FlashResult::Failed { reason } => reason.to_string(),
        };
        Self {
            board: report.name.clone(),
            result,
            bytes: format!("{}/{}", report.bytes_acked, report.total_bytes),
            frames: report.frames_sent,
            retries: report.retransmissions,
            elapsed: format!("{:.1}s", report.elapsed.as_secs_f64()),
        }
    }
}

/// Build commit reported by one board
#[derive(Debug, Tabled, Serialize)]
pub struct CommitRow {
    #[tabled(rename = "Board")]
    pub board: String,
    #[tabled(rename = "Commit")]
    pub commit: String,
    #[tabled(rename = "Tree")]
    pub tree: String,
}

impl From<&BoardCommit> for CommitRow {
    fn from(report: &BoardCommit) -> Self {
        let (commit, tree) = match &report.commit {
            Some(info) => (
                info.short_hash(),
                if info.clean { "clean" } else { "dirty" }.to_string(),
            ),
            None => ("not seen".to_string(), "-".to_string()),
        };
        Self {
            board: report.board.clone(),
            commit,
            tree,
        }
    }
}

/// CAN identifiers are shown in decimal and hex
fn format_id(id: u32) -> String {
    format!("{} ({:#x})", id, id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canflash_core::{CommitInfo, FailureReason};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_board_row_from_target() {
        let target = BoardTarget::new("VC", 1210, 1211).with_artifact("fw/VC.hex");
        let row = BoardRow::from(&target);
        assert_eq!(row.request_id, "1210 (0x4ba)");
        assert_eq!(row.response_id, "1211 (0x4bb)");
        assert_eq!(row.mcu, "-");
        assert_eq!(row.artifact, "fw/VC.hex");
    }

    #[test]
    fn test_commit_row_for_quiet_board() {
        let quiet = BoardCommit {
            board: "RSM".to_string(),
            commit: None,
        };
        let row = CommitRow::from(&quiet);
        assert_eq!(row.commit, "not seen");
        assert_eq!(row.tree, "-");

        let dirty = BoardCommit {
            board: "VC".to_string(),
            commit: Some(CommitInfo {
                hash: 0x000B_EEF0,
                clean: false,
            }),
        };
        let row = CommitRow::from(&dirty);
        assert_eq!(row.commit, "00beef0");
        assert_eq!(row.tree, "dirty");
    }

    #[test]
    fn test_report_row_from_failed_board() {
        let report = BoardReport {
            name: "FSM".to_string(),
            result: FlashResult::Failed {
                reason: FailureReason::Timeout,
            },
            elapsed: Duration::from_millis(2500),
            frames_sent: 12,
            retransmissions: 3,
            bytes_acked: 4,
            total_bytes: 16,
        };
        let row = ReportRow::from(&report);
        assert_eq!(row.result, FailureReason::Timeout.to_string());
        assert_eq!(row.bytes, "4/16");
        assert_eq!(row.elapsed, "2.5s");
    }
}
