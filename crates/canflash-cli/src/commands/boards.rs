//! Boards command - show the catalog

use anyhow::{Context, Result};
use canflash_core::FlashConfig;
use serde_json::json;

use crate::output::{BoardRow, GroupRow, OutputContext, OutputFormat};

/// List configured boards and groups
pub fn boards(config: &FlashConfig, ctx: &OutputContext) -> Result<()> {
    let targets = config
        .resolve_targets(&[])
        .context("Failed to resolve board catalog")?;
    let rows: Vec<BoardRow> = targets.iter().map(BoardRow::from).collect();
    let groups: Vec<GroupRow> = config
        .groups
        .iter()
        .map(|(name, members)| GroupRow {
            name: name.clone(),
            boards: members.join(", "),
        })
        .collect();

    match ctx.format {
        OutputFormat::Table => {
            ctx.print(&rows);
            if !groups.is_empty() {
                ctx.info("");
                ctx.print(&groups);
            }
        }
        OutputFormat::Json => ctx.print_json(&json!({ "boards": rows, "groups": groups })),
    }

    Ok(())
}
