use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};
use dialoguer::Confirm;

/// Ask before upgrading a restored store. Non-interactive callers must pass
/// `--yes` instead.
pub fn confirm_restore(database: &Path) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        println!("Non-interactive environment detected.");
        println!("Re-run with --yes to upgrade {} after a restore.", database.display());
        return Ok(false);
    }

    println!();
    println!("  The restored store at {} will be upgraded", database.display());
    println!("  before any other service may open it.");
    println!();

    Confirm::new()
        .with_prompt("Upgrade the restored store now?")
        .default(true)
        .interact()
        .context("restore confirmation cancelled")
}
