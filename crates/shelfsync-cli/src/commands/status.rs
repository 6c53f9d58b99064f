//! Status command handler

use anyhow::Result;

use shelfsync_core::{Config, SyncSession};

use crate::output::Output;

/// Show session status from local state only
pub fn show(session: &SyncSession, config: &Config, output: &Output) -> Result<()> {
    let snapshot = session.snapshot();
    output.print_snapshot(&snapshot, config.api_url.as_deref());
    Ok(())
}
