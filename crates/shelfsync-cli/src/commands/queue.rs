//! Queue command handler

use anyhow::Result;

use shelfsync_core::SyncSession;

use crate::output::Output;

/// List mutations that have not been confirmed by the server
pub fn list(session: &SyncSession, output: &Output) -> Result<()> {
    output.print_queue(&session.pending(), &session.parked());
    Ok(())
}
