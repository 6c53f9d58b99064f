//! Retry command handler

use anyhow::Result;

use shelfsync_core::SyncSession;

use crate::output::Output;

/// Re-arm parked mutations, or drop them with `--discard`
pub fn retry(session: &SyncSession, discard: bool, output: &Output) -> Result<()> {
    if discard {
        let dropped = session.discard_parked();
        if dropped == 0 {
            output.message("No parked changes.");
        } else {
            output.success(&format!("Discarded {} parked change(s)", dropped));
        }
        return Ok(());
    }

    let rearmed = session.retry_parked();
    if rearmed == 0 {
        output.message("No parked changes.");
    } else {
        output.success(&format!(
            "Re-queued {} change(s); they will be sent on the next sync",
            rearmed
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shelfsync_core::{DeviceId, ManualClock, MemoryStorage, SyncTuning};

    use crate::output::OutputFormat;

    fn session() -> SyncSession {
        SyncSession::open(
            Arc::new(MemoryStorage::new()),
            DeviceId::new("device-test"),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            SyncTuning::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_retry_with_nothing_parked() {
        let session = session();
        session.update_position("b1", "c1", 0, 0.1);
        let output = Output::new(OutputFormat::Quiet);

        retry(&session, false, &output).unwrap();
        retry(&session, true, &output).unwrap();

        // Pending work is untouched
        assert_eq!(session.pending().len(), 1);
    }
}
