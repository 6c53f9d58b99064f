//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use shelfsync_core::sync::StopReason;
use shelfsync_core::{DrainReport, MutationRecord, SessionSnapshot, SyncEvent};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a session summary
    pub fn print_snapshot(&self, snapshot: &SessionSnapshot, api_url: Option<&str>) {
        match self.format {
            OutputFormat::Human => {
                println!("Shelfsync Status");
                println!("================");
                println!();
                println!("Device:       {}", snapshot.device_id);
                println!("Server:       {}", api_url.unwrap_or("(not set)"));
                println!("Status:       {}", snapshot.status);
                println!("Connectivity: {}", snapshot.connectivity);
                if let Some(status) = snapshot.auth_required {
                    println!("Auth:         required (HTTP {})", status);
                }
                if snapshot.storage_degraded {
                    println!("Storage:      degraded, changes held in memory");
                }
                println!();
                println!("Queue:");
                println!("  Pending: {}", snapshot.pending);
                for (kind, count) in &snapshot.pending_by_kind {
                    println!("    {:<10} {}", kind, count);
                }
                println!("  Parked:  {}", snapshot.parked);
                println!();
                println!("Local entities:");
                for (kind, count) in &snapshot.entities {
                    println!("  {:<10} {}", kind, count);
                }
            }
            OutputFormat::Json => print_json(snapshot),
            OutputFormat::Quiet => println!("{}", snapshot.status),
        }
    }

    /// Print queued mutations, pending first then parked
    pub fn print_queue(&self, pending: &[MutationRecord], parked: &[MutationRecord]) {
        match self.format {
            OutputFormat::Human => {
                if pending.is_empty() && parked.is_empty() {
                    println!("Queue is empty.");
                    return;
                }
                if !pending.is_empty() {
                    println!("── Pending ({}) ──", pending.len());
                    for record in pending {
                        println!("{}", format_record(record));
                    }
                }
                if !parked.is_empty() {
                    if !pending.is_empty() {
                        println!();
                    }
                    println!("── Parked ({}) ──", parked.len());
                    for record in parked {
                        println!("{}", format_record(record));
                    }
                    println!();
                    println!("Retry with `shelfsync retry` or drop with `shelfsync retry --discard`.");
                }
            }
            OutputFormat::Json => {
                print_json(&serde_json::json!({ "pending": pending, "parked": parked }));
            }
            OutputFormat::Quiet => {
                for record in pending.iter().chain(parked) {
                    println!("{}", record.id);
                }
            }
        }
    }

    /// Print the outcome of a drain pass
    pub fn print_report(&self, report: &DrainReport, refreshed: Option<usize>) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "Sent {}, acknowledged {}, retrying {}, parked {}, rejected {}",
                    report.sent, report.acked, report.retried, report.parked, report.rejected
                );
                if let Some(count) = refreshed {
                    println!("Refreshed {} entities from the server", count);
                }
                if let Some(reason) = report.stopped {
                    println!("Stopped early: {}", describe_stop(reason));
                }
            }
            OutputFormat::Json => {
                print_json(&serde_json::json!({ "drain": report, "refreshed": refreshed }));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print one diagnostic event as it arrives
    pub fn print_event(&self, event: &SyncEvent) {
        match self.format {
            OutputFormat::Human => println!("• {}", describe_event(event)),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": event_name(event),
                        "message": describe_event(event),
                        "error": event.error().map(|e| e.to_string())
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn format_record(record: &MutationRecord) -> String {
    let id = record.id.to_string();
    let mut line = format!(
        "{} | {:<9} | {:<6} | {}",
        &id[..8],
        record.entity_kind,
        record.op,
        truncate(&record.entity_key, 30)
    );
    if record.attempts > 0 {
        line.push_str(&format!(" | attempts: {}", record.attempts));
    }
    if let Some(ref error) = record.last_error {
        line.push_str(&format!(" | {}", truncate(error, 40)));
    }
    line
}

fn describe_stop(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Cancelled => "cancelled",
        StopReason::Offline => "offline",
        StopReason::Unreachable => "server unreachable, changes stay queued",
        StopReason::AuthRequired => "authentication required",
    }
}

fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::LostUpdate { .. } => "lost_update",
        SyncEvent::SyncConflict { .. } => "sync_conflict",
        SyncEvent::QueueOverflow { .. } => "queue_overflow",
        SyncEvent::StorageRecovered { .. } => "storage_recovered",
        SyncEvent::AuthRequired { .. } => "auth_required",
        SyncEvent::RetryScheduled { .. } => "retry_scheduled",
        SyncEvent::RetryExhausted { .. } => "retry_exhausted",
        SyncEvent::IdRemapped { .. } => "id_remapped",
        SyncEvent::ConnectivityChanged(_) => "connectivity_changed",
        SyncEvent::StatusChanged(_) => "status_changed",
    }
}

/// One-line human description of an event
pub fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::LostUpdate { kind, key, dropped } => format!(
            "{} '{}' was changed elsewhere; {} local change(s) discarded",
            kind,
            key,
            dropped.len()
        ),
        SyncEvent::SyncConflict {
            kind, key, message, ..
        } => format!("{} '{}' rejected: {}", kind, key, message),
        SyncEvent::QueueOverflow { namespace, message } => {
            format!("storage full for {}, keeping changes in memory: {}", namespace, message)
        }
        SyncEvent::StorageRecovered { namespace } => {
            format!("storage for {} is writable again", namespace)
        }
        SyncEvent::AuthRequired { status } => {
            format!("server requires authentication (HTTP {})", status)
        }
        SyncEvent::RetryScheduled {
            mutation_id,
            attempts,
            delay_ms,
        } => format!(
            "retrying {} in {:.1}s (attempt {})",
            short_id(&mutation_id.to_string()),
            *delay_ms as f64 / 1000.0,
            attempts
        ),
        SyncEvent::RetryExhausted {
            mutation_id,
            attempts,
        } => format!(
            "gave up on {} after {} attempts",
            short_id(&mutation_id.to_string()),
            attempts
        ),
        SyncEvent::IdRemapped { old, new, .. } => format!("bookmark {} is now {}", old, new),
        SyncEvent::ConnectivityChanged(connectivity) => format!("connectivity: {}", connectivity),
        SyncEvent::StatusChanged(status) => format!("status: {}", status),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfsync_core::{Connectivity, EntityKind, MutationOp, SyncStatus};
    use uuid::Uuid;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_format_record() {
        let mut record = MutationRecord::new(
            EntityKind::Progress,
            "book-1",
            MutationOp::Update,
            serde_json::Value::Null,
            0,
        );
        let line = format_record(&record);
        assert!(line.contains("progress"));
        assert!(line.contains("book-1"));
        assert!(!line.contains("attempts"));

        record.attempts = 2;
        record.last_error = Some("HTTP 503".to_string());
        let line = format_record(&record);
        assert!(line.contains("attempts: 2"));
        assert!(line.ends_with("HTTP 503"));
    }

    #[test]
    fn test_describe_event() {
        let lost = SyncEvent::LostUpdate {
            kind: EntityKind::Bookshelf,
            key: "b1".to_string(),
            dropped: vec![Uuid::new_v4()],
        };
        assert_eq!(
            describe_event(&lost),
            "bookshelf 'b1' was changed elsewhere; 1 local change(s) discarded"
        );
        assert_eq!(event_name(&lost), "lost_update");

        let remap = SyncEvent::IdRemapped {
            old: "tmp-1".to_string(),
            new: "bm-9".to_string(),
            rewritten: 2,
        };
        assert_eq!(describe_event(&remap), "bookmark tmp-1 is now bm-9");

        assert_eq!(
            describe_event(&SyncEvent::ConnectivityChanged(Connectivity::Offline)),
            "connectivity: offline"
        );
        assert_eq!(
            describe_event(&SyncEvent::StatusChanged(SyncStatus::Syncing)),
            "status: syncing"
        );
    }
}
