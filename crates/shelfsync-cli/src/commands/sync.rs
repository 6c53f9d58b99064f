//! Sync command handlers

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use shelfsync_core::sync::StopReason;
use shelfsync_core::{Config, Orchestrator, SyncError, SyncSession, Transport};

use crate::http::HttpTransport;
use crate::output::Output;

/// Build the HTTP transport, refusing when sync is not configured
pub fn transport_for(config: &Config) -> Result<Arc<dyn Transport>> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             shelfsync config set sync_enabled true\n  \
             shelfsync config set api_url https://your-server/api"
        );
    }

    let Some(ref api_url) = config.api_url else {
        bail!(
            "API URL not configured. Set it with:\n  \
             shelfsync config set api_url https://your-server/api"
        );
    };

    let transport = HttpTransport::new(api_url, config.sync.request_timeout())?;
    Ok(Arc::new(transport))
}

/// One-shot sync: probe, drain the queue, then refresh every family
pub async fn sync(session: Arc<SyncSession>, config: &Config, output: &Output) -> Result<()> {
    let transport = transport_for(config)?;
    run_once(session, transport, output).await
}

async fn run_once(
    session: Arc<SyncSession>,
    transport: Arc<dyn Transport>,
    output: &Output,
) -> Result<()> {
    output.message("Checking server...");
    session.monitor().probe(transport.as_ref()).await;
    session.refresh_status();

    let pending = session.pending().len();
    if pending > 0 {
        output.message(&format!("Sending {} queued change(s)...", pending));
    }

    let orchestrator = Orchestrator::new(session.clone(), transport);
    let report = orchestrator.drain(&CancellationToken::new()).await;

    let refreshed = match report.stopped {
        Some(StopReason::Unreachable) | Some(StopReason::Offline) => {
            output.print_report(&report, None);
            bail!(
                "Server unreachable; {} change(s) remain queued",
                session.pending().len()
            );
        }
        Some(StopReason::AuthRequired) => {
            output.print_report(&report, None);
            bail!("Server requires authentication; changes remain queued");
        }
        _ => match orchestrator.refresh_all().await {
            Ok(count) => Some(count),
            Err(SyncError::Auth { status }) => {
                output.print_report(&report, None);
                bail!("Server requires authentication (HTTP {})", status);
            }
            Err(e) => {
                output.print_report(&report, None);
                return Err(e).context("Refresh failed");
            }
        },
    };

    output.print_report(&report, refreshed);

    let parked = session.parked().len();
    if parked > 0 {
        output.message(&format!(
            "{} change(s) gave up after repeated failures. See `shelfsync queue`.",
            parked
        ));
    } else {
        output.success("Sync complete");
    }

    info!("One-shot sync finished: {:?}", report);
    Ok(())
}

/// Keep syncing until Ctrl-C, printing diagnostics as they happen
pub async fn watch(session: Arc<SyncSession>, config: &Config, output: &Output) -> Result<()> {
    let transport = transport_for(config)?;
    let mut events = session
        .take_events()
        .context("Event stream already taken")?;

    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(Orchestrator::new(session.clone(), transport.clone()));
    let monitor = tokio::spawn(session.monitor().clone().run(transport, cancel.clone()));
    let runner = tokio::spawn(orchestrator.run(cancel.clone()));

    output.message("Watching for changes (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => output.print_event(&event),
                None => break,
            },
        }
    }

    cancel.cancel();
    let _ = tokio::join!(monitor, runner);

    let snapshot = session.snapshot();
    output.message(&format!(
        "Stopped. {} pending, {} parked.",
        snapshot.pending, snapshot.parked
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use shelfsync_core::{
        Connectivity, DeviceId, ManualClock, MemoryStorage, Method, Response, SyncTuning,
        TransportError,
    };

    use crate::output::OutputFormat;

    /// Accepts every mutation and serves empty lists
    struct AcceptAll;

    #[async_trait]
    impl Transport for AcceptAll {
        async fn send(
            &self,
            method: Method,
            _path: &str,
            _body: Option<Value>,
        ) -> Result<Response, TransportError> {
            match method {
                Method::Get => Ok(Response::ok(json!([]))),
                _ => Ok(Response::no_content()),
            }
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn send(
            &self,
            _method: Method,
            _path: &str,
            _body: Option<Value>,
        ) -> Result<Response, TransportError> {
            Err(TransportError::Network("connection refused".to_string()))
        }
    }

    fn session() -> Arc<SyncSession> {
        Arc::new(
            SyncSession::open(
                Arc::new(MemoryStorage::new()),
                DeviceId::new("device-cli"),
                Arc::new(ManualClock::new(1_700_000_000_000)),
                SyncTuning::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_transport_requires_configuration() {
        let mut config = Config {
            data_dir: PathBuf::from("/tmp/shelfsync-cli-test"),
            ..Config::default()
        };
        assert!(transport_for(&config).is_err());

        config.sync_enabled = true;
        assert!(transport_for(&config).is_err());

        config.api_url = Some("http://127.0.0.1:9".to_string());
        assert!(transport_for(&config).is_ok());
    }

    #[tokio::test]
    async fn test_run_once_drains_queue() {
        let session = session();
        session.record_reading("b1", "c1");
        session.record_reading("b2", "c4");

        let output = Output::new(OutputFormat::Quiet);
        run_once(session.clone(), Arc::new(AcceptAll), &output)
            .await
            .unwrap();

        assert!(session.pending().is_empty());
        assert_eq!(session.connectivity(), Connectivity::Online);
    }

    #[tokio::test]
    async fn test_run_once_unreachable_keeps_queue() {
        let session = session();
        session.record_reading("b1", "c1");

        let output = Output::new(OutputFormat::Quiet);
        let result = run_once(session.clone(), Arc::new(Unreachable), &output).await;

        assert!(result.is_err());
        assert_eq!(session.pending().len(), 1);
    }
}
