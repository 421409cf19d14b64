//! runscope -- live test-run telemetry aggregator.
//!
//! Seeds the state of one device test run from a snapshot, folds in the
//! hub's push notifications as they arrive, and serves derived views
//! (statistics, protocol forest, performance deltas) to a dashboard.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod events;
pub mod logging;
pub mod model;
pub mod perf;
pub mod session;
pub mod snapshot;
pub mod summary;
pub mod tree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Listener, RunStatistics};
use crate::config::RunscopeConfig;
use crate::events::ReplayEventSource;
use crate::model::{ProtocolId, RunId, TestResultState};
use crate::perf::StartupTime;
use crate::session::{run_apply_loop, FetchOutcome, LoopSummary, Notice, RunSession, SharedSession};
use crate::snapshot::{FileSnapshotLoader, HttpSnapshotLoader, SnapshotLoader};
use crate::tree::ProtocolNode;

/// Pick the snapshot source: a local file or directory when given, the hub
/// otherwise.
pub fn snapshot_loader(
    config: &RunscopeConfig,
    snapshot: Option<&Path>,
) -> Result<Arc<dyn SnapshotLoader>> {
    match snapshot {
        Some(path) => Ok(Arc::new(FileSnapshotLoader::new(path))),
        None => {
            let loader = HttpSnapshotLoader::new(config.hub.clone())
                .context("failed to build hub HTTP client")?;
            Ok(Arc::new(loader))
        }
    }
}

pub fn shared_session(config: &RunscopeConfig) -> SharedSession {
    Arc::new(RwLock::new(RunSession::from_config(config)))
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

/// Follow `run_id` and serve the read API on `bind` until Ctrl-C.
pub async fn serve(
    config: &RunscopeConfig,
    bind: &str,
    run_id: RunId,
    loader: Arc<dyn SnapshotLoader>,
) -> Result<()> {
    let session = shared_session(config);
    let (publisher, mut source) = events::channel(config.session.event_buffer);
    let shutdown = CancellationToken::new();

    // 1. Apply loop
    let apply = {
        let session = session.clone();
        let loader = loader.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_apply_loop(session, run_id, loader, &mut source, shutdown).await
        })
    };

    // 2. Notice expiry
    {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        session.write().await.prune_notices(chrono::Utc::now());
                    }
                }
            }
        });
    }

    // 3. Read API
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", bind))?;
    let app = api::router(api::state::AppState {
        session,
        publisher,
        loader,
    });

    tracing::info!(%addr, run_id, "runscope listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("API server failed")?;

    shutdown.cancel();
    let summary = apply.await.context("apply loop panicked")?;
    tracing::info!(
        applied = summary.applied,
        ignored = summary.ignored,
        "runscope stopped"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

pub struct ReplayOptions {
    /// Run snapshot file, or a directory of `run_{id}.json` files.
    pub snapshot: PathBuf,
    /// Recorded push stream, one raw message per line.
    pub events: PathBuf,
    /// Required when `snapshot` is a directory.
    pub run_id: Option<RunId>,
    /// Called for every change while the stream is applied.
    pub on_change: Option<Listener>,
}

/// Final view after a replay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub run_id: RunId,
    pub result: TestResultState,
    pub events: LoopSummary,
    pub skipped_lines: usize,
    pub statistics: RunStatistics,
    pub settled: bool,
    pub forest: Vec<ProtocolNode>,
    pub orphans: Vec<ProtocolId>,
    pub startup_times: Vec<StartupTime>,
    pub version: u64,
}

/// Seed from a snapshot file, apply a recorded event stream, and report the
/// resulting state.
pub async fn replay(config: &RunscopeConfig, options: ReplayOptions) -> Result<ReplayReport> {
    let file_loader = FileSnapshotLoader::new(&options.snapshot);
    let run_id = match options.run_id {
        Some(id) => id,
        None => file_loader
            .peek_run_id()
            .await
            .with_context(|| format!("cannot determine run id from {}", options.snapshot.display()))?,
    };

    let mut source = ReplayEventSource::open(&options.events)
        .await
        .with_context(|| format!("failed to open event stream {}", options.events.display()))?;

    let session = shared_session(config);
    if let Some(listener) = options.on_change {
        session.write().await.on_change(listener);
    }

    let summary = run_apply_loop(
        session.clone(),
        run_id,
        Arc::new(file_loader),
        &mut source,
        CancellationToken::new(),
    )
    .await;

    let session = session.read().await;
    if summary.fetch != FetchOutcome::Seeded {
        let reason = session
            .notices(chrono::Utc::now())
            .into_iter()
            .map(|n: Notice| n.message)
            .next()
            .unwrap_or_else(|| "snapshot was not applied".to_string());
        bail!("replay of run {} failed: {}", run_id, reason);
    }
    let Some(aggregator) = session.aggregator() else {
        bail!("replay of run {} ended without run state", run_id);
    };

    Ok(ReplayReport {
        run_id,
        result: aggregator.run().test_result,
        events: summary,
        skipped_lines: source.skipped(),
        statistics: aggregator.statistics(),
        settled: aggregator.statistics().is_settled(),
        forest: aggregator.protocol_forest(),
        orphans: aggregator.orphans(),
        startup_times: aggregator.startup_times(),
        version: aggregator.version(),
    })
}
