//! Apply loop against in-process and recorded event sources.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runscope::aggregator::{Change, Notification};
use runscope::config::RunscopeConfig;
use runscope::events::{self, PushEvent, RawMessage, ReplayEventSource};
use runscope::model::{ProtocolEntry, ProtocolId, RunId, TestProtocol, TestResultState, TestRun};
use runscope::session::{refresh_protocol, run_apply_loop, FetchOutcome};
use runscope::snapshot::{
    FileSnapshotLoader, ProtocolSnapshot, RunSnapshot, SnapshotError, SnapshotLoader,
};
use runscope::{replay, shared_session, ReplayOptions};
use tokio_util::sync::CancellationToken;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Serves one in-memory run; can be told to fail.
struct MemoryLoader {
    run: TestRun,
    fail: bool,
    protocol_calls: AtomicUsize,
}

impl MemoryLoader {
    fn new(run: TestRun) -> Self {
        Self {
            run,
            fail: false,
            protocol_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotLoader for MemoryLoader {
    async fn load_run(&self, run_id: RunId) -> Result<RunSnapshot, SnapshotError> {
        if self.fail || run_id != self.run.id {
            return Err(SnapshotError::Status {
                url: format!("memory://run/{}", run_id),
                status: 500,
            });
        }
        Ok(RunSnapshot::new(self.run.clone()))
    }

    async fn load_protocol(
        &self,
        _run_id: RunId,
        protocol_id: ProtocolId,
    ) -> Result<ProtocolSnapshot, SnapshotError> {
        self.protocol_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProtocolSnapshot {
            protocols: vec![TestProtocol {
                id: protocol_id,
                test_run_id: self.run.id,
                history: vec![TestProtocol {
                    id: 1,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }
}

fn run_with_root(run_id: RunId) -> TestRun {
    TestRun {
        id: run_id,
        protocols: vec![TestProtocol {
            id: 100,
            test_run_id: run_id,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn protocol_event(run_id: RunId, id: u64, parent: u64, result: TestResultState) -> RawMessage {
    PushEvent::Protocol {
        run_id,
        protocol: TestProtocol {
            id,
            test_run_id: run_id,
            parent_test_protocol_id: Some(parent),
            test_result: result,
            ..Default::default()
        },
    }
    .to_raw()
}

#[tokio::test]
async fn test_loop_applies_channel_events() {
    let config = RunscopeConfig::default();
    let session = shared_session(&config);
    let (publisher, mut source) = events::channel(16);
    let loader = Arc::new(MemoryLoader::new(run_with_root(5)));

    publisher
        .publish(protocol_event(5, 101, 100, TestResultState::Open))
        .await
        .unwrap();
    publisher
        .publish(
            PushEvent::ProtocolLog {
                protocol_id: 101,
                entry: serde_json::from_value::<ProtocolEntry>(
                    serde_json::json!({"id": 1, "source": "step", "message": "tap"}),
                )
                .unwrap(),
            }
            .to_raw(),
        )
        .await
        .unwrap();
    publisher
        .publish(protocol_event(5, 101, 100, TestResultState::Success))
        .await
        .unwrap();
    publisher
        .publish(RawMessage {
            topic: "test_run_5_log".to_string(),
            payload: serde_json::json!({"testRunId": 5, "entry": null}),
        })
        .await
        .unwrap();
    drop(publisher);

    let summary = run_apply_loop(
        session.clone(),
        5,
        loader,
        &mut source,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.fetch, FetchOutcome::Seeded);
    assert_eq!(summary.applied, 3);
    assert_eq!(summary.malformed, 1);

    let guard = session.read().await;
    let agg = guard.aggregator().unwrap();
    let stats = agg.statistics();
    assert_eq!((stats.open, stats.success), (1, 1));
    assert_eq!(agg.protocol(101).unwrap().entries.len(), 1);
    assert_eq!(agg.protocol_forest()[0].children[0].id(), 101);
}

#[tokio::test]
async fn test_failed_snapshot_leaves_session_unseeded() {
    let config = RunscopeConfig::default();
    let session = shared_session(&config);
    let (publisher, mut source) = events::channel(4);
    let mut loader = MemoryLoader::new(run_with_root(5));
    loader.fail = true;

    publisher
        .publish(protocol_event(5, 101, 100, TestResultState::Open))
        .await
        .unwrap();

    let summary = run_apply_loop(
        session.clone(),
        5,
        Arc::new(loader),
        &mut source,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.fetch, FetchOutcome::Failed);
    assert_eq!(summary.applied, 0);
    let guard = session.read().await;
    assert!(guard.aggregator().is_none());
    assert_eq!(guard.notices(chrono::Utc::now()).len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_idle_loop() {
    let config = RunscopeConfig::default();
    let session = shared_session(&config);
    let (_publisher, mut source) = events::channel(4);
    let loader = Arc::new(MemoryLoader::new(run_with_root(5)));
    let shutdown = CancellationToken::new();

    let handle = {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_apply_loop(session, 5, loader, &mut source, shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert_eq!(summary.fetch, FetchOutcome::Seeded);
    assert_eq!(summary.applied, 0);
}

#[tokio::test]
async fn test_refresh_merges_protocol_history() {
    let config = RunscopeConfig::default();
    let session = shared_session(&config);
    let (publisher, mut source) = events::channel(4);
    let loader = Arc::new(MemoryLoader::new(run_with_root(5)));
    drop(publisher);

    run_apply_loop(
        session.clone(),
        5,
        loader.clone(),
        &mut source,
        CancellationToken::new(),
    )
    .await;

    let applied = refresh_protocol(&session, loader.as_ref(), 100).await.unwrap();
    assert_eq!(applied, 1);
    assert_eq!(loader.protocol_calls.load(Ordering::SeqCst), 1);
    let guard = session.read().await;
    assert_eq!(
        guard.aggregator().unwrap().protocol(100).unwrap().history.len(),
        1
    );
}

#[tokio::test]
async fn test_replay_fixture_stream() {
    let loader = Arc::new(FileSnapshotLoader::new(fixture("run_42.json")));
    let session = shared_session(&RunscopeConfig::default());
    let mut source = ReplayEventSource::open(&fixture("events_42.jsonl"))
        .await
        .unwrap();

    let summary = run_apply_loop(
        session.clone(),
        42,
        loader,
        &mut source,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.applied, 5);
    assert_eq!(summary.unchanged, 2);
    assert_eq!(summary.ignored, 0);
    assert_eq!(summary.malformed, 1);
    assert_eq!(source.skipped(), 1);

    let guard = session.read().await;
    let agg = guard.aggregator().unwrap();
    assert_eq!(agg.run().log.len(), 2);
    assert_eq!(agg.protocol(421).unwrap().entries.len(), 1);
    assert_eq!(agg.protocol(420).unwrap().device.as_ref().unwrap().status, 2);
    assert_eq!(guard.neighbours().prev_run_id, Some(41));
}

#[tokio::test]
async fn test_replay_report() {
    let report = replay(
        &RunscopeConfig::default(),
        ReplayOptions {
            snapshot: fixture("run_42.json"),
            events: fixture("events_42.jsonl"),
            run_id: None,
            on_change: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(report.run_id, 42);
    assert_eq!(report.statistics.open, 1);
    assert_eq!(report.statistics.success, 1);
    assert_eq!(report.statistics.total, 2);
    assert!(!report.settled);
    assert_eq!(report.forest.len(), 1);
    assert_eq!(report.forest[0].children[0].id(), 421);
    assert!(report.orphans.is_empty());
    assert_eq!(report.startup_times[0].device_name, "Galaxy S21");
    assert_eq!(report.startup_times[0].delta, Some(400));
}

#[tokio::test]
async fn test_replay_listener_sees_seed_first() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let report = replay(
        &RunscopeConfig::default(),
        ReplayOptions {
            snapshot: fixture("run_42.json"),
            events: fixture("events_42.jsonl"),
            run_id: None,
            on_change: Some(Arc::new(move |n: &Notification| {
                sink.lock().unwrap().push(n.clone())
            })),
        },
    )
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1 + report.events.applied);
    assert_eq!(seen[0].change, Change::Seeded);
    assert_eq!(seen[0].version, 1);
    assert_eq!(seen.last().unwrap().version, report.version);
}

#[tokio::test]
async fn test_replay_with_wrong_run_fails() {
    let result = replay(
        &RunscopeConfig::default(),
        ReplayOptions {
            snapshot: fixture("run_42.json"),
            events: fixture("events_42.jsonl"),
            run_id: Some(7),
            on_change: None,
        },
    )
    .await;
    assert!(result.is_err());
}
