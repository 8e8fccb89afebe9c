//! Integration tests for the session bridge against an in-memory multiplexer

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use panebridge::backend::{BackendCatalog, LaunchOptions};
use panebridge::cache::MemoryReplyCache;
use panebridge::config::DispatchConfig;
use panebridge::dispatch::{marker, Dispatcher, TaskState};
use panebridge::error::BridgeError;
use panebridge::mux::{AdapterSet, MockMultiplexer};
use panebridge::notify::NoopNotifier;
use panebridge::probe::{ConnectivityProber, PingOutcome};
use panebridge::session::{MemorySessionStore, SessionKey, SessionRegistry};
use tokio_test::assert_ok;

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        reply_timeout_secs: 1,
        ping_timeout_secs: 1,
        watch_max_secs: 4,
        poll_initial_ms: 5,
        poll_max_ms: 25,
        send_retry_delay_ms: 1,
        ..DispatchConfig::default()
    }
}

fn bridge(mux: Arc<MockMultiplexer>) -> Dispatcher {
    let registry = SessionRegistry::new(
        AdapterSet::new().with(mux),
        Arc::new(MemorySessionStore::new()),
        BackendCatalog::default(),
    );
    Dispatcher::new(
        Arc::new(registry),
        Arc::new(MemoryReplyCache::new()),
        Arc::new(NoopNotifier),
        fast_config(),
    )
}

/// Test that repeated lookups reuse one pane
#[tokio::test]
async fn test_get_or_create_is_idempotent() {
    let mux = Arc::new(MockMultiplexer::new());
    let dispatcher = bridge(mux.clone());
    let dir = Path::new("/work/idempotent");

    let first = assert_ok!(dispatcher.registry().get_or_create("codex", dir).await);
    let second = assert_ok!(dispatcher.registry().get_or_create("codex", dir).await);

    assert_eq!(first.record.pane_id, second.record.pane_id);
    assert_eq!(mux.created_count(), 1);
}

/// Test that replies come back without any framing
#[tokio::test]
async fn test_reply_never_contains_markers() {
    let mux = Arc::new(MockMultiplexer::new().with_responder(|request| {
        Some(format!("line one\n{}\nline three", request.to_uppercase()))
    }));
    let dispatcher = bridge(mux);

    let reply = assert_ok!(
        dispatcher
            .send_sync("gemini", Path::new("/work/markers"), "summarize")
            .await
    );

    assert_eq!(reply, "line one\nSUMMARIZE\nline three");
    assert!(!marker::contains_marker(&reply));
}

/// Test that an async reply is only pending once it has arrived
#[tokio::test]
async fn test_async_reply_reaches_pending() {
    let mux = Arc::new(MockMultiplexer::echoing().with_reply_delay(Duration::from_millis(200)));
    let dispatcher = bridge(mux);
    let dir = Path::new("/work/async");

    let mut handle = assert_ok!(dispatcher.send_async("codex", dir, "review main.rs").await);
    assert!(assert_ok!(dispatcher.pending("codex", dir)).is_none());

    let task = handle.wait().await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.reply.as_deref(), Some("echo: review main.rs"));

    let cached = assert_ok!(dispatcher.pending("codex", dir)).expect("reply cached");
    assert_eq!(cached.text, "echo: review main.rs");
    assert_eq!(cached.task_id, handle.id());
}

/// Test that sequential sends each get their own reply
#[tokio::test]
async fn test_sequential_sends_do_not_interleave() {
    let mux = Arc::new(MockMultiplexer::echoing());
    let dispatcher = bridge(mux.clone());
    let dir = Path::new("/work/sequential");

    let first = assert_ok!(dispatcher.send_sync("codex", dir, "first question").await);
    let second = assert_ok!(dispatcher.send_sync("codex", dir, "second question").await);

    assert_eq!(first, "echo: first question");
    assert_eq!(second, "echo: second question");

    let session = assert_ok!(dispatcher.registry().resume("codex", dir).await);
    assert_eq!(mux.sent_texts(&session.handle()).len(), 2);
    let key = SessionKey::new("codex", dir);
    assert!(assert_ok!(dispatcher.registry().store().current_claim(&key)).is_none());
}

/// Test that a ping creates the session and leaves no pending reply
#[tokio::test]
async fn test_ping_creates_session_without_caching() {
    let mux = Arc::new(MockMultiplexer::echoing());
    let dispatcher = bridge(mux.clone());
    let dir = Path::new("/work/ping");
    let prober = ConnectivityProber::new(dispatcher.clone());

    let outcome = assert_ok!(prober.ping("gemini", dir).await);

    assert!(matches!(outcome, PingOutcome::Alive { .. }));
    assert_eq!(mux.created_count(), 1);
    assert!(assert_ok!(dispatcher.pending("gemini", dir)).is_none());
}

/// Test that a silent pane is reported unreachable
#[tokio::test]
async fn test_ping_silent_pane_is_unreachable() {
    let mux = Arc::new(MockMultiplexer::new());
    let prober = ConnectivityProber::new(bridge(mux));

    let outcome = assert_ok!(prober.ping("codex", Path::new("/work/silent")).await);
    assert!(!outcome.is_alive());
}

/// Test that shell errors in the pane surface as an environment mismatch
#[tokio::test]
async fn test_ping_reports_environment_mismatch() {
    let mux = Arc::new(MockMultiplexer::new());
    let dispatcher = bridge(mux.clone());
    let dir = Path::new("/work/mismatch");

    let session = assert_ok!(dispatcher.registry().get_or_create("codex", dir).await);
    mux.push_output(&session.handle(), "bash: codex: command not found\n");

    let result = ConnectivityProber::new(dispatcher).ping("codex", dir).await;
    match result {
        Err(BridgeError::EnvironmentMismatch { backend, detail }) => {
            assert_eq!(backend, "codex");
            assert!(detail.contains("command not found"));
        }
        other => panic!("expected environment mismatch, got {:?}", other),
    }
}

/// Test that a pane closed behind the bridge's back is recreated on send
#[tokio::test]
async fn test_send_recovers_from_external_kill() {
    let mux = Arc::new(MockMultiplexer::echoing());
    let dispatcher = bridge(mux.clone());
    let dir = Path::new("/work/killed");

    let original = assert_ok!(dispatcher.registry().get_or_create("codex", dir).await);
    mux.kill_externally(&original.handle());

    let reply = assert_ok!(dispatcher.send_sync("codex", dir, "still there?").await);
    assert_eq!(reply, "echo: still there?");

    let current = assert_ok!(dispatcher.registry().resume("codex", dir).await);
    assert_ne!(current.record.pane_id, original.record.pane_id);
    assert_eq!(mux.live_panes(), 1);
}

/// Test that resume without a record fails while start falls back to a launch
#[tokio::test]
async fn test_resume_without_record() {
    let mux = Arc::new(MockMultiplexer::new());
    let dispatcher = bridge(mux.clone());
    let registry = dispatcher.registry();
    let dir = Path::new("/work/resume");

    let missing = registry.resume("codex", dir).await;
    assert!(matches!(missing, Err(BridgeError::SessionNotFound { .. })));
    assert_eq!(mux.created_count(), 0);

    let options = LaunchOptions {
        resume: true,
        elevated: false,
    };
    let session = assert_ok!(registry.start("codex", dir, options).await);
    assert_eq!(
        mux.launch_command(&session.handle()).as_deref(),
        Some("codex resume --last")
    );

    // A second resume attaches to the pane that is now recorded
    let again = assert_ok!(registry.start("codex", dir, options).await);
    assert_eq!(again.record.pane_id, session.record.pane_id);
    assert_eq!(mux.created_count(), 1);
}

/// Test that backends in one directory keep separate sessions and replies
#[tokio::test]
async fn test_backends_are_independent() {
    let mux = Arc::new(MockMultiplexer::echoing());
    let dispatcher = bridge(mux.clone());
    let dir = Path::new("/work/shared");

    assert_ok!(dispatcher.send_sync("codex", dir, "for codex").await);
    assert_ok!(dispatcher.send_sync("gemini", dir, "for gemini").await);

    let codex = assert_ok!(dispatcher.pending("codex", dir)).expect("codex reply");
    let gemini = assert_ok!(dispatcher.pending("gemini", dir)).expect("gemini reply");
    assert_eq!(codex.text, "echo: for codex");
    assert_eq!(gemini.text, "echo: for gemini");
    assert_eq!(mux.created_count(), 2);

    assert!(assert_ok!(dispatcher.registry().kill("codex", dir).await));
    assert_ok!(dispatcher.registry().resume("gemini", dir).await);
    assert_eq!(mux.live_panes(), 1);
}

/// Test that a reply arriving after the sync deadline still reaches pending
#[tokio::test]
async fn test_late_reply_is_cached_after_timeout() {
    let mux = Arc::new(MockMultiplexer::echoing().with_reply_delay(Duration::from_millis(1500)));
    let dispatcher = bridge(mux);
    let dir = Path::new("/work/late");

    let result = dispatcher.send_sync("codex", dir, "take your time").await;
    assert!(matches!(result, Err(BridgeError::ReplyTimeout { .. })));
    assert!(assert_ok!(dispatcher.pending("codex", dir)).is_none());

    let key = SessionKey::new("codex", dir);
    let mut cached = None;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cached = assert_ok!(dispatcher.pending("codex", dir));
        if cached.is_some() {
            break;
        }
    }
    assert_eq!(cached.map(|c| c.text).as_deref(), Some("echo: take your time"));

    // The background watch lets go of the session once it is done
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(assert_ok!(dispatcher.registry().store().current_claim(&key)).is_none());
}

/// Test that an unavailable multiplexer fails without creating anything
#[tokio::test]
async fn test_unavailable_multiplexer_is_reported() {
    let mux = Arc::new(MockMultiplexer::echoing());
    mux.set_unavailable(true);
    let dispatcher = bridge(mux.clone());

    let result = dispatcher
        .send_sync("codex", Path::new("/work/offline"), "hello")
        .await;
    assert!(matches!(result, Err(BridgeError::BackendUnavailable { .. })));
    assert_eq!(mux.created_count(), 0);
}
