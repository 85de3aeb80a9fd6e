use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use ap_agents::engine::{EngineError, EngineMessage, MessageStream, ReasoningEngine, SessionRequest};
use ap_core::config::Config;
use ap_core::session_store::SessionStore;
use ap_core::tracker::NoopTracker;
use ap_core::types::{SessionRecord, SessionStatus};
use ap_daemon::daemon::Daemon;

/// Answers every session with an init, one line of text and a result.
#[derive(Default)]
struct EchoEngine {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl ReasoningEngine for EchoEngine {
    async fn open(&self, request: SessionRequest) -> Result<MessageStream, EngineError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let (tx, rx) = flume::unbounded();
        let items = [
            EngineMessage::SessionInit {
                session_id: "sess-echo".into(),
            },
            EngineMessage::AssistantText {
                text: "working on it".into(),
            },
            EngineMessage::Result {
                summary: Some("done".into()),
                is_error: false,
                session_id: Some("sess-echo".into()),
            },
        ];
        for item in items {
            tx.send(Ok(item)).unwrap();
        }
        Ok(rx)
    }
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.daemon.data_dir = Some(dir.path().display().to_string());
    config.queue.workers = 1;
    config.queue.poll_interval_ms = 10;
    config.queue.idle_interval_ms = 10;
    config
}

#[tokio::test]
async fn task_flows_from_api_to_session_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let sessions_dir = config.sessions_dir();
    let engine = Arc::new(EchoEngine::default());

    let daemon = Arc::new(
        Daemon::with_components(config, engine.clone(), Arc::new(NoopTracker))
            .await
            .unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = daemon.shutdown_handle();
    let runner = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let resp = client
        .post(format!("{base}/api/tasks"))
        .json(&json!({"issue_id": "ENG-100", "title": "Add retries", "tags": ["feature"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status: Value = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["completed_count"] == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never completed: {status}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let prompts = engine.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Add retries"));

    let record = SessionStore::new(&sessions_dir)
        .load("ENG-100")
        .unwrap()
        .expect("session record written");
    assert_eq!(record.session_id, "sess-echo");
    assert_eq!(record.status, SessionStatus::Completed);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // State file survives for the next start.
    assert!(dir.path().join("queue-state.json").exists());
}

#[tokio::test]
async fn pending_work_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(EchoEngine::default());

    {
        let daemon = Daemon::with_components(test_config(&dir), engine.clone(), Arc::new(NoopTracker))
            .await
            .unwrap();
        daemon.queue().pause();
        daemon
            .queue()
            .enqueue(ap_core::types::Task::new("ENG-7", "Persist me"))
            .await
            .unwrap();
    }

    let daemon = Daemon::with_components(test_config(&dir), engine, Arc::new(NoopTracker))
        .await
        .unwrap();
    let status = daemon.queue().status().await;
    assert_eq!(status.pending_count, 1);
}

#[tokio::test]
async fn idle_session_records_are_pruned_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.agents.session_retention_days = 7;
    let store = SessionStore::new(config.sessions_dir());

    let mut stale = SessionRecord::new("ENG-OLD");
    stale.last_activity_at = chrono::Utc::now() - chrono::Duration::days(30);
    store.save(&stale).unwrap();
    store.save(&SessionRecord::new("ENG-NEW")).unwrap();

    let daemon = Arc::new(
        Daemon::with_components(config, Arc::new(EchoEngine::default()), Arc::new(NoopTracker))
            .await
            .unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = daemon.shutdown_handle();
    let runner = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.load("ENG-OLD").unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "stale record never pruned");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(store.load("ENG-NEW").unwrap().is_some());

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[test]
fn tracker_defaults_to_noop_without_key() {
    let mut config = Config::default();
    config.integrations.linear_api_key_env = "AP_DAEMON_TEST_UNSET_LINEAR_KEY".into();
    assert!(ap_daemon::daemon::build_tracker(&config).is_ok());
}
