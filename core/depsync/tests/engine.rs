//! End-to-end tests for the enrollment sync engine.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use fleetd_common::{Error, Result};
use fleetd_depsync::{
    Call, ClientError, Cursor, CursorStore, DepDevice, DepSyncer, DeviceResponse, Phase,
    ScriptedClient, SyncConfig, SyncEvent, SYNC_TOPIC,
};
use fleetd_pubsub::{EventBus, Publisher};
use fleetd_storage::{KvStore, MemoryStore, ReadTxn, SqliteStore, WriteTxn};

fn device(serial: &str) -> DepDevice {
    DepDevice {
        serial_number: serial.to_string(),
        model: "MacBook Pro".to_string(),
        ..Default::default()
    }
}

fn page(cursor: &str, serials: &[&str], more_to_follow: bool) -> DeviceResponse {
    DeviceResponse {
        devices: serials.iter().map(|s| device(s)).collect(),
        cursor: cursor.to_string(),
        more_to_follow,
        fetched_until: Some(Utc::now()),
    }
}

fn config() -> SyncConfig {
    SyncConfig::default().with_sync_interval(Duration::from_secs(3600))
}

fn fetch(cursor: &str) -> Call {
    Call::Fetch {
        cursor: cursor.to_string(),
        limit: 100,
    }
}

fn sync(cursor: &str) -> Call {
    Call::Sync {
        cursor: cursor.to_string(),
    }
}

struct FailingPublisher;

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, _topic: &str, _message: Vec<u8>) -> Result<()> {
        Err(Error::Publish("broker unavailable".to_string()))
    }
}

/// A store whose write transactions can be switched off.
#[derive(Default)]
struct ReadOnlyStore {
    inner: MemoryStore,
    reject_writes: AtomicBool,
}

impl KvStore for ReadOnlyStore {
    fn name(&self) -> &str {
        "read-only"
    }

    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T>,
    {
        self.inner.view(f)
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T>,
    {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk is read-only".to_string()));
        }
        self.inner.update(f)
    }
}

#[tokio::test]
async fn test_fetch_then_sync() {
    let kv = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(16));
    let mut sub = bus.subscribe("test", SYNC_TOPIC).unwrap();
    let client = Arc::new(ScriptedClient::new());
    client.push_fetch(Ok(page("C1", &["S1", "S2", "S3"], false)));

    let handle = DepSyncer::new(client.clone(), bus.clone(), kv.clone(), config())
        .unwrap()
        .start()
        .unwrap();

    let event = SyncEvent::unmarshal(&sub.recv().await.unwrap().message).unwrap();
    let serials: Vec<_> = event.devices.iter().map(|d| d.serial_number.as_str()).collect();
    assert_eq!(serials, ["S1", "S2", "S3"]);

    let status = handle
        .wait_for(|s| s.phase == Phase::Sync && s.pages >= 2)
        .await
        .unwrap();
    assert_eq!(status.cursor, "C1");
    assert_eq!(status.devices_published, 3);
    assert_eq!(client.calls(), vec![fetch(""), sync("C1")]);
    // The empty sync page is not published.
    assert!(sub.try_recv().is_none());

    let cursors = CursorStore::open(kv.clone()).unwrap();
    assert_eq!(cursors.load().unwrap().value, "C1");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_paged_fetch_publishes_every_page() {
    let kv = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(16));
    let mut sub = bus.subscribe("test", SYNC_TOPIC).unwrap();
    let client = Arc::new(ScriptedClient::new());
    client.push_fetch(Ok(page("C1", &["S1"], true)));
    client.push_fetch(Ok(page("C2", &["S2"], true)));

    let handle = DepSyncer::new(client.clone(), bus.clone(), kv, config())
        .unwrap()
        .start()
        .unwrap();

    for expected in ["S1", "S2"] {
        let event = SyncEvent::unmarshal(&sub.recv().await.unwrap().message).unwrap();
        assert_eq!(event.devices[0].serial_number, expected);
    }

    handle
        .wait_for(|s| s.phase == Phase::Sync && s.pages >= 3)
        .await
        .unwrap();
    // The third fetch hits the end of the script and reports an exhausted cursor.
    assert_eq!(
        client.calls(),
        vec![fetch(""), fetch("C1"), fetch("C2"), sync("C2")]
    );
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_expired_cursor_restarts_fetch() {
    let kv = Arc::new(MemoryStore::new());
    let cursors = CursorStore::open(kv.clone()).unwrap();
    cursors.save(&Cursor::new("C5", Utc::now())).unwrap();

    let bus = Arc::new(EventBus::default());
    let client = Arc::new(ScriptedClient::new());
    client.push_sync(Err(ClientError::ExpiredCursor));

    let handle = DepSyncer::new(client.clone(), bus, kv, config())
        .unwrap()
        .start()
        .unwrap();

    handle
        .wait_for(|s| s.phase == Phase::Sync && s.pages >= 1)
        .await
        .unwrap();
    assert_eq!(
        client.calls(),
        vec![fetch("C5"), sync("C5"), fetch(""), sync("")]
    );
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_cursor_is_discarded() {
    let kv = Arc::new(MemoryStore::new());
    let cursors = CursorStore::open(kv.clone()).unwrap();
    cursors
        .save(&Cursor::new("C1", Utc::now() - ChronoDuration::days(8)))
        .unwrap();

    let client = Arc::new(ScriptedClient::new());
    let handle = DepSyncer::new(client.clone(), Arc::new(EventBus::default()), kv, config())
        .unwrap()
        .start()
        .unwrap();

    handle.wait_for(|s| s.pages >= 1).await.unwrap();
    assert_eq!(client.calls()[0], fetch(""));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_fresh_cursor_is_resumed() {
    let kv = Arc::new(MemoryStore::new());
    let cursors = CursorStore::open(kv.clone()).unwrap();
    cursors
        .save(&Cursor::new("C1", Utc::now() - ChronoDuration::days(6)))
        .unwrap();

    let client = Arc::new(ScriptedClient::new());
    let handle = DepSyncer::new(client.clone(), Arc::new(EventBus::default()), kv, config())
        .unwrap()
        .start()
        .unwrap();

    handle.wait_for(|s| s.pages >= 1).await.unwrap();
    assert_eq!(client.calls()[0], fetch("C1"));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_error_saves_cursor() {
    let kv = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_fetch(Ok(page("C1", &["S1"], true)));
    client.push_fetch(Err(ClientError::Other("503 Service Unavailable".to_string())));

    let handle = DepSyncer::new(client.clone(), Arc::new(EventBus::default()), kv.clone(), config())
        .unwrap()
        .start()
        .unwrap();

    let status = handle
        .wait_for(|s| s.phase == Phase::Stopped)
        .await
        .unwrap();
    assert!(status.last_error.unwrap().contains("503"));

    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, Error::Enrollment(_)));

    let cursors = CursorStore::open(kv).unwrap();
    assert_eq!(cursors.load().unwrap().value, "C1");
}

#[tokio::test]
async fn test_publish_failure_keeps_cursor() {
    let kv = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_fetch(Ok(page("C1", &["S1"], false)));

    let handle = DepSyncer::new(client.clone(), Arc::new(FailingPublisher), kv.clone(), config())
        .unwrap()
        .start()
        .unwrap();

    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, Error::Publish(_)));
    assert_eq!(client.calls(), vec![fetch("")]);

    let cursors = CursorStore::open(kv).unwrap();
    assert_eq!(cursors.load().unwrap().value, "C1");
}

#[tokio::test]
async fn test_shutdown_during_wait() {
    let kv = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_sync(Ok(page("C3", &[], false)));

    let handle = DepSyncer::new(client.clone(), Arc::new(EventBus::default()), kv.clone(), config())
        .unwrap()
        .start()
        .unwrap();

    handle
        .wait_for(|s| s.phase == Phase::Sync && s.pages >= 1)
        .await
        .unwrap();
    assert!(!handle.is_finished());

    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("engine did not stop in time")
        .unwrap();

    let cursors = CursorStore::open(kv).unwrap();
    assert_eq!(cursors.load().unwrap().value, "C3");
    // Only one sync call: the interval never elapsed.
    assert_eq!(client.calls(), vec![fetch(""), sync("")]);
}

#[tokio::test]
async fn test_resume_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.db");

    {
        let kv = Arc::new(SqliteStore::open(&path).unwrap());
        let client = Arc::new(ScriptedClient::new());
        client.push_fetch(Ok(page("C1", &["S1"], true)));
        client.push_fetch(Err(ClientError::Other("connection reset".to_string())));

        let handle = DepSyncer::new(client, Arc::new(EventBus::default()), kv, config())
            .unwrap()
            .start()
            .unwrap();
        assert!(handle.join().await.is_err());
    }

    let kv = Arc::new(SqliteStore::open(&path).unwrap());
    let client = Arc::new(ScriptedClient::new());
    let handle = DepSyncer::new(client.clone(), Arc::new(EventBus::default()), kv, config())
        .unwrap()
        .start()
        .unwrap();

    handle.wait_for(|s| s.pages >= 1).await.unwrap();
    assert_eq!(client.calls()[0], fetch("C1"));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_sync_batch_is_published() {
    let kv = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(16));
    let mut sub = bus.subscribe("test", SYNC_TOPIC).unwrap();
    let client = Arc::new(ScriptedClient::new());
    client.push_sync(Ok(page("C2", &["S4", "S5"], false)));

    let handle = DepSyncer::new(client.clone(), bus.clone(), kv.clone(), config())
        .unwrap()
        .start()
        .unwrap();

    let event = SyncEvent::unmarshal(&sub.recv().await.unwrap().message).unwrap();
    assert_eq!(event.devices.len(), 2);
    assert_eq!(event.devices[1].serial_number, "S5");

    let status = handle
        .wait_for(|s| s.devices_published >= 2)
        .await
        .unwrap();
    assert_eq!(status.devices_published, 2);
    assert_eq!(status.cursor, "C2");
    assert_eq!(client.calls(), vec![fetch(""), sync("")]);
    assert!(sub.try_recv().is_none());

    let cursors = CursorStore::open(kv).unwrap();
    assert_eq!(cursors.load().unwrap().value, "C2");
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_cursor_save_keeps_running() {
    let kv = Arc::new(ReadOnlyStore::default());
    let bus = Arc::new(EventBus::new(16));
    let mut sub = bus.subscribe("test", SYNC_TOPIC).unwrap();
    let client = Arc::new(ScriptedClient::new());
    client.push_fetch(Ok(page("C1", &["S1"], true)));
    client.push_fetch(Ok(page("C2", &["S2"], false)));

    let syncer = DepSyncer::new(client.clone(), bus.clone(), kv.clone(), config()).unwrap();
    kv.reject_writes.store(true, Ordering::SeqCst);
    let handle = syncer.start().unwrap();

    for expected in ["S1", "S2"] {
        let event = SyncEvent::unmarshal(&sub.recv().await.unwrap().message).unwrap();
        assert_eq!(event.devices[0].serial_number, expected);
    }
    let status = handle
        .wait_for(|s| s.phase == Phase::Sync && s.pages >= 3)
        .await
        .unwrap();
    assert_eq!(status.cursor, "C2");
    assert_eq!(client.calls(), vec![fetch(""), fetch("C1"), sync("C2")]);

    // Save on exit fails too; it is logged, not returned.
    handle.stop().await.unwrap();

    kv.reject_writes.store(false, Ordering::SeqCst);
    let cursors = CursorStore::open(kv).unwrap();
    assert!(cursors.load().unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_sync_interval_rejected() {
    let config: SyncConfig = serde_json::from_str(r#"{"sync_interval": 0}"#).unwrap();
    let result = DepSyncer::new(
        Arc::new(ScriptedClient::new()),
        Arc::new(EventBus::default()),
        Arc::new(MemoryStore::new()),
        config,
    );
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_zero_fetch_limit_rejected() {
    let result = DepSyncer::new(
        Arc::new(ScriptedClient::new()),
        Arc::new(EventBus::default()),
        Arc::new(MemoryStore::new()),
        SyncConfig::default().with_fetch_limit(0),
    );
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}
