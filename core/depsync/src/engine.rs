//! The enrollment sync engine.
//!
//! The engine alternates between two phases that share one persisted cursor:
//!
//! - **Fetch** pages through the whole device roster. Every page's cursor is
//!   saved before the page is published, so a restart may replay a page but
//!   never skips one. An exhausted cursor or the last page moves to Sync.
//! - **Sync** asks for changes since the cursor, publishes non-empty batches
//!   and then waits for the next tick. An expired cursor drops back to Fetch
//!   with an empty cursor.
//!
//! Any other API or publish error stops the engine. Whatever the outcome,
//! the last cursor is saved once more on the way out.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fleetd_common::{Error, Result};
use fleetd_pubsub::Publisher;
use fleetd_storage::KvStore;

use crate::client::{ClientError, DepDevice, EnrollmentClient};
use crate::config::SyncConfig;
use crate::cursor::{Cursor, CursorStore};
use crate::event::{SyncEvent, SYNC_TOPIC};

/// Engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Sync,
    Stopped,
}

/// Progress snapshot published by a running engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: Phase,
    /// Cursor value the next API call will use.
    pub cursor: String,
    /// Successful API calls so far.
    pub pages: u64,
    /// Devices published on the bus so far.
    pub devices_published: u64,
    /// Set once the engine stopped on an error.
    pub last_error: Option<String>,
}

impl SyncStatus {
    fn starting(cursor: &Cursor) -> Self {
        Self {
            phase: Phase::Fetch,
            cursor: cursor.value.clone(),
            pages: 0,
            devices_published: 0,
            last_error: None,
        }
    }
}

/// Enrollment sync engine, ready to be started.
pub struct DepSyncer<C: ?Sized, P: ?Sized, S> {
    client: Arc<C>,
    publisher: Arc<P>,
    cursors: CursorStore<S>,
    config: SyncConfig,
}

impl<C, P, S> DepSyncer<C, P, S>
where
    C: EnrollmentClient + ?Sized + 'static,
    P: Publisher + ?Sized + 'static,
    S: KvStore + 'static,
{
    /// Create an engine over `store`, creating the cursor bucket if needed.
    pub fn new(client: Arc<C>, publisher: Arc<P>, store: Arc<S>, config: SyncConfig) -> Result<Self> {
        if config.fetch_limit == 0 {
            return Err(Error::InvalidInput("fetch limit must be positive".to_string()));
        }
        if config.sync_interval.is_zero() {
            return Err(Error::InvalidInput("sync interval must be positive".to_string()));
        }
        Ok(Self {
            client,
            publisher,
            cursors: CursorStore::open(store)?,
            config,
        })
    }

    /// Load the saved cursor and spawn the engine task.
    ///
    /// Must be called from within a tokio runtime. A cursor older than the
    /// configured maximum age is discarded and the engine starts over from
    /// the beginning of history.
    ///
    /// # Errors
    /// - The cursor store cannot be read
    pub fn start(self) -> Result<SyncHandle> {
        let mut cursor = self.cursors.load()?;
        let max_age = chrono::Duration::from_std(self.config.cursor_max_age)
            .unwrap_or(chrono::Duration::MAX);
        if !cursor.is_empty() && cursor.is_stale(Utc::now(), max_age) {
            info!(
                "Discarding stale cursor from {}, fetching from the start",
                cursor.created_at
            );
            cursor = Cursor::default();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(SyncStatus::starting(&cursor));

        info!("Starting enrollment sync (cursor {:?})", cursor.value);
        let runner = Runner {
            syncer: self,
            cursor,
            phase: Phase::Fetch,
            shutdown: shutdown_rx,
            status: status_tx,
        };
        let task = tokio::spawn(runner.run());

        Ok(SyncHandle {
            shutdown: shutdown_tx,
            status: status_rx,
            task,
        })
    }
}

/// Handle to a running engine.
///
/// Dropping the handle asks the engine to stop at its next check.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<Result<()>>,
}

impl SyncHandle {
    /// Latest status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// A receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until `predicate` holds for the status.
    ///
    /// # Errors
    /// - The engine stopped without ever satisfying `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&SyncStatus) -> bool) -> Result<SyncStatus> {
        let mut rx = self.status.clone();
        let status = rx.wait_for(predicate).await.map(|s| (*s).clone());
        status.map_err(|_| Error::Task("sync engine stopped".to_string()))
    }

    /// Returns true once the engine task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the engine to stop. Does not wait.
    pub fn shutdown(&self) {
        // Fails only when the task is already gone.
        let _ = self.shutdown.send(true);
    }

    /// Wait for the engine task and return its outcome.
    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(|e| Error::Task(e.to_string()))?
    }

    /// Stop the engine and wait for it.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}

struct Runner<C: ?Sized, P: ?Sized, S> {
    syncer: DepSyncer<C, P, S>,
    cursor: Cursor,
    phase: Phase,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
}

impl<C, P, S> Runner<C, P, S>
where
    C: EnrollmentClient + ?Sized + 'static,
    P: Publisher + ?Sized + 'static,
    S: KvStore + 'static,
{
    async fn run(mut self) -> Result<()> {
        let outcome = self.run_loop().await;

        match self.syncer.cursors.save(&self.cursor) {
            Ok(()) => info!("Saved cursor {:?} on exit", self.cursor.value),
            Err(e) => warn!("Failed to save cursor on exit: {}", e),
        }
        match &outcome {
            Ok(()) => info!("Enrollment sync stopped"),
            Err(e) => error!("Enrollment sync failed: {}", e),
        }

        let last_error = outcome.as_ref().err().map(|e| e.to_string());
        self.status.send_modify(|s| {
            s.phase = Phase::Stopped;
            s.last_error = last_error;
        });
        outcome
    }

    async fn run_loop(&mut self) -> Result<()> {
        let period = self.syncer.config.sync_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shutdown_requested() {
                return Ok(());
            }
            match self.phase {
                Phase::Fetch => self.fetch_page().await?,
                Phase::Sync => {
                    self.sync_changes().await?;
                    if self.phase == Phase::Sync && !self.wait_for_tick(&mut ticker).await {
                        return Ok(());
                    }
                }
                Phase::Stopped => return Ok(()),
            }
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let limit = self.syncer.config.fetch_limit;
        match self.syncer.client.fetch_devices(&self.cursor.value, limit).await {
            Ok(page) => {
                debug!(
                    "Fetched {} devices, more to follow: {}",
                    page.devices.len(),
                    page.more_to_follow
                );
                self.advance_cursor(page.cursor);
                self.publish(page.devices).await?;
                if !page.more_to_follow {
                    self.enter(Phase::Sync);
                }
                Ok(())
            }
            Err(ClientError::ExhaustedCursor) => {
                debug!("Fetch cursor exhausted");
                self.enter(Phase::Sync);
                Ok(())
            }
            Err(e) => Err(Error::Enrollment(format!("fetching devices: {e}"))),
        }
    }

    async fn sync_changes(&mut self) -> Result<()> {
        match self.syncer.client.sync_devices(&self.cursor.value).await {
            Ok(page) => {
                self.advance_cursor(page.cursor);
                if !page.devices.is_empty() {
                    info!("Sync returned {} changed devices", page.devices.len());
                    self.publish(page.devices).await?;
                }
                Ok(())
            }
            Err(ClientError::ExpiredCursor) => {
                info!("Sync cursor expired, fetching from the start");
                self.cursor.value.clear();
                self.status.send_modify(|s| s.cursor.clear());
                self.enter(Phase::Fetch);
                Ok(())
            }
            Err(e) => Err(Error::Enrollment(format!("syncing devices: {e}"))),
        }
    }

    /// Adopt the cursor returned by the API and persist it. A failed save is
    /// logged and the loop carries on.
    fn advance_cursor(&mut self, value: String) {
        self.cursor = Cursor::new(value, Utc::now());
        if let Err(e) = self.syncer.cursors.save(&self.cursor) {
            warn!("Failed to save cursor {:?}: {}", self.cursor.value, e);
        }
        let value = self.cursor.value.clone();
        self.status.send_modify(|s| {
            s.cursor = value;
            s.pages += 1;
        });
    }

    async fn publish(&mut self, devices: Vec<DepDevice>) -> Result<()> {
        let count = devices.len() as u64;
        let event = SyncEvent::new(devices);
        let payload = event.marshal()?;
        self.syncer.publisher.publish(SYNC_TOPIC, payload).await?;
        debug!("Published sync event {} with {} devices", event.id, count);
        self.status.send_modify(|s| s.devices_published += count);
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            info!("Enrollment sync entering {:?} phase", phase);
            self.phase = phase;
            self.status.send_modify(|s| s.phase = phase);
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Returns false if shutdown was requested while waiting.
    async fn wait_for_tick(&mut self, ticker: &mut Interval) -> bool {
        tokio::select! {
            _ = ticker.tick() => true,
            _ = self.shutdown.changed() => {
                debug!("Shutdown requested during sync wait");
                false
            }
        }
    }
}
