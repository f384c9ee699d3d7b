//! Background worker feeding enrollment sync batches into the inventory.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleetd_common::{Error, Result};
use fleetd_depsync::SyncEvent;
use fleetd_pubsub::{Event, Subscription};
use fleetd_storage::KvStore;

use crate::device::{DeviceStore, MergeSummary};

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub events: u64,
    pub dropped: u64,
    pub created: u64,
    pub updated: u64,
}

/// Merges every `mdm.DepSync` batch into a [`DeviceStore`].
pub struct DeviceSyncWorker<S> {
    devices: DeviceStore<S>,
}

impl<S: KvStore + 'static> DeviceSyncWorker<S> {
    pub fn new(devices: DeviceStore<S>) -> Self {
        Self { devices }
    }

    /// Decode one event and merge its devices.
    pub fn handle_event(&self, event: &Event) -> Result<MergeSummary> {
        let batch = SyncEvent::unmarshal(&event.message)?;
        let summary = self.devices.merge_dep_devices(&batch.devices)?;
        debug!(
            "Event {}: {} created, {} updated",
            batch.id, summary.created, summary.updated
        );
        Ok(summary)
    }

    /// Spawn the worker on `subscription`.
    pub fn start(self, subscription: Subscription) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(subscription, shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!("Device sync worker {} started", subscription.name());

        loop {
            let event = tokio::select! {
                event = subscription.recv() => event,
                _ = shutdown.changed() => break,
            };
            let Some(event) = event else {
                debug!("Event bus closed");
                break;
            };

            stats.events += 1;
            match self.handle_event(&event) {
                Ok(summary) => {
                    stats.created += summary.created as u64;
                    stats.updated += summary.updated as u64;
                }
                Err(e @ Error::Serialization(_)) => {
                    warn!("Dropping undecodable event on {}: {}", event.topic, e);
                    stats.dropped += 1;
                }
                Err(e) => {
                    error!("Failed to merge device batch: {}", e);
                    stats.dropped += 1;
                }
            }
        }

        info!(
            "Device sync worker stopped after {} events ({} dropped)",
            stats.events, stats.dropped
        );
        stats
    }
}

/// Handle to a running [`DeviceSyncWorker`].
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Stop the worker and wait for it.
    pub async fn stop(self) -> Result<WorkerStats> {
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Wait for the worker to end on its own (bus closed).
    pub async fn join(self) -> Result<WorkerStats> {
        self.task.await.map_err(|e| Error::Task(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_depsync::{DepDevice, SYNC_TOPIC};
    use fleetd_pubsub::{EventBus, Publisher};
    use fleetd_storage::MemoryStore;
    use std::sync::Arc;

    fn batch(serials: &[&str]) -> Vec<u8> {
        let devices = serials
            .iter()
            .map(|s| DepDevice {
                serial_number: s.to_string(),
                profile_status: "assigned".to_string(),
                ..Default::default()
            })
            .collect();
        SyncEvent::new(devices).marshal().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_batches_yield_one_device_per_serial() {
        let devices = DeviceStore::open(Arc::new(MemoryStore::new())).unwrap();
        let bus = EventBus::new(16);
        let sub = bus.subscribe("devices", SYNC_TOPIC).unwrap();
        let handle = DeviceSyncWorker::new(devices.clone()).start(sub);

        let payload = batch(&["C02AAA", "C02BBB"]);
        bus.publish(SYNC_TOPIC, payload.clone()).await.unwrap();
        bus.publish(SYNC_TOPIC, payload).await.unwrap();
        bus.publish(SYNC_TOPIC, b"garbage".to_vec()).await.unwrap();
        bus.close();

        let stats = handle.join().await.unwrap();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.dropped, 1);

        let all = devices.list().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.dep_device));
    }

    #[tokio::test]
    async fn test_burst_larger_than_queue_is_fully_merged() {
        let devices = DeviceStore::open(Arc::new(MemoryStore::new())).unwrap();
        let bus = EventBus::new(2);
        let sub = bus.subscribe("devices", SYNC_TOPIC).unwrap();
        let handle = DeviceSyncWorker::new(devices.clone()).start(sub);

        for serial in ["S1", "S2", "S3", "S4", "S5"] {
            bus.publish(SYNC_TOPIC, batch(&[serial])).await.unwrap();
        }
        bus.close();

        let stats = handle.join().await.unwrap();
        assert_eq!(stats.events, 5);
        assert_eq!(stats.created, 5);
        assert_eq!(stats.dropped, 0);
        assert_eq!(devices.list().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_stop_without_events() {
        let devices = DeviceStore::open(Arc::new(MemoryStore::new())).unwrap();
        let bus = EventBus::new(16);
        let sub = bus.subscribe("devices", SYNC_TOPIC).unwrap();

        let handle = DeviceSyncWorker::new(devices).start(sub);
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
