//! Device batch events published on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleetd_common::{Error, Result};

use crate::client::DepDevice;

/// Topic carrying device batches from the sync engine.
pub const SYNC_TOPIC: &str = "mdm.DepSync";

/// One page of devices as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub devices: Vec<DepDevice>,
}

impl SyncEvent {
    /// Create an event with a fresh id.
    pub fn new(devices: Vec<DepDevice>) -> Self {
        Self {
            id: Uuid::new_v4(),
            time: Utc::now(),
            devices,
        }
    }

    /// Encode for publishing.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::from(e).context("marshalling sync event"))
    }

    /// Decode a published payload.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::from(e).context("decoding sync event"))
    }
}
