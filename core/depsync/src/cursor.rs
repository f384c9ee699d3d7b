//! Persisted sync cursor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use fleetd_common::{BucketName, Error, Result};
use fleetd_storage::KvStore;

/// Bucket holding the enrollment sync configuration.
pub const CONFIG_BUCKET: BucketName = BucketName::new("mdm.DEPConfig");

const CURSOR_KEY: &[u8] = b"config";

/// Resume token returned by the enrollment API and when it was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Opaque token; empty means "start of history".
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl Cursor {
    /// A cursor with `value` obtained at `now`.
    pub fn new(value: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            created_at: now,
        }
    }

    /// Returns true once the cursor is older than `max_age`.
    ///
    /// A `created_at` in the future is never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.created_at) > max_age
    }

    /// Returns true for the start-of-history cursor.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            value: String::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Single-record store for the sync cursor.
pub struct CursorStore<S> {
    store: Arc<S>,
}

impl<S> Clone for CursorStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore> CursorStore<S> {
    /// Open the cursor store, creating its bucket if needed.
    pub fn open(store: Arc<S>) -> Result<Self> {
        store
            .ensure_buckets(&[CONFIG_BUCKET])
            .map_err(|e| e.context("creating cursor bucket"))?;
        Ok(Self { store })
    }

    /// Load the saved cursor.
    ///
    /// A missing record yields the default cursor. An undecodable record is
    /// logged and also yields the default cursor, which restarts the fetch
    /// from the beginning of history.
    pub fn load(&self) -> Result<Cursor> {
        let raw = self
            .store
            .view(|tx| tx.get(CONFIG_BUCKET, CURSOR_KEY))
            .map_err(|e| e.context("loading cursor"))?;

        let Some(bytes) = raw else {
            debug!("No saved cursor");
            return Ok(Cursor::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                warn!("Ignoring undecodable cursor in {}: {}", CONFIG_BUCKET, e);
                Ok(Cursor::default())
            }
        }
    }

    /// Overwrite the saved cursor.
    pub fn save(&self, cursor: &Cursor) -> Result<()> {
        let bytes = serde_json::to_vec(cursor)
            .map_err(|e| Error::from(e).context("marshalling cursor"))?;
        self.store
            .update(|tx| tx.put(CONFIG_BUCKET, CURSOR_KEY, &bytes))
            .map_err(|e| e.context("saving cursor"))?;
        debug!("Saved cursor {:?}", cursor.value);
        Ok(())
    }
}
