//! Transactional key-value store trait definition.

use fleetd_common::{BucketName, Result};

/// A key/value pair read from a bucket.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Read access inside a transaction.
///
/// Every read observes the state as of the start of the transaction plus
/// any writes the same transaction has already made.
pub trait ReadTxn {
    /// Get the value stored under `key`.
    ///
    /// # Errors
    /// - Bucket not found
    /// - Backend failure
    fn get(&self, bucket: BucketName, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All entries of a bucket in ascending key order (bytewise).
    ///
    /// # Errors
    /// - Bucket not found
    /// - Backend failure
    fn scan(&self, bucket: BucketName) -> Result<Vec<Entry>>;
}

/// Write access inside a transaction.
pub trait WriteTxn: ReadTxn {
    /// Create a bucket unless it already exists.
    fn create_bucket(&mut self, bucket: BucketName) -> Result<()>;

    /// Insert or overwrite `key`.
    ///
    /// # Errors
    /// - Bucket not found
    fn put(&mut self, bucket: BucketName, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    /// - Bucket not found
    fn delete(&mut self, bucket: BucketName, key: &[u8]) -> Result<()>;
}

/// Embedded ACID key-value store with named buckets.
///
/// Implementations serialize write transactions: at most one `update` runs
/// at a time, and its writes become visible all at once when the closure
/// returns `Ok`. If the closure returns `Err` nothing it wrote is kept.
pub trait KvStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Run a read-only transaction.
    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T>;

    /// Run a read-write transaction and commit it if `f` succeeds.
    ///
    /// # Postconditions
    /// - On `Ok`, all writes are durable (for durable backends)
    /// - On `Err`, no write made by `f` is visible
    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T>;

    /// Create each bucket that does not exist yet, in one transaction.
    fn ensure_buckets(&self, buckets: &[BucketName]) -> Result<()> {
        self.update(|tx| {
            for bucket in buckets {
                tx.create_bucket(*bucket)?;
            }
            Ok(())
        })
    }
}
