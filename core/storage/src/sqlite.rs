//! SQLite-backed key-value store.
//!
//! Buckets are rows of a `buckets` table; entries live in a single
//! `entries` table keyed by `(bucket, key)`. SQLite compares BLOBs with
//! `memcmp`, so `ORDER BY key` gives the same bytewise ordering as the
//! in-memory store.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use fleetd_common::{BucketName, Error, Result};
use crate::store::{Entry, KvStore, ReadTxn, WriteTxn};

/// Durable key-value store on top of a single SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            "#,
        )
        .map_err(db_err)?;

        info!("Store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

struct SqliteTxn<'a> {
    tx: Transaction<'a>,
}

impl SqliteTxn<'_> {
    fn require_bucket(&self, bucket: BucketName) -> Result<()> {
        let found = self.tx.query_row(
            "SELECT 1 FROM buckets WHERE name = ?1",
            [bucket.as_str()],
            |_| Ok(()),
        );
        match found {
            Ok(()) => Ok(()),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::BucketNotFound(bucket.to_string()))
            }
            Err(e) => Err(db_err(e)),
        }
    }
}

impl ReadTxn for SqliteTxn<'_> {
    fn get(&self, bucket: BucketName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.require_bucket(bucket)?;
        let value = self.tx.query_row(
            "SELECT value FROM entries WHERE bucket = ?1 AND key = ?2",
            params![bucket.as_str(), key],
            |row| row.get(0),
        );
        match value {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    fn scan(&self, bucket: BucketName) -> Result<Vec<Entry>> {
        self.require_bucket(bucket)?;
        let mut stmt = self
            .tx
            .prepare("SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([bucket.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(db_err)?);
        }
        Ok(result)
    }
}

impl WriteTxn for SqliteTxn<'_> {
    fn create_bucket(&mut self, bucket: BucketName) -> Result<()> {
        bucket.validate()?;
        self.tx
            .execute(
                "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
                [bucket.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn put(&mut self, bucket: BucketName, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Key cannot be empty".to_string()));
        }
        self.require_bucket(bucket)?;
        self.tx
            .execute(
                "INSERT OR REPLACE INTO entries (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![bucket.as_str(), key, value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn delete(&mut self, bucket: BucketName, key: &[u8]) -> Result<()> {
        self.require_bucket(bucket)?;
        self.tx
            .execute(
                "DELETE FROM entries WHERE bucket = ?1 AND key = ?2",
                params![bucket.as_str(), key],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(db_err)?;
        let txn = SqliteTxn { tx };
        let out = f(&txn)?;
        txn.tx.rollback().map_err(db_err)?;
        Ok(out)
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut txn = SqliteTxn { tx };
        // Dropping the transaction on the error path rolls it back.
        let out = f(&mut txn)?;
        txn.tx.commit().map_err(db_err)?;
        debug!("Committed write transaction");
        Ok(out)
    }
}
