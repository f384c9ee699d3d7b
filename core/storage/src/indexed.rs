//! Indexed document store.
//!
//! A document kind is persisted in two buckets: a primary bucket mapping the
//! document id to its JSON encoding, and an index bucket mapping every
//! alternate key (id, name, serial number, ...) back to the id. Both are
//! written in the same transaction, so a reader never sees one without the
//! other. The index is derived state and readers never trust it alone: an
//! index entry whose record is missing, or whose record does not claim the
//! key, is reported as [`Error::IndexCorrupted`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use fleetd_common::{BucketName, Error, Result};
use crate::store::{KvStore, ReadTxn, WriteTxn};

/// An entity that can live in an [`IndexedStore`].
pub trait Document: Serialize + DeserializeOwned {
    /// Human-readable kind used in error messages (e.g. "Blueprint").
    const KIND: &'static str;

    /// Primary identifier. Must be non-empty once validated.
    fn id(&self) -> &str;

    /// Every key the index should resolve to this document, the id included.
    /// Empty keys are skipped.
    fn index_keys(&self) -> Vec<&str>;

    /// Structural validation run before any transaction is opened.
    fn validate(&self) -> Result<()>;
}

/// Primary bucket + index bucket for one document kind.
pub struct IndexedStore<S, D> {
    store: Arc<S>,
    primary: BucketName,
    index: BucketName,
    _doc: PhantomData<fn() -> D>,
}

impl<S, D> Clone for IndexedStore<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            primary: self.primary,
            index: self.index,
            _doc: PhantomData,
        }
    }
}

impl<S: KvStore, D: Document> IndexedStore<S, D> {
    /// Open the store, creating both buckets if needed.
    pub fn open(store: Arc<S>, primary: BucketName, index: BucketName) -> Result<Self> {
        store
            .ensure_buckets(&[index, primary])
            .map_err(|e| e.context(format_args!("creating {primary} bucket")))?;
        Ok(Self {
            store,
            primary,
            index,
            _doc: PhantomData,
        })
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &Arc<S> {
        &self.store
    }

    /// Primary bucket name.
    pub fn primary_bucket(&self) -> BucketName {
        self.primary
    }

    /// Index bucket name.
    pub fn index_bucket(&self) -> BucketName {
        self.index
    }

    /// Look a document up by any of its index keys.
    ///
    /// # Errors
    /// - `NotFound` if no index entry exists for `key`
    /// - `IndexCorrupted` if the entry exists but its record does not
    /// - `Corrupted` if the record cannot be decoded
    pub fn get(&self, key: &str) -> Result<D> {
        self.store.view(|tx| self.resolve(tx, key))
    }

    /// Resolve `key` inside an already open transaction.
    pub fn resolve<T: ReadTxn + ?Sized>(&self, tx: &T, key: &str) -> Result<D> {
        let Some(raw_id) = tx.get(self.index, key.as_bytes())? else {
            return Err(Error::NotFound(format!("{} {}", D::KIND, key)));
        };
        let id = String::from_utf8(raw_id).map_err(|_| Error::IndexCorrupted {
            index: self.index.to_string(),
            key: key.to_string(),
            id: String::new(),
            reason: "id is not valid UTF-8".to_string(),
        })?;

        let Some(bytes) = tx.get(self.primary, id.as_bytes())? else {
            return Err(Error::IndexCorrupted {
                index: self.index.to_string(),
                key: key.to_string(),
                id,
                reason: "primary record missing".to_string(),
            });
        };
        let doc = self.decode(&id, &bytes)?;

        if doc.id() != id || !doc.index_keys().contains(&key) {
            return Err(Error::IndexCorrupted {
                index: self.index.to_string(),
                key: key.to_string(),
                id,
                reason: "record does not claim this key".to_string(),
            });
        }
        Ok(doc)
    }

    /// Full ordered scan; any undecodable record aborts the scan.
    pub fn list(&self) -> Result<Vec<D>> {
        self.store.view(|tx| self.list_in(tx))
    }

    /// Full ordered scan inside an already open transaction.
    pub fn list_in<T: ReadTxn + ?Sized>(&self, tx: &T) -> Result<Vec<D>> {
        tx.scan(self.primary)?
            .into_iter()
            .map(|(key, value)| self.decode(&String::from_utf8_lossy(&key), &value))
            .collect()
    }

    /// Best-effort scan: undecodable records are logged and skipped.
    pub fn scan_lossy(&self) -> Result<Vec<D>> {
        let entries = self.store.view(|tx| tx.scan(self.primary))?;
        let mut docs = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let key = String::from_utf8_lossy(&key);
            match self.decode(&key, &value) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!("Skipping {} {}: {}", D::KIND, key, e),
            }
        }
        Ok(docs)
    }

    /// Write `doc` and its index entries in one transaction.
    ///
    /// Index keys the previous version owned but `doc` no longer has are
    /// removed. A key already owned by a different id is rejected.
    ///
    /// # Preconditions
    /// - `doc` has been validated and its references checked
    ///
    /// # Errors
    /// - `AlreadyExists` if one of the keys belongs to another document
    /// - Storage/serialization failures
    pub fn put(&self, doc: &D) -> Result<()> {
        self.put_with(doc, |_, _| Ok(()))
    }

    /// [`IndexedStore::put`] with a `guard` run first inside the write
    /// transaction; returning an error aborts the write.
    pub fn put_with<G>(&self, doc: &D, guard: G) -> Result<()>
    where
        G: FnOnce(&dyn WriteTxn, &D) -> Result<()>,
    {
        let id = doc.id();
        if id.is_empty() {
            return Err(Error::InvalidInput(format!("{} id cannot be empty", D::KIND)));
        }
        let encoded = serde_json::to_vec(doc)
            .map_err(|e| Error::from(e).context(format_args!("marshalling {}", D::KIND)))?;
        let keys: HashSet<&str> = doc.index_keys().into_iter().filter(|k| !k.is_empty()).collect();

        self.store
            .update(|tx| {
                guard(&*tx, doc)?;
                for key in &keys {
                    if let Some(owner) = tx.get(self.index, key.as_bytes())? {
                        if owner != id.as_bytes() {
                            return Err(Error::AlreadyExists(format!(
                                "{} {} is already taken",
                                D::KIND,
                                key
                            )));
                        }
                    }
                }

                self.remove_stale_keys(tx, id, &keys)?;

                for key in &keys {
                    tx.put(self.index, key.as_bytes(), id.as_bytes())?;
                }
                tx.put(self.primary, id.as_bytes(), &encoded)
            })
            .map_err(|e| e.context(format_args!("put {} to store", D::KIND)))?;

        debug!("Saved {} {}", D::KIND, id);
        Ok(())
    }

    /// Delete the document `key` resolves to, with all of its index entries.
    ///
    /// `guard` runs inside the same write transaction before anything is
    /// removed; returning an error aborts the delete.
    pub fn delete_with<G>(&self, key: &str, guard: G) -> Result<D>
    where
        G: FnOnce(&dyn WriteTxn, &D) -> Result<()>,
    {
        let doc = self.store.update(|tx| {
            let doc = self.resolve(&*tx, key)?;
            guard(&*tx, &doc)?;
            for k in doc.index_keys() {
                if !k.is_empty() {
                    tx.delete(self.index, k.as_bytes())?;
                }
            }
            tx.delete(self.primary, doc.id().as_bytes())?;
            Ok(doc)
        })?;
        debug!("Deleted {} {}", D::KIND, doc.id());
        Ok(doc)
    }

    fn remove_stale_keys(
        &self,
        tx: &mut dyn WriteTxn,
        id: &str,
        keep: &HashSet<&str>,
    ) -> Result<()> {
        let Some(bytes) = tx.get(self.primary, id.as_bytes())? else {
            return Ok(());
        };
        let previous = match self.decode(id, &bytes) {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Overwriting undecodable {} {}: {}", D::KIND, id, e);
                return Ok(());
            }
        };
        for old in previous.index_keys() {
            if old.is_empty() || keep.contains(old) {
                continue;
            }
            if tx.get(self.index, old.as_bytes())?.as_deref() == Some(id.as_bytes()) {
                tx.delete(self.index, old.as_bytes())?;
            }
        }
        Ok(())
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<D> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corrupted {
            bucket: self.primary.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
