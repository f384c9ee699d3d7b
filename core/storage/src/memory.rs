//! In-memory key-value store for testing.

use std::collections::BTreeMap;
use std::sync::RwLock;

use fleetd_common::{BucketName, Error, Result};
use crate::store::{Entry, KvStore, ReadTxn, WriteTxn};

type Buckets = BTreeMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. A write transaction works on a private copy of the
/// buckets while holding the write lock and swaps it in on commit.
pub struct MemoryStore {
    buckets: RwLock<Buckets>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of keys in a bucket, or `None` if the bucket does not exist.
    pub fn bucket_len(&self, bucket: BucketName) -> Option<usize> {
        let buckets = self.buckets.read().ok()?;
        buckets.get(bucket.as_str()).map(|b| b.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::Storage("memory store lock poisoned".to_string())
}

fn bucket<'a>(
    buckets: &'a Buckets,
    name: BucketName,
) -> Result<&'a BTreeMap<Vec<u8>, Vec<u8>>> {
    buckets
        .get(name.as_str())
        .ok_or_else(|| Error::BucketNotFound(name.to_string()))
}

struct MemoryReadTxn<'a> {
    buckets: &'a Buckets,
}

impl ReadTxn for MemoryReadTxn<'_> {
    fn get(&self, name: BucketName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(bucket(self.buckets, name)?.get(key).cloned())
    }

    fn scan(&self, name: BucketName) -> Result<Vec<Entry>> {
        Ok(bucket(self.buckets, name)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

struct MemoryWriteTxn {
    staged: Buckets,
}

impl ReadTxn for MemoryWriteTxn {
    fn get(&self, name: BucketName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        MemoryReadTxn { buckets: &self.staged }.get(name, key)
    }

    fn scan(&self, name: BucketName) -> Result<Vec<Entry>> {
        MemoryReadTxn { buckets: &self.staged }.scan(name)
    }
}

impl WriteTxn for MemoryWriteTxn {
    fn create_bucket(&mut self, name: BucketName) -> Result<()> {
        name.validate()?;
        self.staged.entry(name.as_str()).or_default();
        Ok(())
    }

    fn put(&mut self, name: BucketName, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Key cannot be empty".to_string()));
        }
        self.staged
            .get_mut(name.as_str())
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, name: BucketName, key: &[u8]) -> Result<()> {
        self.staged
            .get_mut(name.as_str())
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))?
            .remove(key);
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T>,
    {
        let buckets = self.buckets.read().map_err(|_| poisoned())?;
        f(&MemoryReadTxn { buckets: &*buckets })
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T>,
    {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let mut tx = MemoryWriteTxn {
            staged: buckets.clone(),
        };
        let out = f(&mut tx)?;
        *buckets = tx.staged;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRUIT: BucketName = BucketName::new("test.Fruit");

    #[test]
    fn test_put_get_scan_ordered() {
        let store = MemoryStore::new();
        store.ensure_buckets(&[FRUIT]).unwrap();

        store
            .update(|tx| {
                tx.put(FRUIT, b"pear", b"3")?;
                tx.put(FRUIT, b"apple", b"1")?;
                tx.put(FRUIT, b"banana", b"2")
            })
            .unwrap();

        let keys: Vec<Vec<u8>> = store
            .view(|tx| tx.scan(FRUIT))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec(), b"pear".to_vec()]);

        let value = store.view(|tx| tx.get(FRUIT, b"banana")).unwrap();
        assert_eq!(value, Some(b"2".to_vec()));
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let store = MemoryStore::new();
        store.ensure_buckets(&[FRUIT]).unwrap();

        let result: Result<()> = store.update(|tx| {
            tx.put(FRUIT, b"apple", b"1")?;
            Err(Error::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.bucket_len(FRUIT), Some(0));
    }

    #[test]
    fn test_reads_see_own_writes() {
        let store = MemoryStore::new();
        store.ensure_buckets(&[FRUIT]).unwrap();

        let seen = store
            .update(|tx| {
                tx.put(FRUIT, b"kiwi", b"9")?;
                tx.get(FRUIT, b"kiwi")
            })
            .unwrap();
        assert_eq!(seen, Some(b"9".to_vec()));
    }

    #[test]
    fn test_missing_bucket() {
        let store = MemoryStore::new();
        let err = store.view(|tx| tx.get(FRUIT, b"x")).unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));

        let err = store.update(|tx| tx.put(FRUIT, b"x", b"y")).unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));
    }

    #[test]
    fn test_delete() {
        let store = MemoryStore::new();
        store.ensure_buckets(&[FRUIT]).unwrap();
        store.update(|tx| tx.put(FRUIT, b"fig", b"4")).unwrap();
        store.update(|tx| tx.delete(FRUIT, b"fig")).unwrap();
        store.update(|tx| tx.delete(FRUIT, b"fig")).unwrap();
        assert_eq!(store.view(|tx| tx.get(FRUIT, b"fig")).unwrap(), None);
    }
}
