//! Configuration profiles.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use fleetd_common::{BucketName, Error, Result};
use fleetd_storage::{Document, IndexedStore, KvStore, ReadTxn};

use crate::blueprint::blueprints_referencing;

/// Primary bucket for profiles.
pub const PROFILE_BUCKET: BucketName = BucketName::new("mdm.Profile");
/// Index bucket for profiles.
pub const PROFILE_INDEX_BUCKET: BucketName = BucketName::new("mdm.ProfileIdx");

/// A configuration profile, identified by its payload identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub identifier: String,
    /// Raw `.mobileconfig` payload.
    pub mobileconfig: Vec<u8>,
}

impl Profile {
    pub fn new(identifier: impl Into<String>, mobileconfig: Vec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            mobileconfig,
        }
    }
}

impl Document for Profile {
    const KIND: &'static str = "Profile";

    fn id(&self) -> &str {
        &self.identifier
    }

    fn index_keys(&self) -> Vec<&str> {
        vec![&self.identifier]
    }

    fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Profile must have a payload identifier".to_string(),
            ));
        }
        if self.mobileconfig.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Profile {} has an empty payload",
                self.identifier
            )));
        }
        Ok(())
    }
}

/// Profile storage.
pub struct ProfileStore<S> {
    docs: IndexedStore<S, Profile>,
}

impl<S> Clone for ProfileStore<S> {
    fn clone(&self) -> Self {
        Self {
            docs: self.docs.clone(),
        }
    }
}

impl<S: KvStore> ProfileStore<S> {
    pub fn open(store: Arc<S>) -> Result<Self> {
        Ok(Self {
            docs: IndexedStore::open(store, PROFILE_BUCKET, PROFILE_INDEX_BUCKET)?,
        })
    }

    /// Insert or replace a profile.
    pub fn save(&self, profile: &Profile) -> Result<()> {
        profile.validate()?;
        self.docs.put(profile)?;
        info!("Saved profile {}", profile.identifier);
        Ok(())
    }

    /// # Errors
    /// - `NotFound` if no profile has this identifier
    pub fn get(&self, identifier: &str) -> Result<Profile> {
        self.docs.get(identifier)
    }

    pub fn list(&self) -> Result<Vec<Profile>> {
        self.docs.list()
    }

    /// Returns true if `identifier` resolves to a profile inside `tx`.
    pub(crate) fn exists_in<T: ReadTxn + ?Sized>(&self, tx: &T, identifier: &str) -> Result<bool> {
        match self.docs.resolve(tx, identifier) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a profile.
    ///
    /// # Errors
    /// - `NotFound` if no profile has this identifier
    /// - `NotPermitted` while any blueprint references it
    pub fn delete(&self, identifier: &str) -> Result<Profile> {
        let removed = self.docs.delete_with(identifier, |tx, profile| {
            let users = blueprints_referencing(tx, &profile.identifier)?;
            if users.is_empty() {
                return Ok(());
            }
            Err(Error::NotPermitted(format!(
                "Profile {} is used by blueprint(s) {}",
                profile.identifier,
                users.join(", ")
            )))
        })?;
        info!("Deleted profile {}", removed.identifier);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_storage::MemoryStore;

    #[test]
    fn test_save_and_get() {
        let profiles = ProfileStore::open(Arc::new(MemoryStore::new())).unwrap();
        let p = Profile::new("com.example.wifi", b"<plist/>".to_vec());
        profiles.save(&p).unwrap();

        assert_eq!(profiles.get("com.example.wifi").unwrap(), p);
        assert_eq!(profiles.list().unwrap().len(), 1);
        assert!(profiles.get("com.example.vpn").unwrap_err().is_not_found());
    }

    #[test]
    fn test_validation() {
        let profiles = ProfileStore::open(Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            profiles.save(&Profile::new(" ", b"x".to_vec())),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            profiles.save(&Profile::new("com.example.wifi", Vec::new())),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_delete_unreferenced() {
        let profiles = ProfileStore::open(Arc::new(MemoryStore::new())).unwrap();
        profiles
            .save(&Profile::new("com.example.wifi", b"<plist/>".to_vec()))
            .unwrap();

        profiles.delete("com.example.wifi").unwrap();
        assert!(profiles.get("com.example.wifi").unwrap_err().is_not_found());
        assert!(profiles.delete("com.example.wifi").unwrap_err().is_not_found());
    }
}
