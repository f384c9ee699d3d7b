//! Blueprints: named bundles of profiles applied at enrollment triggers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use fleetd_common::{BucketName, Error, Label, Result};
use fleetd_storage::{Document, IndexedStore, KvStore, ReadTxn};

use crate::profile::ProfileStore;

/// Primary bucket for blueprints.
pub const BLUEPRINT_BUCKET: BucketName = BucketName::new("mdm.Blueprint");
/// Index bucket mapping uuid and name to the blueprint uuid.
pub const BLUEPRINT_INDEX_BUCKET: BucketName = BucketName::new("mdm.BlueprintIdx");

/// A named set of profiles to install on devices matching a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Blueprint {
    pub uuid: String,
    pub name: String,
    pub profile_identifiers: Vec<String>,
    pub apply_at: Vec<Label>,
}

impl Blueprint {
    /// A blueprint without a uuid; one is assigned on create.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, identifier: impl Into<String>) -> Self {
        self.profile_identifiers.push(identifier.into());
        self
    }

    pub fn with_trigger(mut self, label: Label) -> Self {
        self.apply_at.push(label);
        self
    }

    /// Returns true if any trigger label matches `label`, ignoring case.
    pub fn applies_at(&self, label: &str) -> bool {
        self.apply_at.iter().any(|l| l.matches(label))
    }
}

impl Document for Blueprint {
    const KIND: &'static str = "Blueprint";

    fn id(&self) -> &str {
        &self.uuid
    }

    fn index_keys(&self) -> Vec<&str> {
        vec![&self.uuid, &self.name]
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("Blueprint must have a name".to_string()));
        }
        if self.uuid.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "Blueprint {} must have a uuid",
                self.name
            )));
        }
        if self.profile_identifiers.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "Blueprint {} has an empty profile identifier",
                self.name
            )));
        }
        if self.apply_at.iter().any(|l| l.as_str().trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "Blueprint {} has an empty trigger label",
                self.name
            )));
        }
        Ok(())
    }
}

/// Names of blueprints that reference `profile`, read inside `tx`.
///
/// Undecodable blueprints abort the check: a profile is only released when
/// every blueprint has been inspected.
pub(crate) fn blueprints_referencing<T: ReadTxn + ?Sized>(
    tx: &T,
    profile: &str,
) -> Result<Vec<String>> {
    let entries = match tx.scan(BLUEPRINT_BUCKET) {
        Ok(entries) => entries,
        Err(Error::BucketNotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    for (key, value) in entries {
        let bp: Blueprint = serde_json::from_slice(&value).map_err(|e| Error::Corrupted {
            bucket: BLUEPRINT_BUCKET.to_string(),
            key: String::from_utf8_lossy(&key).into_owned(),
            reason: e.to_string(),
        })?;
        if bp.profile_identifiers.iter().any(|p| p == profile) {
            names.push(bp.name);
        }
    }
    Ok(names)
}

fn dangling(bp: &Blueprint, identifier: &str) -> Error {
    Error::DanglingReference {
        kind: "Profile",
        reference: identifier.to_string(),
        owner_kind: Blueprint::KIND,
        owner: bp.name.clone(),
    }
}

/// Blueprint storage with profile reference checks.
pub struct BlueprintStore<S> {
    docs: IndexedStore<S, Blueprint>,
    profiles: ProfileStore<S>,
}

impl<S: KvStore> BlueprintStore<S> {
    /// Open the store, creating its buckets if needed.
    pub fn open(store: Arc<S>, profiles: ProfileStore<S>) -> Result<Self> {
        Ok(Self {
            docs: IndexedStore::open(store, BLUEPRINT_BUCKET, BLUEPRINT_INDEX_BUCKET)?,
            profiles,
        })
    }

    /// Create a blueprint whose name is not taken yet.
    ///
    /// A uuid is generated when the blueprint has none. Returns the stored
    /// blueprint.
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is taken
    /// - Any error of [`BlueprintStore::save`]
    pub fn create(&self, mut bp: Blueprint) -> Result<Blueprint> {
        match self.get_by_name(&bp.name) {
            Ok(_) => {
                return Err(Error::AlreadyExists(format!(
                    "Blueprint name {} must be unique",
                    bp.name
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context("creating blueprint")),
        }

        if bp.uuid.is_empty() {
            bp.uuid = Uuid::new_v4().to_string();
        }
        self.save(&bp)?;
        Ok(bp)
    }

    /// Insert or update a blueprint.
    ///
    /// The blueprint is validated and every profile it names must exist
    /// before anything is written. The references are checked again inside
    /// the write transaction, so a profile deleted in between is caught.
    /// Renaming releases the old name.
    ///
    /// # Errors
    /// - `InvalidInput` if validation fails
    /// - `DanglingReference` naming the missing profile and the blueprint
    /// - `AlreadyExists` if the name belongs to another blueprint
    pub fn save(&self, bp: &Blueprint) -> Result<()> {
        bp.validate()?;
        for identifier in &bp.profile_identifiers {
            match self.profiles.get(identifier) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Err(dangling(bp, identifier)),
                Err(e) => return Err(e.context("fetching profile")),
            }
        }

        self.docs.put_with(bp, |tx, bp| {
            for identifier in &bp.profile_identifiers {
                let found = self
                    .profiles
                    .exists_in(tx, identifier)
                    .map_err(|e| e.context("fetching profile"))?;
                if !found {
                    return Err(dangling(bp, identifier));
                }
            }
            Ok(())
        })?;
        info!("Saved blueprint {} ({})", bp.name, bp.uuid);
        Ok(())
    }

    /// # Errors
    /// - `NotFound` if no blueprint has this name
    pub fn get_by_name(&self, name: &str) -> Result<Blueprint> {
        let bp = self.docs.get(name)?;
        if bp.name != name {
            return Err(Error::NotFound(format!("Blueprint name {name}")));
        }
        Ok(bp)
    }

    /// # Errors
    /// - `NotFound` if no blueprint has this uuid
    pub fn get_by_id(&self, uuid: &str) -> Result<Blueprint> {
        let bp = self.docs.get(uuid)?;
        if bp.uuid != uuid {
            return Err(Error::NotFound(format!("Blueprint uuid {uuid}")));
        }
        Ok(bp)
    }

    /// All blueprints in uuid order. Fails on the first undecodable record.
    pub fn list(&self) -> Result<Vec<Blueprint>> {
        self.docs.list()
    }

    /// Blueprints with a trigger label matching `label`, ignoring case.
    ///
    /// This is a linear scan; undecodable records are skipped.
    pub fn list_by_trigger(&self, label: &str) -> Result<Vec<Blueprint>> {
        let found: Vec<_> = self
            .docs
            .scan_lossy()?
            .into_iter()
            .filter(|bp| bp.applies_at(label))
            .collect();
        debug!("{} blueprints apply at {}", found.len(), label);
        Ok(found)
    }

    /// Delete a blueprint by name or uuid, with all of its index entries.
    pub fn delete(&self, key: &str) -> Result<Blueprint> {
        let removed = self.docs.delete_with(key, |_, _| Ok(()))?;
        info!("Deleted blueprint {} ({})", removed.name, removed.uuid);
        Ok(removed)
    }
}
