//! Fleet entity stores for fleetd.
//!
//! Blueprints, profiles and devices are kept in [`IndexedStore`]s so every
//! lookup key (uuid, name, serial number, ...) resolves through an index
//! that is written in the same transaction as the record itself.
//!
//! [`IndexedStore`]: fleetd_storage::IndexedStore

pub mod blueprint;
pub mod device;
pub mod profile;
pub mod worker;

pub use blueprint::{Blueprint, BlueprintStore, BLUEPRINT_BUCKET, BLUEPRINT_INDEX_BUCKET};
pub use device::{DepProfileStatus, Device, DeviceStore, MergeSummary, DEVICE_BUCKET, DEVICE_INDEX_BUCKET};
pub use profile::{Profile, ProfileStore, PROFILE_BUCKET, PROFILE_INDEX_BUCKET};
pub use worker::{DeviceSyncWorker, WorkerHandle, WorkerStats};
