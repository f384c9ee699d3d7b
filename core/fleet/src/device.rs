//! Device inventory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use fleetd_common::{BucketName, Error, Result};
use fleetd_depsync::DepDevice;
use fleetd_storage::{Document, IndexedStore, KvStore};

/// Primary bucket for devices.
pub const DEVICE_BUCKET: BucketName = BucketName::new("mdm.Device");
/// Index bucket mapping uuid, udid and serial number to the device uuid.
pub const DEVICE_INDEX_BUCKET: BucketName = BucketName::new("mdm.DeviceIdx");

/// Enrollment profile state reported by the enrollment program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepProfileStatus {
    #[default]
    Empty,
    Assigned,
    Pushed,
    Removed,
}

impl DepProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepProfileStatus::Empty => "empty",
            DepProfileStatus::Assigned => "assigned",
            DepProfileStatus::Pushed => "pushed",
            DepProfileStatus::Removed => "removed",
        }
    }
}

impl FromStr for DepProfileStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "empty" => Ok(DepProfileStatus::Empty),
            "assigned" => Ok(DepProfileStatus::Assigned),
            "pushed" => Ok(DepProfileStatus::Pushed),
            "removed" => Ok(DepProfileStatus::Removed),
            other => Err(Error::InvalidInput(format!(
                "Unknown profile status: {other}"
            ))),
        }
    }
}

impl fmt::Display for DepProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub uuid: String,
    pub udid: String,
    pub serial_number: String,
    pub os_version: String,
    pub build_version: String,
    pub product_name: String,
    pub imei: String,
    pub meid: String,
    pub mdm_topic: String,
    pub push_magic: String,
    pub awaiting_configuration: bool,
    pub token: Vec<u8>,
    pub unlock_token: Vec<u8>,
    pub enrolled: bool,
    pub dep_device: bool,
    pub description: String,
    pub model: String,
    pub model_name: String,
    pub device_name: String,
    pub color: String,
    pub asset_tag: String,
    pub dep_profile_status: DepProfileStatus,
    pub dep_profile_uuid: String,
    pub dep_profile_assign_time: Option<DateTime<Utc>>,
    pub dep_profile_push_time: Option<DateTime<Utc>>,
    pub dep_profile_assigned_date: Option<DateTime<Utc>>,
    pub dep_profile_assigned_by: String,
    pub last_checkin: Option<DateTime<Utc>>,
}

impl Device {
    /// Refresh the enrollment program attributes from `dep`.
    fn apply_dep(&mut self, dep: &DepDevice) {
        self.dep_device = true;
        // Removal records carry little more than the serial number.
        if dep.op_type.eq_ignore_ascii_case("deleted") {
            self.dep_profile_status = DepProfileStatus::Removed;
            return;
        }

        self.model = dep.model.clone();
        self.description = dep.description.clone();
        self.color = dep.color.clone();
        self.asset_tag = dep.asset_tag.clone();
        self.dep_profile_uuid = dep.profile_uuid.clone();
        self.dep_profile_assign_time = dep.profile_assign_time;
        self.dep_profile_push_time = dep.profile_push_time;
        self.dep_profile_assigned_date = dep.device_assigned_date;
        self.dep_profile_assigned_by = dep.device_assigned_by.clone();

        self.dep_profile_status = dep.profile_status.parse().unwrap_or_else(|e| {
            warn!("Device {}: {}", dep.serial_number, e);
            DepProfileStatus::Empty
        });
    }
}

impl Document for Device {
    const KIND: &'static str = "Device";

    fn id(&self) -> &str {
        &self.uuid
    }

    fn index_keys(&self) -> Vec<&str> {
        vec![&self.uuid, &self.udid, &self.serial_number]
    }

    fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() {
            return Err(Error::InvalidInput("Device must have a uuid".to_string()));
        }
        if self.udid.is_empty() && self.serial_number.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Device {} needs a UDID or a serial number",
                self.uuid
            )));
        }
        Ok(())
    }
}

/// Outcome of merging one device batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Device storage.
pub struct DeviceStore<S> {
    docs: IndexedStore<S, Device>,
}

impl<S> Clone for DeviceStore<S> {
    fn clone(&self) -> Self {
        Self {
            docs: self.docs.clone(),
        }
    }
}

impl<S: KvStore> DeviceStore<S> {
    pub fn open(store: Arc<S>) -> Result<Self> {
        Ok(Self {
            docs: IndexedStore::open(store, DEVICE_BUCKET, DEVICE_INDEX_BUCKET)?,
        })
    }

    pub fn save(&self, device: &Device) -> Result<()> {
        device.validate()?;
        self.docs.put(device)
    }

    /// Look a device up by uuid, UDID or serial number.
    pub fn get(&self, key: &str) -> Result<Device> {
        self.docs.get(key)
    }

    pub fn get_by_serial(&self, serial: &str) -> Result<Device> {
        let device = self.docs.get(serial)?;
        if device.serial_number != serial {
            return Err(Error::NotFound(format!("Device serial {serial}")));
        }
        Ok(device)
    }

    pub fn list(&self) -> Result<Vec<Device>> {
        self.docs.list()
    }

    pub fn delete(&self, key: &str) -> Result<Device> {
        self.docs.delete_with(key, |_, _| Ok(()))
    }

    /// Merge enrollment program records into the inventory by serial number.
    ///
    /// Known devices get their enrollment attributes refreshed, unknown
    /// serials are created with a new uuid. Records reported as deleted are
    /// kept and marked `removed`. Merging the same batch twice changes
    /// nothing the second time.
    pub fn merge_dep_devices(&self, batch: &[DepDevice]) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        for dep in batch {
            if dep.serial_number.is_empty() {
                warn!("Skipping enrollment record without serial number");
                summary.skipped += 1;
                continue;
            }

            let (mut device, existed) = match self.get_by_serial(&dep.serial_number) {
                Ok(device) => (device, true),
                Err(e) if e.is_not_found() => (
                    Device {
                        uuid: Uuid::new_v4().to_string(),
                        serial_number: dep.serial_number.clone(),
                        ..Default::default()
                    },
                    false,
                ),
                Err(e) => return Err(e.context(format_args!("merging device {}", dep.serial_number))),
            };

            let before = device.clone();
            device.apply_dep(dep);
            if existed && device == before {
                summary.unchanged += 1;
                continue;
            }

            self.save(&device)?;
            if existed {
                summary.updated += 1;
            } else {
                summary.created += 1;
            }
        }
        debug!("Merged device batch: {:?}", summary);
        Ok(summary)
    }
}
