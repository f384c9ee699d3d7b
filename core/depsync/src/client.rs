//! Enrollment program API client abstraction.
//!
//! The HTTP client for the vendor API lives outside this crate; the engine
//! only needs paged `fetch` and `sync` calls and a closed set of error kinds
//! to drive its phase transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

/// Vendor error code reported when a fetch cursor has reached the end.
pub const EXHAUSTED_CURSOR: &str = "EXHAUSTED_CURSOR";

/// Vendor error code reported when a sync cursor is too old to use.
pub const EXPIRED_CURSOR: &str = "EXPIRED_CURSOR";

/// A device record as returned by the enrollment program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepDevice {
    pub serial_number: String,
    pub model: String,
    pub description: String,
    pub color: String,
    pub asset_tag: String,
    pub profile_status: String,
    pub profile_uuid: String,
    pub profile_assign_time: Option<DateTime<Utc>>,
    pub profile_push_time: Option<DateTime<Utc>>,
    pub device_assigned_date: Option<DateTime<Utc>>,
    pub device_assigned_by: String,
    pub os: String,
    pub device_family: String,
    /// Sync responses only: "added", "modified" or "deleted".
    pub op_type: String,
    pub op_date: Option<DateTime<Utc>>,
}

/// One page of results from `fetch` or `sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceResponse {
    pub devices: Vec<DepDevice>,
    pub cursor: String,
    pub more_to_follow: bool,
    pub fetched_until: Option<DateTime<Utc>>,
}

/// Errors returned by an [`EnrollmentClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The fetch cursor has no more devices behind it.
    #[error("cursor exhausted")]
    ExhaustedCursor,

    /// The cursor is too old for the sync endpoint.
    #[error("cursor expired")]
    ExpiredCursor,

    /// Anything else: network, authentication, malformed responses.
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Classify a vendor error code.
    ///
    /// Client implementations call this on the `error_code` field of a
    /// failed response so the engine never has to look at message text.
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            EXHAUSTED_CURSOR => ClientError::ExhaustedCursor,
            EXPIRED_CURSOR => ClientError::ExpiredCursor,
            _ if message.is_empty() => ClientError::Other(code.to_string()),
            _ => ClientError::Other(format!("{code}: {message}")),
        }
    }
}

/// Paged access to the enrollment program's device roster.
#[async_trait]
pub trait EnrollmentClient: Send + Sync {
    /// Fetch up to `limit` devices after `cursor` (empty = from the start).
    ///
    /// # Errors
    /// - `ExhaustedCursor` once there is nothing more to fetch
    async fn fetch_devices(&self, cursor: &str, limit: u32) -> Result<DeviceResponse, ClientError>;

    /// Fetch changes since `cursor`.
    ///
    /// # Errors
    /// - `ExpiredCursor` if the cursor must be replaced by a new fetch
    async fn sync_devices(&self, cursor: &str) -> Result<DeviceResponse, ClientError>;
}

/// A call observed by [`ScriptedClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Fetch { cursor: String, limit: u32 },
    Sync { cursor: String },
}

/// One scripted reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Return this page.
    Page(DeviceResponse),
    /// Fail with a vendor error code.
    Error {
        code: String,
        #[serde(default)]
        message: String,
    },
}

impl Step {
    fn into_result(self) -> Result<DeviceResponse, ClientError> {
        match self {
            Step::Page(page) => Ok(page),
            Step::Error { code, message } => Err(ClientError::from_code(&code, &message)),
        }
    }
}

/// A replayable script for [`ScriptedClient`], usually loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub fetch: Vec<Step>,
    pub sync: Vec<Step>,
}

/// An enrollment client that replays scripted replies.
///
/// Once the fetch script runs out every fetch reports an exhausted cursor;
/// once the sync script runs out every sync returns an empty page that keeps
/// the cursor it was given.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    fetch: Mutex<VecDeque<Result<DeviceResponse, ClientError>>>,
    sync: Mutex<VecDeque<Result<DeviceResponse, ClientError>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedClient {
    /// Creates a client with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client from a script.
    pub fn from_script(script: Script) -> Self {
        let client = Self::new();
        for step in script.fetch {
            client.push_fetch(step.into_result());
        }
        for step in script.sync {
            client.push_sync(step.into_result());
        }
        client
    }

    /// Parses a JSON script.
    pub fn from_json(json: &str) -> fleetd_common::Result<Self> {
        let script: Script = serde_json::from_str(json)?;
        Ok(Self::from_script(script))
    }

    /// Queues a reply for the next fetch.
    pub fn push_fetch(&self, reply: Result<DeviceResponse, ClientError>) {
        self.fetch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    /// Queues a reply for the next sync.
    pub fn push_sync(&self, reply: Result<DeviceResponse, ClientError>) {
        self.sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl EnrollmentClient for ScriptedClient {
    async fn fetch_devices(&self, cursor: &str, limit: u32) -> Result<DeviceResponse, ClientError> {
        self.record(Call::Fetch {
            cursor: cursor.to_string(),
            limit,
        });
        let next = self.fetch.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or(Err(ClientError::ExhaustedCursor))
    }

    async fn sync_devices(&self, cursor: &str) -> Result<DeviceResponse, ClientError> {
        self.record(Call::Sync {
            cursor: cursor.to_string(),
        });
        let next = self.sync.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or_else(|| {
            Ok(DeviceResponse {
                cursor: cursor.to_string(),
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(
            ClientError::from_code("EXHAUSTED_CURSOR", "no more"),
            ClientError::ExhaustedCursor
        );
        assert_eq!(
            ClientError::from_code("EXPIRED_CURSOR", ""),
            ClientError::ExpiredCursor
        );
        assert_eq!(
            ClientError::from_code("MALFORMED_CURSOR", "bad"),
            ClientError::Other("MALFORMED_CURSOR: bad".to_string())
        );
    }

    #[tokio::test]
    async fn test_scripted_client_from_json() {
        let json = r#"{
            "fetch": [
                {"page": {"cursor": "C1", "more_to_follow": true,
                          "devices": [{"serial_number": "C02AAA", "model": "MacBook Pro"}]}},
                {"error": {"code": "EXHAUSTED_CURSOR"}}
            ],
            "sync": [
                {"error": {"code": "EXPIRED_CURSOR"}}
            ]
        }"#;
        let client = ScriptedClient::from_json(json).unwrap();

        let page = client.fetch_devices("", 100).await.unwrap();
        assert_eq!(page.cursor, "C1");
        assert_eq!(page.devices[0].serial_number, "C02AAA");

        assert_eq!(
            client.fetch_devices("C1", 100).await.unwrap_err(),
            ClientError::ExhaustedCursor
        );
        assert_eq!(
            client.sync_devices("C1").await.unwrap_err(),
            ClientError::ExpiredCursor
        );

        // Scripts exhausted: defaults take over.
        assert_eq!(
            client.fetch_devices("C1", 100).await.unwrap_err(),
            ClientError::ExhaustedCursor
        );
        assert_eq!(client.sync_devices("C9").await.unwrap().cursor, "C9");

        assert_eq!(client.calls().len(), 5);
        assert_eq!(
            client.calls()[0],
            Call::Fetch {
                cursor: String::new(),
                limit: 100
            }
        );
    }
}
