//! Enrollment program device sync for fleetd.
//!
//! This crate provides:
//! - The [`EnrollmentClient`] abstraction with typed cursor errors
//! - Persistent cursor storage ([`CursorStore`])
//! - The two-phase fetch/sync engine ([`DepSyncer`]) and its [`SyncHandle`]
//! - [`SyncEvent`], the device batch published on [`SYNC_TOPIC`]

pub mod client;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod event;

pub use client::{
    Call, ClientError, DepDevice, DeviceResponse, EnrollmentClient, Script, ScriptedClient, Step,
};
pub use config::SyncConfig;
pub use cursor::{Cursor, CursorStore, CONFIG_BUCKET};
pub use engine::{DepSyncer, Phase, SyncHandle, SyncStatus};
pub use event::{SyncEvent, SYNC_TOPIC};
