//! Common utilities and types shared across the fleetd crates.
//!
//! This module provides the workspace error type and the small identifier
//! types that the storage layer and the entity stores agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{BucketName, Label};
