//! Common types used throughout fleetd.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a partition ("bucket") inside the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketName(&'static str);

impl BucketName {
    /// Create a bucket name.
    ///
    /// Bucket names are compile-time constants (`mdm.Blueprint`,
    /// `mdm.DEPConfig`, ...), so this is `const` and infallible. An empty
    /// name is rejected by [`BucketName::validate`] when the bucket is
    /// created.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Check that the name is usable as a bucket.
    pub fn validate(&self) -> crate::Result<()> {
        if self.0.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Bucket name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trigger label such as an enrollment hook name.
///
/// Labels keep the spelling they were created with but compare
/// case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Create a label.
    ///
    /// # Errors
    /// - Returns error if the label is empty or only whitespace
    pub fn new(label: impl Into<String>) -> crate::Result<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Label cannot be empty".to_string(),
            ));
        }
        Ok(Self(label))
    }

    /// Get the label as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a raw string.
    pub fn matches(&self, other: &str) -> bool {
        self.0.to_lowercase() == other.to_lowercase()
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for Label {}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
