//! Common error types for fleetd.

use thiserror::Error;

/// Top-level error type for fleetd operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying key-value store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A transaction referenced a bucket that was never created.
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An entity references another entity that does not exist.
    #[error("{kind} ID {reference} in {owner_kind} {owner} does not exist")]
    DanglingReference {
        /// Kind of the missing entity (e.g. "Profile").
        kind: &'static str,
        /// The identifier that did not resolve.
        reference: String,
        /// Kind of the entity carrying the reference.
        owner_kind: &'static str,
        /// Name of the entity carrying the reference.
        owner: String,
    },

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A stored record could not be decoded.
    #[error("Corrupted record {key:?} in {bucket}: {reason}")]
    Corrupted {
        /// Bucket holding the record.
        bucket: String,
        /// Key of the record.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// An index entry points at a record that is missing or disagrees with it.
    #[error("Index {index} entry {key:?} points to {id:?}: {reason}")]
    IndexCorrupted {
        /// Index bucket.
        index: String,
        /// Alternate key that was looked up.
        key: String,
        /// Primary id the index resolved to.
        id: String,
        /// What is wrong with the target.
        reason: String,
    },

    /// The enrollment program API returned an unrecoverable error.
    #[error("Enrollment API error: {0}")]
    Enrollment(String),

    /// Publishing onto the event bus failed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    /// Returns true for the "no such name/id" case.
    ///
    /// Callers use this to choose between create and update flows.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true when stored state is inconsistent or undecodable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupted { .. } | Error::IndexCorrupted { .. })
    }

    /// Prefix a system error with the operation that failed.
    ///
    /// Only backend and serialization failures are rewritten; errors that
    /// callers branch on (not-found, duplicates, corruption, ...) keep their
    /// exact shape.
    pub fn context(self, operation: impl std::fmt::Display) -> Self {
        match self {
            Error::Storage(msg) => Error::Storage(format!("{operation}: {msg}")),
            Error::Serialization(msg) => Error::Serialization(format!("{operation}: {msg}")),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_reference_names_both_sides() {
        let err = Error::DanglingReference {
            kind: "Profile",
            reference: "p1".to_string(),
            owner_kind: "Blueprint",
            owner: "prod".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("p1"));
        assert!(msg.contains("prod"));
    }

    #[test]
    fn test_classification() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::NotFound("x".into()).is_corruption());

        let err = Error::IndexCorrupted {
            index: "mdm.BlueprintIdx".into(),
            key: "base".into(),
            id: "1234".into(),
            reason: "primary record missing".into(),
        };
        assert!(err.is_corruption());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_context_keeps_classification() {
        let err = Error::Storage("disk full".into()).context("saving blueprint");
        assert_eq!(err.to_string(), "Storage error: saving blueprint: disk full");

        let err = Error::NotFound("Blueprint name base".into()).context("saving blueprint");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: Blueprint name base");
    }
}
