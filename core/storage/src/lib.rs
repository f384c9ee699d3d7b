//! Storage abstraction for fleetd.
//!
//! This module provides a trait-based interface for embedded transactional
//! key-value stores organised in named buckets, two backends for it, and the
//! indexed document store pattern the entity stores are built on.
//!
//! # Design Principles
//! - One transaction per logical write: index and primary records change together
//! - Synchronous operations: callers are request handlers, not the async runtime
//! - Bytewise key ordering in every backend
//! - Unified error semantics: consistent error types across backends

pub mod store;
pub mod memory;
pub mod sqlite;
pub mod indexed;

pub use store::{Entry, KvStore, ReadTxn, WriteTxn};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use indexed::{Document, IndexedStore};
