//! # Storage Backends
//!
//! Persistent implementations of `ObjectStore`.

pub mod redb_store;

pub use redb_store::RedbStore;
