//! # Formats
//!
//! Binary encoding of stored values.

pub mod persistence;

pub use persistence::{MAX_PERSISTENCE_PAYLOAD_SIZE, PersistenceHeader, decode, encode};
