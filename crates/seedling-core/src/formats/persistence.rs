//! # Persistence Format
//!
//! Binary serialization for values kept by the persistent store.
//!
//! Format: Header (5 bytes) + postcard-serialized payload.
//! - 4 bytes: Magic ("SEED")
//! - 1 byte: Version
//!
//! Every record and provenance row written to redb goes through `encode`,
//! and every read goes through `decode`, so a database written by an
//! incompatible build is rejected instead of misread.
//!
//! ## Limits
//!
//! - Maximum payload size (`MAX_PERSISTENCE_PAYLOAD_SIZE`)
//! - Header validation before payload parsing

use crate::{SeedlingError, primitives};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum allowed payload size for a single encoded value (64 MB).
///
/// Validated BEFORE attempting deserialization.
pub const MAX_PERSISTENCE_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Header length in bytes.
const HEADER_SIZE: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The persistence header precedes every encoded value.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    /// Create a new header with current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    /// Validate the header.
    pub fn validate(&self) -> Result<(), SeedlingError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(SeedlingError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(SeedlingError::DeserializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    /// Write header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    /// Read header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SeedlingError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SeedlingError::DeserializationError(
                "Header too short".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for PersistenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Serialize a value to bytes (header + payload).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SeedlingError> {
    let payload =
        postcard::to_stdvec(value).map_err(|e| SeedlingError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&PersistenceHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize a value from bytes.
///
/// Size and header are validated before the payload is parsed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SeedlingError> {
    if bytes.len() > MAX_PERSISTENCE_PAYLOAD_SIZE {
        return Err(SeedlingError::DeserializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_PERSISTENCE_PAYLOAD_SIZE
        )));
    }

    let header = PersistenceHeader::from_bytes(bytes)?;
    header.validate()?;

    postcard::from_bytes(&bytes[HEADER_SIZE..]).map_err(|e| {
        SeedlingError::DeserializationError(format!("Failed to deserialize value: {}", e))
    })
}

// =============================================================================
// TESTS
// =============================================================================
