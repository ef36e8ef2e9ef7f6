//! # Load Reports
//!
//! Outcome of one module load: what the reconciler did, which user edits it
//! preserved, and what the orphan sweep removed or could not remove.

use crate::DbId;
use serde::Serialize;

/// A field left untouched because its live value diverged from the last sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreservedField {
    pub symbolic_id: String,
    pub model: String,
    pub db_id: DbId,
    pub field: String,
}

/// An orphan whose deletion failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanFailure {
    pub symbolic_id: String,
    pub model: String,
    pub db_id: DbId,
    pub reason: String,
    /// Whether the record was deactivated instead.
    pub deactivated: bool,
}

/// Outcome of the orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Symbolic ids whose records and provenance were deleted.
    pub deleted: Vec<String>,
    /// Deletions that failed, in processing order.
    pub failed: Vec<OrphanFailure>,
    /// Symbolic ids left alone because their model is no longer registered.
    pub stale: Vec<String>,
}

impl SweepReport {
    /// Symbolic ids that were soft-deleted after a failed deletion.
    pub fn deactivated(&self) -> impl Iterator<Item = &str> {
        self.failed
            .iter()
            .filter(|failure| failure.deactivated)
            .map(|failure| failure.symbolic_id.as_str())
    }
}

/// Outcome of one module load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub module: String,
    /// Records created (including grouped creations).
    pub created: usize,
    /// Existing records that received at least one field update.
    pub updated: usize,
    /// Existing records that needed no change.
    pub unchanged: usize,
    /// Tracked records re-created because their backing record was gone.
    pub recreated: usize,
    /// Existing records skipped because their block suppresses updates.
    pub suppressed: usize,
    /// Fields kept at their user-modified value.
    pub preserved: Vec<PreservedField>,
    pub sweep: SweepReport,
}

impl LoadReport {
    #[must_use]
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            ..Self::default()
        }
    }

    /// Total number of records declared by the load's documents.
    #[must_use]
    pub fn declared(&self) -> usize {
        self.created + self.updated + self.unchanged + self.suppressed
    }
}
