//! # seedling-core
//!
//! Declarative data loader for Seedling modules.
//!
//! A module ships documents declaring records under stable symbolic ids.
//! Loading a module synchronizes an object store with those declarations:
//! - new ids are created and tracked with a provenance row
//! - tracked ids are updated field by field, except fields a user changed
//!   by hand since the last load
//! - tracked ids no longer declared are deleted (or deactivated)
//!
//! ## Architecture
//!
//! - `dispatcher` streams a document and routes events to `handlers`
//! - `reconciler` runs the three-way merge, resolving ids through `resolver`
//! - `sweeper` removes orphans after the parse phase
//! - `store` is the object store interface, with an in-memory backend;
//!   `storage` holds the redb-backed one
//! - `session` ties one store to module loads
//!
//! The crate is synchronous and performs no network I/O.

// =============================================================================
// MODULES
// =============================================================================

pub mod dispatcher;
pub mod expression;
pub mod formats;
pub mod handlers;
pub mod primitives;
pub mod reconciler;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    DbId, FieldValue, FieldValueMap, ModuleState, NewProvenance, ProvenanceRecord,
    ProvenanceRowId, ProvenanceUpdate, Record, SeedlingError, SymbolicId,
};

// =============================================================================
// RE-EXPORTS: Loading
// =============================================================================

pub use dispatcher::StreamingDispatcher;
pub use handlers::{Attributes, MenuitemHandler, Next, RecordHandler, TagHandler};
pub use reconciler::Reconciler;
pub use report::{LoadReport, OrphanFailure, PreservedField, SweepReport};
pub use resolver::IdentityResolver;
pub use session::{LoadOptions, Session, StorageBackend};
pub use sweeper::OrphanSweeper;

// =============================================================================
// RE-EXPORTS: Stores
// =============================================================================

pub use registry::{FieldDef, FieldKind, ModelDef, OnDelete, Registry};
pub use storage::RedbStore;
pub use store::{
    Context, ContextOverride, Domain, MemoryStore, ObjectStore, Operator, SearchOrder, StoreStats,
    scoped,
};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::PersistenceHeader;
