//! # Session Module
//!
//! One session owns one object store and runs module loads against it.
//!
//! A load has two phases:
//! 1. Parse and reconcile every document of the module. This phase is
//!    all-or-nothing: any error rolls the store back to its last commit.
//!    On success the module is marked installed and the store committed.
//! 2. Sweep the orphans, each deletion committed on its own.
//!
//! ## Storage Backends
//!
//! Session supports two storage backends:
//! - `InMemory`: Uses `MemoryStore` (fast, volatile)
//! - `Persistent`: Uses `RedbStore` for disk-backed ACID storage

use crate::dispatcher::StreamingDispatcher;
use crate::primitives::MAX_DOCUMENT_SIZE;
use crate::reconciler::Reconciler;
use crate::registry::Registry;
use crate::report::LoadReport;
use crate::storage::RedbStore;
use crate::store::{MemoryStore, ObjectStore, StoreStats};
use crate::sweeper::OrphanSweeper;
use crate::{ModuleState, ProvenanceRecord, SeedlingError};
use std::collections::BTreeSet;
use std::path::Path;

/// Storage backend for a Session.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory store (fast, volatile).
    InMemory(MemoryStore),
    /// Disk-backed store using redb (ACID, persistent).
    Persistent(RedbStore),
}

/// Knobs of a module load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip `<data skiptest="1">` blocks.
    pub test_mode: bool,
    /// Largest accepted document, in bytes.
    pub max_document_size: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            max_document_size: MAX_DOCUMENT_SIZE,
        }
    }
}

/// A Session runs module loads against a store.
#[derive(Debug)]
pub struct Session {
    backend: StorageBackend,
}

impl Session {
    /// Create a session over an empty in-memory store.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            backend: StorageBackend::InMemory(MemoryStore::new(registry)),
        }
    }

    /// Create a session with persistent redb storage.
    ///
    /// Opens or creates a redb database at the given path.
    pub fn with_redb(path: impl AsRef<Path>, registry: Registry) -> Result<Self, SeedlingError> {
        Ok(Self {
            backend: StorageBackend::Persistent(RedbStore::open(path, registry)?),
        })
    }

    /// Check if using persistent storage.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, StorageBackend::Persistent(_))
    }

    #[must_use]
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// The store, for reads.
    #[must_use]
    pub fn store(&self) -> &dyn ObjectStore {
        match &self.backend {
            StorageBackend::InMemory(store) => store,
            StorageBackend::Persistent(store) => store,
        }
    }

    /// The store, for direct edits outside a load.
    pub fn store_mut(&mut self) -> &mut dyn ObjectStore {
        match &mut self.backend {
            StorageBackend::InMemory(store) => store,
            StorageBackend::Persistent(store) => store,
        }
    }

    /// Store call counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        match &self.backend {
            StorageBackend::InMemory(store) => store.stats(),
            StorageBackend::Persistent(store) => store.stats(),
        }
    }

    /// Reset the store call counters.
    pub fn reset_stats(&self) {
        match &self.backend {
            StorageBackend::InMemory(store) => store.reset_stats(),
            StorageBackend::Persistent(store) => store.reset_stats(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.store().registry()
    }

    /// Modules loaded successfully at least once.
    pub fn installed_modules(&self) -> Result<BTreeSet<String>, SeedlingError> {
        self.store().installed_modules()
    }

    /// Lifecycle state the next load of `module` runs in.
    pub fn module_state(&self, module: &str) -> Result<ModuleState, SeedlingError> {
        Ok(if self.installed_modules()?.contains(module) {
            ModuleState::ToUpgrade
        } else {
            ModuleState::ToInstall
        })
    }

    /// Provenance rows tracked for `module`.
    pub fn provenance(&self, module: &str) -> Result<Vec<ProvenanceRecord>, SeedlingError> {
        self.store().provenance(module)
    }

    /// Load `documents`, in order, as the data of `module`.
    pub fn load_module(
        &mut self,
        module: &str,
        documents: &[&[u8]],
        options: LoadOptions,
    ) -> Result<LoadReport, SeedlingError> {
        let state = self.module_state(module)?;
        match &mut self.backend {
            StorageBackend::InMemory(store) => load_into(store, module, state, documents, options),
            StorageBackend::Persistent(store) => {
                load_into(store, module, state, documents, options)
            }
        }
    }

    /// Read and load document files as the data of `module`.
    pub fn load_files(
        &mut self,
        module: &str,
        paths: &[impl AsRef<Path>],
        options: LoadOptions,
    ) -> Result<LoadReport, SeedlingError> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let size = std::fs::metadata(path)
                .map_err(|e| SeedlingError::IoError(format!("{}: {}", path.display(), e)))?
                .len();
            if size > options.max_document_size {
                return Err(SeedlingError::Structural(format!(
                    "{} has {} bytes, more than the limit of {} bytes",
                    path.display(),
                    size,
                    options.max_document_size
                )));
            }
            let content = std::fs::read(path)
                .map_err(|e| SeedlingError::IoError(format!("{}: {}", path.display(), e)))?;
            documents.push(content);
        }
        let documents: Vec<&[u8]> = documents.iter().map(Vec::as_slice).collect();
        self.load_module(module, &documents, options)
    }
}

fn load_into<S: ObjectStore>(
    store: &mut S,
    module: &str,
    state: ModuleState,
    documents: &[&[u8]],
    options: LoadOptions,
) -> Result<LoadReport, SeedlingError> {
    let known = store.installed_modules()?;
    tracing::info!("Loading module {} ({:?})", module, state);

    let (mut report, to_delete) = match parse_phase(store, module, state, documents, options, known)
    {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!("Load of module {} failed: {}", module, err);
            store.rollback()?;
            return Err(err);
        }
    };
    store.mark_installed(module)?;
    store.commit()?;

    report.sweep = OrphanSweeper::new(store).sweep(module, &to_delete)?;
    tracing::info!(
        "Module {} loaded: {} created, {} updated, {} unchanged, {} orphans deleted",
        module,
        report.created,
        report.updated,
        report.unchanged,
        report.sweep.deleted.len()
    );
    Ok(report)
}

fn parse_phase<S: ObjectStore>(
    store: &mut S,
    module: &str,
    state: ModuleState,
    documents: &[&[u8]],
    options: LoadOptions,
    installed: BTreeSet<String>,
) -> Result<(LoadReport, BTreeSet<String>), SeedlingError> {
    let mut reconciler = Reconciler::new(store, module, state)?;
    let mut dispatcher = StreamingDispatcher::new(installed)
        .with_test_mode(options.test_mode)
        .with_max_document_size(options.max_document_size);
    for document in documents {
        dispatcher.parse_bytes(&mut reconciler, document)?;
    }
    reconciler.finish()
}

// =============================================================================
// TESTS
// =============================================================================
