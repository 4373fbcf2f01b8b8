pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_delegate;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::firestore::core::settings::{FirestoreSettings, PersistenceSettings};
use crate::firestore::util::log::{warn_once, LOGGER};

#[doc(inline)]
pub use bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
#[doc(inline)]
pub use local_documents_view::{DocumentMap, LocalDocumentsView};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use persistence::{
    run_transaction, FilePersistence, MemoryPersistence, Persistence, PersistenceArc, PersistenceTransaction,
    TransactionMode,
};
#[doc(inline)]
pub use query_engine::{QueryEngine, QueryEngineResult, QueryStrategy};
#[doc(inline)]
pub use reference_delegate::{LruParams, LruResults, CACHE_SIZE_UNLIMITED};

static PERSISTENCE_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

/// Opens and starts the persistence the settings ask for. When durable
/// storage cannot be opened the client keeps running on volatile storage.
pub async fn open_persistence(settings: &FirestoreSettings) -> PersistenceArc {
    match settings.persistence() {
        PersistenceSettings::Memory => start_memory_persistence().await,
        PersistenceSettings::Durable {
            directory,
            force_ownership,
        } => {
            let durable = Arc::new(FilePersistence::new(
                directory.clone(),
                *force_ownership,
                LruParams::with_cache_size(settings.cache_size_bytes()),
            ));
            match durable.start().await {
                Ok(()) => {
                    LOGGER.debug(format!("Using durable persistence in {}", directory.display()));
                    durable
                }
                Err(err) => {
                    warn_once(
                        &PERSISTENCE_FALLBACK_WARNED,
                        format!(
                            "Error enabling durable persistence in {}: {err}. Falling back to memory persistence; writes will be lost when the client shuts down.",
                            directory.display()
                        ),
                    );
                    start_memory_persistence().await
                }
            }
        }
    }
}

async fn start_memory_persistence() -> PersistenceArc {
    let memory = Arc::new(MemoryPersistence::with_eager_gc());
    if let Err(err) = memory.start().await {
        // Starting volatile storage only flips a flag.
        LOGGER.error(format!("Failed to start memory persistence: {err}"));
    }
    memory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unusable_directory_falls_back_to_memory() {
        let blocker = std::env::temp_dir().join(format!("firestore-sync-fallback-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let settings = FirestoreSettings::builder()
            .persistence(PersistenceSettings::Durable {
                directory: blocker.join("cache"),
                force_ownership: false,
            })
            .build()
            .unwrap();

        let persistence = open_persistence(&settings).await;
        assert!(!persistence.is_durable());
        assert!(persistence.is_started());
        let _ = std::fs::remove_file(&blocker);
    }
}
