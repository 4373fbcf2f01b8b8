use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::SnapshotVersion;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
}

/// Query saved under a name by a loaded bundle, with the time its results
/// were read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct BundleTable {
    pub(crate) bundles: BTreeMap<String, BundleMetadata>,
    pub(crate) named_queries: BTreeMap<String, NamedQuery>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BundleCache;

impl BundleCache {
    pub fn get_bundle_metadata(
        &self,
        txn: &PersistenceTransaction,
        bundle_id: &str,
    ) -> Option<BundleMetadata> {
        txn.bundles().bundles.get(bundle_id).cloned()
    }

    pub fn save_bundle_metadata(&self, txn: &mut PersistenceTransaction, metadata: &BundleMetadata) {
        txn.bundles_mut()
            .bundles
            .insert(metadata.id.clone(), metadata.clone());
    }

    pub fn get_named_query(&self, txn: &PersistenceTransaction, name: &str) -> Option<NamedQuery> {
        txn.bundles().named_queries.get(name).cloned()
    }

    pub fn save_named_query(&self, txn: &mut PersistenceTransaction, query: &NamedQuery) {
        txn.bundles_mut()
            .named_queries
            .insert(query.name.clone(), query.clone());
    }
}
