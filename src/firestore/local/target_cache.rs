use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::{Target, TargetData};
use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct TargetTable {
    pub(crate) targets: BTreeMap<TargetId, TargetData>,
    pub(crate) target_documents: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    /// Last sequence number at which each unpinned document was referenced.
    #[serde(with = "crate::firestore::util::serde_entries")]
    pub(crate) document_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
    pub(crate) highest_target_id: TargetId,
    pub(crate) highest_listen_sequence_number: ListenSequenceNumber,
    pub(crate) last_remote_snapshot_version: SnapshotVersion,
}

impl TargetTable {
    pub(crate) fn contains_key(&self, key: &DocumentKey) -> bool {
        self.target_documents.values().any(|keys| keys.contains(key))
    }
}

/// Persisted listen targets and the documents the backend reported for each.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn get_target_data(&self, txn: &PersistenceTransaction, target: &Target) -> Option<TargetData> {
        txn.targets()
            .targets
            .values()
            .find(|data| data.target == *target)
            .cloned()
    }

    pub fn get_target_data_for_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> Option<TargetData> {
        txn.targets().targets.get(&target_id).cloned()
    }

    pub fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        if txn.targets().targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Target {} is already cached",
                target_data.target_id
            )));
        }
        self.save_target_data(txn, target_data);
        Ok(())
    }

    pub fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        if !txn.targets().targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Cannot update unknown target {}",
                target_data.target_id
            )));
        }
        self.save_target_data(txn, target_data);
        Ok(())
    }

    /// Removes the target and its document associations.
    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) {
        let target_id = target_data.target_id;
        if !txn.targets().targets.contains_key(&target_id)
            && !txn.targets().target_documents.contains_key(&target_id)
        {
            return;
        }
        let table = txn.targets_mut();
        table.targets.remove(&target_id);
        let keys = table.target_documents.remove(&target_id).unwrap_or_default();
        for key in keys {
            txn.remove_reference(target_id, &key);
        }
    }

    /// Removes every inactive target last used at or before `upper_bound`.
    /// Returns the number of targets removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let doomed: Vec<TargetData> = txn
            .targets()
            .targets
            .values()
            .filter(|data| data.sequence_number <= upper_bound)
            .filter(|data| !active_target_ids.contains(&data.target_id))
            .cloned()
            .collect();
        for target_data in &doomed {
            self.remove_target_data(txn, target_data);
        }
        doomed.len()
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction) -> usize {
        txn.targets().targets.len()
    }

    pub fn highest_target_id(&self, txn: &PersistenceTransaction) -> TargetId {
        txn.targets().highest_target_id
    }

    pub fn highest_listen_sequence_number(&self, txn: &PersistenceTransaction) -> ListenSequenceNumber {
        txn.targets().highest_listen_sequence_number
    }

    pub fn last_remote_snapshot_version(&self, txn: &PersistenceTransaction) -> SnapshotVersion {
        txn.targets().last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction,
        version: SnapshotVersion,
    ) {
        txn.targets_mut().last_remote_snapshot_version = version;
    }

    pub fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) {
        if keys.is_empty() {
            return;
        }
        txn.targets_mut()
            .target_documents
            .entry(target_id)
            .or_default()
            .extend(keys.iter().cloned());
        for key in keys {
            txn.add_reference(target_id, key);
        }
    }

    pub fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) {
        if keys.is_empty() {
            return;
        }
        if let Some(existing) = txn.targets_mut().target_documents.get_mut(&target_id) {
            for key in keys {
                existing.remove(key);
            }
        }
        for key in keys {
            txn.remove_reference(target_id, key);
        }
    }

    pub fn remove_matching_keys_for_target_id(&self, txn: &mut PersistenceTransaction, target_id: TargetId) {
        let keys = self.get_matching_keys_for_target_id(txn, target_id);
        self.remove_matching_keys(txn, &keys, target_id);
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> BTreeSet<DocumentKey> {
        txn.targets()
            .target_documents
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> bool {
        txn.targets().contains_key(key)
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) {
        let table = txn.targets_mut();
        table.highest_target_id = table.highest_target_id.max(target_data.target_id);
        table.highest_listen_sequence_number = table
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        table
            .targets
            .insert(target_data.target_id, target_data.clone());
    }
}
