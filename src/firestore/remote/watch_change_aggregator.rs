use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::target::TargetData;
use crate::firestore::core::types::{TargetId, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about the targets it tracks.
pub trait TargetMetadataProvider {
    /// Keys the views of `target_id` consider part of the last synced result.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data of a target being listened to, `None` once it is removed.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Per-target accumulation between two remote events.
#[derive(Debug)]
struct TargetState {
    /// Add/remove requests sent but not yet answered. Changes for a target
    /// with outstanding requests are ignored.
    pending_responses: usize,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// New targets always produce a change on the next event.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes until the backend reports a consistent
/// snapshot, then turns them into a [`RemoteEvent`].
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each updated document was seen for, used to detect
    /// documents that only changed for limbo targets.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle_document_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: DocumentWatchChange,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(provider, *target_id, document.clone());
                }
                other => self.remove_document_from_target(
                    provider,
                    *target_id,
                    change.key.clone(),
                    other.clone(),
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                provider,
                *target_id,
                change.key.clone(),
                change.new_document.clone(),
            );
        }
    }

    pub fn handle_target_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) {
        for target_id in self.target_ids_for(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A response to the latest add; drop changes that
                        // arrived for an earlier incarnation of the target.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn target_ids_for(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    /// Checks the document count of a target against the backend's count.
    /// On a mismatch the bloom filter, when present, identifies documents
    /// that were deleted while the client was not listening; if that does
    /// not reconcile the counts the target is reset.
    pub fn handle_existence_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
    ) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if let Some(key) = target_data.target.document_key() {
            if expected_count == 0 {
                // The document was deleted while the target was not
                // listened to.
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(provider, target_id, key, Some(deleted));
            } else if expected_count != 1 {
                log::warn!(
                    "Single document existence filter for target {target_id} reported {expected_count} documents"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count == expected_count {
            return;
        }

        let status = self.apply_bloom_filter(provider, change, current_count);
        log::debug!(
            "Existence filter mismatch for target {target_id}: expected {expected_count}, local {current_count}, bloom filter {status:?}"
        );
        if status != BloomFilterApplication::Success {
            self.reset_target(provider, target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
        current_count: usize,
    ) -> BloomFilterApplication {
        let Some(payload) = &change.existence_filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter = match BloomFilter::from_payload(payload) {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!("Applying bloom filter failed: {err}");
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(provider, &bloom_filter, change.target_id);
        if change.existence_filter.count != current_count.saturating_sub(removed) {
            BloomFilterApplication::FalsePositive
        } else {
            BloomFilterApplication::Success
        }
    }

    /// Removes every synced document of `target_id` the bloom filter says
    /// the backend did not count. Returns the number removed.
    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> usize {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = provider.database_id().document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything accumulated so far and resets the
    /// pending state. Targets with outstanding requests are left out.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map_or(false, |state| state.current);
            if current {
                if let Some(key) = target_data.target.document_key() {
                    // A current document target without a document change
                    // means the document does not exist.
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(provider, target_id, &key)
                    {
                        let missing = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, key, Some(missing));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: MutableDocument,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = self.target_contains_document(provider, target_id, &key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed again before an event was raised.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Number of documents the target holds after the pending changes.
    fn current_document_count_for_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        (provider.get_remote_keys_for_target(target_id).len() + change.added_documents.len())
            .saturating_sub(change.removed_documents.len())
    }

    /// Counts an add or remove request sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(provider, target_id)
            .is_some()
    }

    fn target_data_for_active_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        let pending = self
            .target_states
            .get(&target_id)
            .map_or(false, TargetState::is_pending);
        if pending {
            None
        } else {
            provider.get_target_data_for_target(target_id)
        }
    }

    /// Drops everything known about the target: the next event reports all
    /// previously synced documents as removed.
    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, key, None);
        }
    }

    fn target_contains_document(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}
