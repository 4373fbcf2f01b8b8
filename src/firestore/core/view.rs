use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{
    DocumentChangeSet, DocumentViewChange, DocumentViewChangeType, SyncState, ViewSnapshot,
};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::DocumentMap;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::TargetChange;

/// A document entering or leaving limbo: it is in the view but the backend
/// has not confirmed that it belongs to the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A document left a limited view and the view must be recomputed from
    /// the local store to find its replacement.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side result set of one query, computed from local documents and
/// the target state reported by the backend.
#[derive(Debug)]
pub struct View {
    query: Query,
    document_set: DocumentSet,
    mutated_keys: BTreeSet<DocumentKey>,
    sync_state: Option<SyncState>,
    current: bool,
    limbo_documents: BTreeSet<DocumentKey>,
    /// Keys the backend reported for the target.
    synced_documents: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            document_set: DocumentSet::new(&query),
            query,
            mutated_keys: BTreeSet::new(),
            sync_state: None,
            current: false,
            limbo_documents: BTreeSet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Snapshot of the current contents as if every document was just added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            &self.query,
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    /// Works out how `doc_changes` would change the view. Pass the result of
    /// a previous call as `previous` to layer a refill on top of it.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let at_limit = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() == limit as usize);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(
                                DocumentViewChangeType::Modified,
                                new.clone(),
                            ))?;
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| old_document_set.compare(new, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| old_document_set.compare(new, first) == Ordering::Less);
                            if past_last || before_first {
                                // The modified document may have moved past
                                // documents the view never loaded.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(
                            DocumentViewChangeType::Metadata,
                            new.clone(),
                        ))?;
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(DocumentViewChangeType::Added, new.clone()))?;
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(DocumentViewChangeType::Removed, old.clone()))?;
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        document_set.add(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let dropped = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(dropped) = dropped else { break };
                document_set.delete(dropped.key());
                mutated_keys.remove(dropped.key());
                change_set.track(DocumentViewChange::new(DocumentViewChangeType::Removed, dropped))?;
            }
        }

        Ok(ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        })
    }

    /// Applies changes computed by [`View::compute_doc_changes`] and returns
    /// a snapshot when listeners have something new to see.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| self.document_set.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                old_documents,
                changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                exclude_metadata_changes: false,
                has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
            }),
            limbo_changes,
        }
    }

    /// Going offline makes a current view report cached results until the
    /// backend marks the target current again.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else { return };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            debug_assert!(
                self.synced_documents.contains(key),
                "Modified document {key} not found in view"
            );
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        // Documents with local writes are shown until the write is
        // acknowledged or rejected.
        self.document_set
            .get(key)
            .is_some_and(|document| !document.has_local_mutations())
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let limbo_documents: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();
        let old_limbo_documents = std::mem::replace(&mut self.limbo_documents, limbo_documents);

        let mut changes: Vec<LimboDocumentChange> = old_limbo_documents
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo_documents)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// A write acknowledged by the backend is held back until the matching
/// watch update arrives, so the view does not flicker to the committed
/// version and back.
fn should_wait_for_synced_document(old: &MutableDocument, new: &MutableDocument) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

fn change_type_order(change_type: DocumentViewChangeType) -> u8 {
    match change_type {
        DocumentViewChangeType::Removed => 0,
        DocumentViewChangeType::Added => 1,
        DocumentViewChangeType::Modified | DocumentViewChangeType::Metadata => 2,
    }
}
