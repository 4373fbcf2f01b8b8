use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::types::BatchId;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    OverlayedDocument, SnapshotVersion, Timestamp,
};

pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written together by one local write. Immutable once queued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    /// Pre-write values captured for transforms that are relative to the
    /// current document state, applied before `mutations` on the local view.
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies the acknowledged results of this batch to the remote copy of
    /// `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result)?;
            }
        }
        Ok(())
    }

    /// Applies every mutation of this batch for `document` to its local view,
    /// accumulating the changed-field mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.base_mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every document it touches and returns the overlay
    /// mutation for each of them. Keys in `documents_without_remote_version`
    /// get whole-document overlays.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let Some(overlayed) = documents.get_mut(mutation.key()) else {
                continue;
            };
            let mutated_fields = self.apply_to_local_view(
                &mut overlayed.overlayed_document,
                overlayed.mutated_fields.take(),
            );
            let mutated_fields = if documents_without_remote_version.contains(mutation.key()) {
                None
            } else {
                mutated_fields
            };
            if let Some(overlay) =
                calculate_overlay_mutation(&overlayed.overlayed_document, mutated_fields.as_ref())
            {
                overlays.insert(mutation.key().clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.overlayed_document.is_valid_document() {
                overlayed
                    .overlayed_document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// Server acknowledgement of a batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
