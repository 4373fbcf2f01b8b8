use serde::{Deserialize, Serialize};

use crate::firestore::core::types::BatchId;
use crate::firestore::model::{DocumentKey, FieldMask, MutableDocument, Mutation};

/// Net effect of every pending batch touching one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// Document with its overlay applied, plus the fields the overlay changed
/// (`None` when the whole document was replaced).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub overlayed_document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(overlayed_document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            overlayed_document,
            mutated_fields,
        }
    }
}
