mod database;
pub(crate) mod operations;
mod query;
mod reference;
mod snapshot;
mod transaction;
mod write_batch;

pub use database::Firestore;
pub use operations::{
    parse_set_data, parse_update_data, ParsedSetData, ParsedUpdateData, SetOptions,
};
pub use query::Query;
pub use reference::{CollectionReference, DocumentReference};
pub use snapshot::{DocumentChange, DocumentChangeType, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
pub use transaction::Transaction;
pub use write_batch::WriteBatch;
