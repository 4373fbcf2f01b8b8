pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub(crate) mod util;
pub mod value;

pub use api::{
    CollectionReference, DocumentReference, DocumentSnapshot, Firestore, Query, QuerySnapshot, SetOptions,
    Transaction, WriteBatch,
};
pub use core::{ListenOptions, ListenSource, ListenerRegistration, Source};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
