pub mod async_queue;
pub mod credentials;
pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod settings;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod transaction;
pub mod transaction_runner;
pub mod types;
pub mod view;
pub mod view_snapshot;

#[doc(inline)]
pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
#[doc(inline)]
pub use credentials::{
    CredentialsProvider, CredentialsProviderArc, EmptyCredentialsProvider, StaticCredentialsProvider, Token, User,
};
#[doc(inline)]
pub use document_set::DocumentSet;
#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, ListenSource, QueryListener, QueryObserver};
#[doc(inline)]
pub use firestore_client::{DocumentRead, FirestoreClient, ListenerRegistration, Source};
#[doc(inline)]
pub use query::{Bound, Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
#[doc(inline)]
pub use settings::{DatabaseInfo, FirestoreSettings, IndexAutoCreationSettings, PersistenceSettings};
#[doc(inline)]
pub use sync_engine::{SyncEngine, SyncEngineListener};
#[doc(inline)]
pub use target::{Target, TargetData};
#[doc(inline)]
pub use transaction::Transaction;
#[doc(inline)]
pub use transaction_runner::{TransactionRunner, DEFAULT_MAX_ATTEMPTS};
#[doc(inline)]
pub use types::{BatchId, ListenSequenceNumber, OnlineState, TargetId, TargetPurpose};
#[doc(inline)]
pub use view_snapshot::{DocumentViewChange, DocumentViewChangeType, SyncState, ViewSnapshot};
