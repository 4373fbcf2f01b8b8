pub mod backoff;
pub mod bloom_filter;
pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod stream;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use backoff::ExponentialBackoff;
pub use bloom_filter::{BloomFilter, BloomFilterPayload};
pub use datastore::{Datastore, DatastoreArc, InMemoryDatastore, ListenRequest, WriteRequest, WriteResponse};
pub use online_state_tracker::OnlineStateTracker;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use rpc_error::{is_permanent_error, is_permanent_write_error, is_retryable_transaction_error, map_rpc_status};
pub use watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilter, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
