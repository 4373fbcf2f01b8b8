use serde::{Deserialize, Serialize};

pub type BatchId = i32;
pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Whether the client believes it can reach the backend. Views report
/// `from_cache` while the state is not `Online`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    ExistenceFilterMismatch,
    ExistenceFilterMismatchBloom,
    LimboResolution,
}
