use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// Maps a numeric RPC status code to an error. Unknown codes map to
/// `Unknown`; a status of 0 is not an error and is reported as `Internal`.
pub fn map_rpc_status(status: i32, message: impl Into<String>) -> FirestoreError {
    let message = message.into();
    let code = match status {
        1 => FirestoreErrorCode::Cancelled,
        2 => FirestoreErrorCode::Unknown,
        3 => FirestoreErrorCode::InvalidArgument,
        4 => FirestoreErrorCode::DeadlineExceeded,
        5 => FirestoreErrorCode::NotFound,
        6 => FirestoreErrorCode::AlreadyExists,
        7 => FirestoreErrorCode::PermissionDenied,
        8 => FirestoreErrorCode::ResourceExhausted,
        9 => FirestoreErrorCode::FailedPrecondition,
        10 => FirestoreErrorCode::Aborted,
        11 => FirestoreErrorCode::OutOfRange,
        12 => FirestoreErrorCode::Unimplemented,
        13 => FirestoreErrorCode::Internal,
        14 => FirestoreErrorCode::Unavailable,
        15 => FirestoreErrorCode::DataLoss,
        16 => FirestoreErrorCode::Unauthenticated,
        0 => {
            return FirestoreError::new(
                FirestoreErrorCode::Internal,
                format!("Received OK status while handling error: {message}"),
            )
        }
        other => {
            log::warn!("Unknown RPC status code {other}");
            FirestoreErrorCode::Unknown
        }
    };
    FirestoreError::new(code, message)
}

/// Whether a stream or RPC failing with `code` should not be retried.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        // Credentials are refreshed and the request retried.
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        // Aborted writes are not retried by the write stream; transactions
        // retry them through `is_retryable_transaction_error`.
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Whether a write batch failing with `code` must be rejected. Aborted
/// writes are retried by the stream.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

/// Codes on which a transaction attempt is retried from scratch.
pub fn is_retryable_transaction_error(error: &FirestoreError) -> bool {
    matches!(
        error.code,
        FirestoreErrorCode::Aborted
            | FirestoreErrorCode::FailedPrecondition
            | FirestoreErrorCode::AlreadyExists
            | FirestoreErrorCode::Unavailable
    ) || !is_permanent_error(error.code)
}
