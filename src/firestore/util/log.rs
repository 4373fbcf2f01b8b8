use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

use crate::logger::Logger;

pub(crate) static LOGGER: Lazy<Logger> = Lazy::new(|| Logger::new("firestore-sync"));

/// Emits `message` as a warning the first time `flag` is seen unset.
pub(crate) fn warn_once(flag: &AtomicBool, message: impl AsRef<str>) {
    if !flag.swap(true, Ordering::SeqCst) {
        LOGGER.warn(message);
    }
}
