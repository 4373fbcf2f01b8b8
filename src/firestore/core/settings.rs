//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::reference_delegate::{
    CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES, MINIMUM_CACHE_SIZE_BYTES,
};
use crate::firestore::model::DatabaseId;
use crate::util::backoff::BackoffConfig;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Time without a stream response before the client reports itself offline.
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Streams without pending work close after this long.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST: f64 = 8.0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceSettings {
    Memory,
    /// JSON tables in `directory`. `force_ownership` takes the primary lease
    /// even when another instance holds it.
    Durable {
        directory: PathBuf,
        force_ownership: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Collections smaller than this are always scanned.
    pub min_collection_size: usize,
    /// Cost of reading one document through an index relative to a scan.
    pub relative_index_read_cost: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost: DEFAULT_RELATIVE_INDEX_READ_COST,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    persistence: PersistenceSettings,
    cache_size_bytes: i64,
    index_auto_creation: IndexAutoCreationSettings,
    max_concurrent_limbo_resolutions: usize,
    online_state_timeout: Duration,
    stream_idle_timeout: Duration,
    backoff: BackoffConfig,
    gc_initial_delay: Duration,
    gc_interval: Duration,
}

impl FirestoreSettings {
    pub fn builder() -> FirestoreSettingsBuilder {
        FirestoreSettingsBuilder::default()
    }

    pub fn persistence(&self) -> &PersistenceSettings {
        &self.persistence
    }

    pub fn cache_size_bytes(&self) -> i64 {
        self.cache_size_bytes
    }

    pub fn index_auto_creation(&self) -> IndexAutoCreationSettings {
        self.index_auto_creation
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn online_state_timeout(&self) -> Duration {
        self.online_state_timeout
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        self.stream_idle_timeout
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    pub fn gc_initial_delay(&self) -> Duration {
        self.gc_initial_delay
    }

    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceSettings::Memory,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            index_auto_creation: IndexAutoCreationSettings::default(),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            backoff: BackoffConfig::default(),
            gc_initial_delay: DEFAULT_GC_INITIAL_DELAY,
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }
}

/// Builder validating every value in [`FirestoreSettingsBuilder::build`].
#[derive(Clone, Debug, Default)]
pub struct FirestoreSettingsBuilder {
    settings: FirestoreSettings,
}

impl FirestoreSettingsBuilder {
    pub fn persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.settings.persistence = persistence;
        self
    }

    pub fn cache_size_bytes(mut self, bytes: i64) -> Self {
        self.settings.cache_size_bytes = bytes;
        self
    }

    pub fn index_auto_creation(mut self, settings: IndexAutoCreationSettings) -> Self {
        self.settings.index_auto_creation = settings;
        self
    }

    pub fn max_concurrent_limbo_resolutions(mut self, limit: usize) -> Self {
        self.settings.max_concurrent_limbo_resolutions = limit;
        self
    }

    pub fn online_state_timeout(mut self, timeout: Duration) -> Self {
        self.settings.online_state_timeout = timeout;
        self
    }

    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.settings.stream_idle_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.settings.backoff = backoff;
        self
    }

    pub fn gc_schedule(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.settings.gc_initial_delay = initial_delay;
        self.settings.gc_interval = interval;
        self
    }

    pub fn build(self) -> FirestoreResult<FirestoreSettings> {
        let settings = self.settings;
        if settings.cache_size_bytes != CACHE_SIZE_UNLIMITED
            && settings.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES
        {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if settings.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if !(settings.index_auto_creation.relative_index_read_cost > 0.0) {
            return Err(invalid_argument(
                "relative_index_read_cost must be greater than zero",
            ));
        }
        let backoff = settings.backoff;
        if backoff.backoff_factor < 1.0 {
            return Err(invalid_argument("backoff factor must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(invalid_argument("backoff jitter must be between 0 and 1"));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(invalid_argument(
                "backoff initial delay must not exceed the maximum delay",
            ));
        }
        if settings.gc_interval.is_zero() {
            return Err(invalid_argument("gc_interval must be greater than zero"));
        }
        if let PersistenceSettings::Durable { directory, .. } = &settings.persistence {
            if directory.as_os_str().is_empty() {
                return Err(invalid_argument("persistence directory must not be empty"));
            }
        }
        Ok(settings)
    }
}

/// Identity of the database a client talks to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub database_id: DatabaseId,
    /// Distinguishes clients sharing one persistence location.
    pub persistence_key: String,
}

impl DatabaseInfo {
    pub fn new(database_id: DatabaseId, persistence_key: impl Into<String>) -> Self {
        Self {
            database_id,
            persistence_key: persistence_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = FirestoreSettings::builder().build().unwrap();
        assert_eq!(settings, FirestoreSettings::default());
        assert_eq!(settings.max_concurrent_limbo_resolutions(), 100);
        assert!(!settings.index_auto_creation().enabled);
    }

    #[test]
    fn rejects_tiny_cache() {
        let err = FirestoreSettings::builder()
            .cache_size_bytes(10)
            .build()
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(FirestoreSettings::builder()
            .cache_size_bytes(CACHE_SIZE_UNLIMITED)
            .build()
            .is_ok());
    }

    #[test]
    fn rejects_bad_backoff() {
        let backoff = BackoffConfig {
            jitter: 2.0,
            ..BackoffConfig::default()
        };
        assert!(FirestoreSettings::builder().backoff(backoff).build().is_err());
    }
}
