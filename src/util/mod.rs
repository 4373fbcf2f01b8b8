pub mod backoff;

pub use backoff::{jittered_delay, BackoffConfig, RANDOM_FACTOR};
