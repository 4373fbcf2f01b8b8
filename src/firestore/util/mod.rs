pub(crate) mod log;
pub(crate) mod serde_base64;
pub(crate) mod serde_double;
pub(crate) mod serde_entries;
