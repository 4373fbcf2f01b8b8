pub mod persistent;
pub mod watch;
pub mod write;

pub use persistent::{PersistentStream, StreamConfig, StreamHandler, StreamOpener, StreamState};
pub use watch::WatchStream;
pub use write::{WriteStream, WriteStreamDelegate};
