//! Local filesystem pieces of the backup engine: the directory destination,
//! OS file locks with a capability probe, the JSON state store and the
//! staging artifact builder.

pub mod adapter;
pub mod lock;
pub mod staging;
pub mod store;

pub use adapter::LocalAdapter;
pub use lock::{probe_and_record, probe_file_locking, select_lock_manager, FileLock};
pub use staging::StagingBuilder;
pub use store::JsonStateStore;
