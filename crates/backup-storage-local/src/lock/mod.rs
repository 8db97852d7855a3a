mod file;
mod probe;

pub use file::FileLock;
pub use probe::{probe_and_record, probe_file_locking, select_lock_manager};
