//! File-backed exclusion for instance ids and the registry.

mod file;
mod instance;

pub use file::LockFile;
pub use instance::{InstanceLockFile, InstanceLockFileManager, LockStatus};
