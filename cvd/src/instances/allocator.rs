//! Instance id allocation on top of the lock-file manager.

use cvd_shared::constants::ports;
use cvd_shared::errors::{CvdError, CvdResult};
use serde::Serialize;

use crate::lock::{InstanceLockFile, InstanceLockFileManager, LockStatus};

/// Which ids a new group wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdRequest {
    /// Exactly these ids.
    Explicit(Vec<u32>),
    /// Any `count` free ids, lowest first.
    Any { count: usize },
}

impl IdRequest {
    pub fn count(&self) -> usize {
        match self {
            IdRequest::Explicit(ids) => ids.len(),
            IdRequest::Any { count } => *count,
        }
    }
}

/// Host resources derived from an instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceResources {
    pub id: u32,
    pub vsock_cid: u32,
    pub adb_port: u32,
    pub modem_simulator_port: u32,
}

impl InstanceResources {
    pub fn for_id(id: u32) -> Self {
        Self {
            id,
            vsock_cid: id + ports::VSOCK_CID_OFFSET,
            adb_port: u32::from(ports::ADB_BASE) + id - 1,
            modem_simulator_port: u32::from(ports::MODEM_SIMULATOR_BASE) + id,
        }
    }
}

/// Ids held by a launch in progress.
///
/// Every id is marked `InUse`. Dropping the allocation marks them
/// `NotInUse` again unless [`commit`](Allocation::commit) was called.
#[derive(Debug)]
pub struct Allocation {
    locks: Vec<InstanceLockFile>,
    committed: bool,
}

impl Allocation {
    /// Allocated ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        self.locks.iter().map(|l| l.id()).collect()
    }

    pub fn resources(&self) -> Vec<InstanceResources> {
        self.locks
            .iter()
            .map(|l| InstanceResources::for_id(l.id()))
            .collect()
    }

    pub fn locks(&self) -> &[InstanceLockFile] {
        &self.locks
    }

    /// Keep the `InUse` marks and drop the file locks.
    pub fn commit(mut self) {
        self.committed = true;
        tracing::debug!(ids = ?self.ids(), "Committed instance allocation");
    }

    /// Mark every id `NotInUse` and drop the file locks.
    pub fn release(mut self) -> CvdResult<()> {
        self.committed = true;
        release_all(&self.locks)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = release_all(&self.locks)
        {
            tracing::warn!(error = %e, "Failed to release instance locks");
        }
    }
}

fn release_all(locks: &[InstanceLockFile]) -> CvdResult<()> {
    let mut first_error = None;
    for lock in locks {
        if let Err(e) = lock.set_status(LockStatus::NotInUse) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub struct ResourceAllocator<'a> {
    locks: &'a InstanceLockFileManager,
}

impl<'a> ResourceAllocator<'a> {
    pub fn new(locks: &'a InstanceLockFileManager) -> Self {
        Self { locks }
    }

    /// Lock and mark the requested ids.
    ///
    /// Any id that is locked elsewhere or already `InUse` fails the whole
    /// request with `ResourcesBusy`; nothing stays marked.
    pub fn allocate(&self, request: &IdRequest) -> CvdResult<Allocation> {
        if request.count() == 0 {
            return Err(CvdError::InvalidArgument(
                "a group needs at least one instance".to_string(),
            ));
        }

        let locks = match request {
            IdRequest::Explicit(ids) => self.lock_explicit(ids)?,
            IdRequest::Any { count } => self.lock_any(*count)?,
        };

        let mut allocation = Allocation {
            locks: Vec::with_capacity(locks.len()),
            committed: false,
        };
        for lock in locks {
            lock.set_status(LockStatus::InUse)?;
            allocation.locks.push(lock);
        }

        tracing::info!(ids = ?allocation.ids(), "Allocated instance ids");
        Ok(allocation)
    }

    fn lock_explicit(&self, ids: &[u32]) -> CvdResult<Vec<InstanceLockFile>> {
        let locks = self.locks.try_acquire_many(ids).map_err(|e| match e {
            CvdError::Busy(msg) => CvdError::ResourcesBusy(msg),
            other => other,
        })?;

        for lock in &locks {
            if lock.status()? == LockStatus::InUse {
                return Err(CvdError::ResourcesBusy(format!(
                    "instance id {} is in use",
                    lock.id()
                )));
            }
        }
        Ok(locks)
    }

    fn lock_any(&self, count: usize) -> CvdResult<Vec<InstanceLockFile>> {
        let mut locks: Vec<InstanceLockFile> = Vec::with_capacity(count);
        for _ in 0..count {
            let taken: Vec<u32> = locks.iter().map(|l| l.id()).collect();
            locks.push(self.locks.acquire_unused_excluding(&taken)?);
        }
        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, InstanceLockFileManager) {
        let temp = TempDir::new().unwrap();
        let manager = InstanceLockFileManager::new(temp.path().to_path_buf());
        (temp, manager)
    }

    fn payload(manager: &InstanceLockFileManager, id: u32) -> Vec<u8> {
        std::fs::read(manager.lock_path(id)).unwrap()
    }

    #[test]
    fn test_derived_resources() {
        let r = InstanceResources::for_id(7);
        assert_eq!(r.vsock_cid, 9);
        assert_eq!(r.adb_port, 6526);
        assert_eq!(r.modem_simulator_port, 1007);
    }

    #[test]
    fn test_allocate_explicit_sorted() {
        let (_temp, manager) = manager();
        let allocation = ResourceAllocator::new(&manager)
            .allocate(&IdRequest::Explicit(vec![7, 3]))
            .unwrap();

        assert_eq!(allocation.ids(), vec![3, 7]);
        let cids: Vec<u32> = allocation.resources().iter().map(|r| r.vsock_cid).collect();
        assert_eq!(cids, vec![5, 9]);
        assert_eq!(payload(&manager, 3), b"I");
        assert_eq!(payload(&manager, 7), b"I");
    }

    #[test]
    fn test_allocate_any_lowest_first() {
        let (_temp, manager) = manager();
        manager.acquire(2).unwrap().set_status(LockStatus::InUse).unwrap();

        let allocation = ResourceAllocator::new(&manager)
            .allocate(&IdRequest::Any { count: 2 })
            .unwrap();
        assert_eq!(allocation.ids(), vec![1, 3]);
    }

    #[test]
    fn test_in_use_id_is_busy_and_nothing_leaks() {
        let (_temp, manager) = manager();
        manager.acquire(7).unwrap().set_status(LockStatus::InUse).unwrap();

        let err = ResourceAllocator::new(&manager)
            .allocate(&IdRequest::Explicit(vec![3, 7]))
            .unwrap_err();
        assert!(matches!(err, CvdError::ResourcesBusy(_)));

        // 3 was never marked and is free to lock again
        let lock = manager.try_acquire(3).unwrap().unwrap();
        assert_eq!(lock.status().unwrap(), LockStatus::NotInUse);
    }

    #[test]
    fn test_locked_id_is_busy() {
        let (_temp, manager) = manager();
        let _held = manager.acquire(3).unwrap();

        let err = ResourceAllocator::new(&manager)
            .allocate(&IdRequest::Explicit(vec![3]))
            .unwrap_err();
        assert!(matches!(err, CvdError::ResourcesBusy(_)));
    }

    #[test]
    fn test_commit_keeps_marks() {
        let (_temp, manager) = manager();
        let allocation = ResourceAllocator::new(&manager)
            .allocate(&IdRequest::Explicit(vec![4]))
            .unwrap();
        allocation.commit();

        assert_eq!(payload(&manager, 4), b"I");
        // File lock itself is released
        assert!(manager.try_acquire(4).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases_marks() {
        let (_temp, manager) = manager();
        {
            let _allocation = ResourceAllocator::new(&manager)
                .allocate(&IdRequest::Explicit(vec![5]))
                .unwrap();
        }
        assert_eq!(payload(&manager, 5), b"N");
    }

    #[test]
    fn test_zero_count_rejected() {
        let (_temp, manager) = manager();
        assert!(
            ResourceAllocator::new(&manager)
                .allocate(&IdRequest::Any { count: 0 })
                .is_err()
        );
    }
}
