//! Per-instance id locks.
//!
//! `<locks_dir>/local-instance-<N>.lock` grants ownership of instance id N.
//! The `flock` serializes concurrent dispatchers; the one-byte payload
//! records whether a group currently owns the id, and survives the
//! dispatcher process that wrote it.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cvd_shared::constants::filenames;
use cvd_shared::errors::{CvdError, CvdResult};

use super::file::LockFile;

/// Upper bound for `acquire_unused` scans.
const MAX_INSTANCE_ID: u32 = 1024;

/// Payload of an instance lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    InUse,
    NotInUse,
}

impl LockStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            LockStatus::InUse => b'I',
            LockStatus::NotInUse => b'N',
        }
    }

    /// An empty or unrecognized payload counts as free.
    pub fn from_byte(byte: Option<u8>) -> Self {
        match byte {
            Some(b'I') => LockStatus::InUse,
            _ => LockStatus::NotInUse,
        }
    }
}

/// A held lock on one instance id.
#[derive(Debug)]
pub struct InstanceLockFile {
    lock: LockFile,
    id: u32,
}

impl InstanceLockFile {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    pub fn status(&self) -> CvdResult<LockStatus> {
        let mut file = self.lock.file();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 1];
        let read = file.read(&mut buf).map_err(|e| {
            CvdError::Io(format!("failed to read {}: {e}", self.path().display()))
        })?;
        Ok(LockStatus::from_byte((read == 1).then_some(buf[0])))
    }

    pub fn set_status(&self, status: LockStatus) -> CvdResult<()> {
        let mut file = self.lock.file();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&[status.as_byte()]).map_err(|e| {
            CvdError::Io(format!("failed to write {}: {e}", self.path().display()))
        })?;
        file.set_len(1)?;
        file.sync_data()?;

        tracing::debug!(instance_id = self.id, status = ?status, "Updated instance lock");
        Ok(())
    }
}

/// Hands out instance locks under one locks directory.
#[derive(Clone, Debug)]
pub struct InstanceLockFileManager {
    locks_dir: PathBuf,
}

impl InstanceLockFileManager {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self { locks_dir }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    pub fn lock_path(&self, id: u32) -> PathBuf {
        self.locks_dir.join(filenames::instance_lock(id))
    }

    /// Wait for the lock on `id`.
    pub fn acquire(&self, id: u32) -> CvdResult<InstanceLockFile> {
        validate_id(id)?;
        let lock = LockFile::acquire(&self.lock_path(id))?;
        Ok(InstanceLockFile { lock, id })
    }

    /// Lock `id` without waiting; `None` when another process holds it.
    pub fn try_acquire(&self, id: u32) -> CvdResult<Option<InstanceLockFile>> {
        validate_id(id)?;
        Ok(LockFile::try_acquire(&self.lock_path(id))?.map(|lock| InstanceLockFile { lock, id }))
    }

    /// Wait for the locks on all `ids`, taken in ascending order.
    pub fn acquire_many(&self, ids: &[u32]) -> CvdResult<Vec<InstanceLockFile>> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|id| self.acquire(id)).collect()
    }

    /// Lock all `ids` without waiting, in ascending order.
    ///
    /// On contention every lock taken so far is released and `Busy` names
    /// the contended id.
    pub fn try_acquire_many(&self, ids: &[u32]) -> CvdResult<Vec<InstanceLockFile>> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut acquired = Vec::with_capacity(sorted.len());
        for id in sorted {
            match self.try_acquire(id)? {
                Some(lock) => acquired.push(lock),
                None => {
                    return Err(CvdError::Busy(format!(
                        "instance lock {} is held by another process",
                        self.lock_path(id).display()
                    )));
                }
            }
        }
        Ok(acquired)
    }

    /// First id, scanning from 1, whose lock is free and not in use.
    ///
    /// Ids locked by another process are skipped. The returned lock still
    /// carries `NotInUse`; the caller marks it.
    pub fn acquire_unused(&self) -> CvdResult<InstanceLockFile> {
        self.acquire_unused_excluding(&[])
    }

    pub(crate) fn acquire_unused_excluding(&self, skip: &[u32]) -> CvdResult<InstanceLockFile> {
        for id in 1..=MAX_INSTANCE_ID {
            if skip.contains(&id) {
                continue;
            }
            let Some(lock) = self.try_acquire(id)? else {
                continue;
            };
            if lock.status()? == LockStatus::NotInUse {
                tracing::debug!(instance_id = id, "Found unused instance id");
                return Ok(lock);
            }
        }
        Err(CvdError::ResourcesBusy(format!(
            "no unused instance id in 1..={MAX_INSTANCE_ID}"
        )))
    }

    /// Ids of every lock file present in the locks directory.
    pub fn existing_ids(&self) -> CvdResult<Vec<u32>> {
        let entries = match std::fs::read_dir(&self.locks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CvdError::Io(format!(
                    "failed to list {}: {e}",
                    self.locks_dir.display()
                )));
            }
        };

        let mut ids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("local-instance-"))
                    .and_then(|rest| rest.strip_suffix(".lock"))
                    .and_then(|id| id.parse::<u32>().ok())
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

fn validate_id(id: u32) -> CvdResult<()> {
    if id == 0 {
        return Err(CvdError::InvalidArgument(
            "instance ids start at 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, InstanceLockFileManager) {
        let temp = TempDir::new().unwrap();
        let manager = InstanceLockFileManager::new(temp.path().join("locks"));
        (temp, manager)
    }

    #[test]
    fn test_status_defaults_to_not_in_use() {
        let (_temp, manager) = manager();
        let lock = manager.acquire(1).unwrap();
        assert_eq!(lock.status().unwrap(), LockStatus::NotInUse);
        assert!(lock.path().ends_with("local-instance-1.lock"));
    }

    #[test]
    fn test_status_persists_past_release() {
        let (_temp, manager) = manager();
        {
            let lock = manager.acquire(2).unwrap();
            lock.set_status(LockStatus::InUse).unwrap();
        }

        assert_eq!(std::fs::read(manager.lock_path(2)).unwrap(), b"I");
        let lock = manager.acquire(2).unwrap();
        assert_eq!(lock.status().unwrap(), LockStatus::InUse);

        lock.set_status(LockStatus::NotInUse).unwrap();
        assert_eq!(std::fs::read(manager.lock_path(2)).unwrap(), b"N");
    }

    #[test]
    fn test_try_acquire_busy() {
        let (_temp, manager) = manager();
        let _held = manager.acquire(3).unwrap();
        assert!(manager.try_acquire(3).unwrap().is_none());
    }

    #[test]
    fn test_acquire_many_sorted() {
        let (_temp, manager) = manager();
        let locks = manager.acquire_many(&[7, 3, 5, 3]).unwrap();
        let ids: Vec<u32> = locks.iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_try_acquire_many_releases_on_contention() {
        let (_temp, manager) = manager();
        let _held = manager.acquire(5).unwrap();

        let err = manager.try_acquire_many(&[3, 5, 7]).unwrap_err();
        assert!(matches!(err, CvdError::Busy(_)));

        // 3 was taken before hitting 5 and must have been released
        assert!(manager.try_acquire(3).unwrap().is_some());
    }

    #[test]
    fn test_acquire_unused_skips_in_use_and_held() {
        let (_temp, manager) = manager();
        manager.acquire(1).unwrap().set_status(LockStatus::InUse).unwrap();
        let _held = manager.acquire(2).unwrap();

        let lock = manager.acquire_unused().unwrap();
        assert_eq!(lock.id(), 3);
    }

    #[test]
    fn test_zero_id_rejected() {
        let (_temp, manager) = manager();
        assert!(matches!(manager.acquire(0), Err(CvdError::InvalidArgument(_))));
    }

    #[test]
    fn test_existing_ids() {
        let (_temp, manager) = manager();
        assert!(manager.existing_ids().unwrap().is_empty());

        drop(manager.acquire_many(&[4, 1]).unwrap());
        std::fs::write(manager.locks_dir().join("unrelated.txt"), "").unwrap();

        assert_eq!(manager.existing_ids().unwrap(), vec![1, 4]);
    }
}
