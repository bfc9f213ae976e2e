//! Directory lock: serializes index *creation* only (§2.1, §4.2).
//!
//! Grounded on `chunk_store.rs`'s `base/.lock` file plus the shared lock
//! discipline in `process_locker.rs`, narrowed to the single exclusive
//! acquire/release pair `open_or_create` needs around `find_compatible` +
//! `create`.

use std::path::{Path, PathBuf};

use anyhow::Error;
use mail_index_tools::{FileLock, LockKind};

pub struct DirLock {
    lock: FileLock,
}

impl DirLock {
    fn lock_path(dir: &Path) -> PathBuf {
        dir.join(".mailindex.lock")
    }

    pub fn open(dir: &Path) -> Result<Self, Error> {
        Ok(Self {
            lock: FileLock::open(Self::lock_path(dir))?,
        })
    }

    /// Blocking exclusive acquire -- the only mode `open_or_create` needs.
    pub fn lock_exclusive(&self) -> Result<(), Error> {
        self.lock.lock_blocking(LockKind::Exclusive)
    }

    pub fn unlock(&self) -> Result<(), Error> {
        self.lock.unlock()
    }
}
