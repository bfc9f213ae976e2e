use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};

/// The two kinds of advisory byte-range lock the kernel understands.
///
/// The index itself layers a third state (`Unlocked`) and an escalation
/// protocol on top of this -- see `mail_index::lock::LockState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    fn to_flock_type(self) -> i16 {
        match self {
            LockKind::Shared => libc::F_RDLCK as i16,
            LockKind::Exclusive => libc::F_WRLCK as i16,
        }
    }
}

/// Whole-file advisory `fcntl` lock.
///
/// One `FileLock` wraps one open file descriptor. The lock state is not
/// tracked here -- callers are expected to know whether they currently hold
/// the lock; this type only performs the syscalls.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Open (creating if necessary) the file that will be locked.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|err| anyhow::anyhow!("unable to open lock file {:?} - {err}", path.as_ref()))?;

        Ok(Self { file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    fn flock(&self, l_type: i16) -> libc::flock {
        libc::flock {
            l_type,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        }
    }

    /// Acquire `kind`, blocking (and retrying on `EINTR`) until it is granted.
    pub fn lock_blocking(&self, kind: LockKind) -> Result<(), Error> {
        let op = self.flock(kind.to_flock_type());

        loop {
            match nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLKW(&op)) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => bail!("fcntl(F_SETLKW, {:?}) failed: {err}", kind),
            }
        }
    }

    /// Try to acquire `kind` without blocking. Returns `Ok(false)` if the
    /// lock is currently held by someone else, never blocks.
    pub fn try_lock(&self, kind: LockKind) -> Result<bool, Error> {
        let op = self.flock(kind.to_flock_type());

        match nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op)) {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EAGAIN) => Ok(false),
            Err(err) => bail!("fcntl(F_SETLK, {:?}) failed: {err}", kind),
        }
    }

    /// Release whatever lock is currently held, blocking (it never actually
    /// blocks to unlock, but retries on `EINTR` for uniformity).
    pub fn unlock(&self) -> Result<(), Error> {
        let op = self.flock(libc::F_UNLCK as i16);

        loop {
            match nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLKW(&op)) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => bail!("fcntl(F_SETLKW, unlock) failed: {err}"),
            }
        }
    }
}
