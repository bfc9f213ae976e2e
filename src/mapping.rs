//! A typed, bounds-checked view over the memory-mapped index file.
//!
//! The teacher's `fixed_index.rs` hands out a raw `*mut u8` and lets callers
//! do their own pointer arithmetic. Per the design note in §9 of the spec,
//! this crate instead exposes typed accessors that bounds-check against the
//! *current* mapping length and must be re-resolved after any `dirty_mmap`
//! event -- nothing here retains a pointer across a `refresh`.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Error};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;

use crate::header::IndexHeader;
use crate::record::{IndexRecord, RECORD_SIZE};

/// Live mmap of an open index file, always `header + k * record` bytes.
pub struct IndexMapping {
    base: *mut u8,
    len: usize,
}

impl IndexMapping {
    /// Map the file's current contents. If the tail isn't an exact multiple
    /// of the record size (partial write, or corruption), the file is
    /// truncated to the last valid record boundary first -- mirroring
    /// `mmap_update`'s `extra = ... % sizeof(MailIndexRecord)` handling.
    pub fn map(file: &File) -> Result<Self, Error> {
        let stat = fstat(file.as_raw_fd()).map_err(|err| anyhow::anyhow!("fstat failed: {err}"))?;
        let mut len = stat.st_size as usize;

        if len < IndexHeader::SIZE {
            bail!("truncated index file ({len} bytes, header is {})", IndexHeader::SIZE);
        }

        let extra = (len - IndexHeader::SIZE) % RECORD_SIZE;
        if extra != 0 {
            len -= extra;
            ftruncate(file.as_raw_fd(), len as i64)
                .map_err(|err| anyhow::anyhow!("ftruncate failed: {err}"))?;
        }

        let base = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(len).ok_or_else(|| anyhow::anyhow!("empty index"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|err| anyhow::anyhow!("mmap() failed: {err}"))? as *mut u8;

        Ok(Self { base, len })
    }

    fn unmap(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe {
            let _ = munmap(self.base as *mut std::ffi::c_void, self.len);
        }
        self.base = std::ptr::null_mut();
    }

    /// Re-establish the mapping over the file's current size. Called
    /// whenever an operation raised `dirty_mmap` (append, truncate,
    /// rebuild, compress).
    pub fn refresh(&mut self, file: &File) -> Result<(), Error> {
        self.unmap();
        *self = Self::map(file)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn record_count(&self) -> usize {
        (self.len - IndexHeader::SIZE) / RECORD_SIZE
    }

    pub fn header(&self) -> &IndexHeader {
        unsafe { &*(self.base as *const IndexHeader) }
    }

    pub fn header_mut(&mut self) -> &mut IndexHeader {
        unsafe { &mut *(self.base as *mut IndexHeader) }
    }

    /// msync just the header page -- used when entering EXCLUSIVE to make a
    /// crash with the FSCK flag set observable on reopen (§4.3 step 7).
    pub fn msync_header(&self) -> Result<(), Error> {
        self.msync(IndexHeader::SIZE)
    }

    pub fn msync(&self, len: usize) -> Result<(), Error> {
        use nix::sys::mman::{msync, MsFlags};
        unsafe {
            msync(self.base as *mut std::ffi::c_void, len.min(self.len), MsFlags::MS_SYNC)
        }
        .map_err(|err| anyhow::anyhow!("msync() failed: {err}"))
    }

    pub fn record(&self, pos: usize) -> Option<&IndexRecord> {
        if pos >= self.record_count() {
            return None;
        }
        let off = IndexHeader::SIZE + pos * RECORD_SIZE;
        Some(unsafe { &*(self.base.add(off) as *const IndexRecord) })
    }

    pub fn record_mut(&mut self, pos: usize) -> Option<&mut IndexRecord> {
        if pos >= self.record_count() {
            return None;
        }
        let off = IndexHeader::SIZE + pos * RECORD_SIZE;
        Some(unsafe { &mut *(self.base.add(off) as *mut IndexRecord) })
    }

    /// Byte offset of `record(pos)` within the file, used to derive
    /// sequence numbers and hole descriptors.
    pub fn record_offset(&self, pos: usize) -> u64 {
        (IndexHeader::SIZE + pos * RECORD_SIZE) as u64
    }

    /// Inverse of [`Self::record_offset`].
    pub fn position_of_offset(&self, offset: u64) -> usize {
        (offset as usize - IndexHeader::SIZE) / RECORD_SIZE
    }
}

impl Drop for IndexMapping {
    fn drop(&mut self) {
        self.unmap();
    }
}
