//! Persistent UID -> byte-offset accelerator (§2.3).
//!
//! A Robin Hood open-addressing table mapped straight off disk, grounded on
//! the `MmapHashIndex` pattern (`other_examples/.../mmap_hash.rs`), but
//! re-expressed with `nix::sys::mman` the way `fixed_index.rs` maps its
//! digest array rather than pulling in `memmap2` (not a teacher
//! dependency).
//!
//! Slot layout, 16 bytes each: `uid:u32 | probe_dist:u32 | offset:u64`.
//! `uid == 0` means empty, `uid == u32::MAX` means tombstone.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

const SLOT_SIZE: usize = 16;
const HEADER_SIZE: usize = 16; // capacity:u64 | count:u64
const TOMBSTONE: u32 = u32::MAX;

/// Load factor ceiling before the table grows (§2.3).
const MAX_LOAD_FACTOR: f64 = 0.65;

pub trait UidHash {
    /// Byte offset for `uid`, or `0` if absent (§2.3: "lookup(uid) -> offset or 0").
    fn lookup(&self, uid: u32) -> u64;

    /// `offset == 0` removes the entry, matching `mail_hash_update(hash, uid, 0)`
    /// in `mail_index_expunge`. Grows the table (doubling) first if inserting
    /// a new uid would push the load factor past [`MAX_LOAD_FACTOR`].
    fn update(&mut self, uid: u32, offset: u64) -> Result<(), Error>;

    /// Rebuild from scratch, growing the table first if `entries` wouldn't
    /// fit within the load factor ceiling at the current capacity.
    fn rebuild(&mut self, entries: &[(u32, u64)]) -> Result<(), Error>;

    /// Grow (by doubling) until the table can hold `min_entries` live
    /// entries without exceeding the load factor ceiling.
    fn ensure_capacity(&mut self, min_entries: u64) -> Result<(), Error>;

    fn sync(&mut self) -> Result<(), Error>;
}

#[derive(Clone, Copy, Default)]
struct Slot {
    uid: u32,
    probe_dist: u32,
    offset: u64,
}

pub struct MmapUidHash {
    file: File,
    base: *mut u8,
    capacity: u64,
    count: u64,
}

impl MmapUidHash {
    pub fn open_or_create(path: &Path, min_capacity: u64) -> Result<Self, Error> {
        let inflated = ((min_capacity.max(1) as f64 / 0.65).ceil() as u64).max(16);
        let cap = inflated.next_power_of_two();
        let file_size = HEADER_SIZE as u64 + cap * SLOT_SIZE as u64;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| anyhow::anyhow!("unable to open uid hash {path:?} - {err}"))?;

        if file.metadata()?.len() < file_size {
            file.set_len(file_size)?;
        }

        let mapped_size = file.metadata()?.len() as usize;
        let base = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(mapped_size).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|err| anyhow::anyhow!("mmap() failed for uid hash: {err}"))? as *mut u8;

        let mut hash = Self { file, base, capacity: cap, count: 0 };

        let existing_capacity = hash.read_u64(0);
        if existing_capacity == cap {
            hash.count = hash.read_u64(8);
        } else {
            hash.write_u64(0, cap);
            hash.write_u64(8, 0);
        }

        Ok(hash)
    }

    fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(off), b.as_mut_ptr(), 8) };
        u64::from_le_bytes(b)
    }

    fn write_u64(&mut self, off: usize, value: u64) {
        unsafe { std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.base.add(off), 8) };
    }

    fn slot_offset(idx: u64) -> usize {
        HEADER_SIZE + idx as usize * SLOT_SIZE
    }

    fn read_slot(&self, idx: u64) -> Slot {
        let off = Self::slot_offset(idx);
        let mut buf = [0u8; SLOT_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(off), buf.as_mut_ptr(), SLOT_SIZE) };
        Slot {
            uid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            probe_dist: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }

    fn write_slot(&mut self, idx: u64, slot: Slot) {
        let off = Self::slot_offset(idx);
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..4].copy_from_slice(&slot.uid.to_le_bytes());
        buf[4..8].copy_from_slice(&slot.probe_dist.to_le_bytes());
        buf[8..16].copy_from_slice(&slot.offset.to_le_bytes());
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(off), SLOT_SIZE) };
    }

    fn mask(&self) -> u64 {
        self.capacity - 1
    }

    fn mapped_len(&self) -> usize {
        HEADER_SIZE + self.capacity as usize * SLOT_SIZE
    }

    /// Collect every live (non-empty, non-tombstone) slot, used when growing
    /// the table and when a `rebuild` needs more room than it was given.
    fn collect_entries(&self) -> Vec<(u32, u64)> {
        let mut entries = Vec::with_capacity(self.count as usize);
        for idx in 0..self.capacity {
            let slot = self.read_slot(idx);
            if slot.uid != 0 && slot.uid != TOMBSTONE {
                entries.push((slot.uid, slot.offset));
            }
        }
        entries
    }

    /// Remap the backing file at `new_capacity` slots, preserving nothing
    /// (callers re-lay-out the slot array themselves after this returns).
    fn remap(&mut self, new_capacity: u64) -> Result<(), Error> {
        unsafe { munmap(self.base as *mut std::ffi::c_void, self.mapped_len()) }
            .map_err(|err| anyhow::anyhow!("munmap() failed for uid hash: {err}"))?;

        let file_size = HEADER_SIZE as u64 + new_capacity * SLOT_SIZE as u64;
        self.file.set_len(file_size)?;

        self.base = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(file_size as usize).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.file.as_raw_fd(),
                0,
            )
        }
        .map_err(|err| anyhow::anyhow!("mmap() failed for uid hash: {err}"))? as *mut u8;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Double capacity and reinsert every live entry. Matches
    /// `mail_hash_reset`+rebuild-at-a-wider-capacity, run when `update`'s
    /// load factor ceiling would otherwise be exceeded, instead of failing
    /// the caller's append.
    fn grow(&mut self) -> Result<(), Error> {
        let entries = self.collect_entries();
        let new_capacity = (self.capacity * 2).max(16);
        self.remap(new_capacity)?;

        for idx in 0..new_capacity {
            self.write_slot(idx, Slot::default());
        }
        self.count = 0;
        self.write_u64(0, new_capacity);
        self.write_u64(8, 0);

        for (uid, offset) in entries {
            self.insert_slot(uid, offset);
            self.count += 1;
        }
        self.write_u64(8, self.count);
        Ok(())
    }

    fn insert_slot(&mut self, mut uid: u32, mut offset: u64) {
        let mut pos = (uid as u64) & self.mask();
        let mut probe_dist = 0u32;

        loop {
            let slot = self.read_slot(pos);
            if slot.uid == 0 || slot.uid == TOMBSTONE {
                self.write_slot(pos, Slot { uid, probe_dist, offset });
                return;
            }
            if slot.uid == uid {
                self.write_slot(pos, Slot { uid, probe_dist, offset });
                return;
            }
            if slot.probe_dist < probe_dist {
                self.write_slot(pos, Slot { uid, probe_dist, offset });
                uid = slot.uid;
                offset = slot.offset;
                probe_dist = slot.probe_dist;
            }
            probe_dist += 1;
            pos = (pos + 1) & self.mask();
        }
    }

    fn remove_slot(&mut self, uid: u32) -> bool {
        let mut pos = (uid as u64) & self.mask();
        let mut probe_dist = 0u32;

        loop {
            let slot = self.read_slot(pos);
            if slot.uid == 0 {
                return false;
            }
            if slot.uid == uid {
                self.write_slot(pos, Slot { uid: TOMBSTONE, probe_dist: 0, offset: 0 });
                return true;
            }
            if slot.probe_dist < probe_dist {
                return false;
            }
            probe_dist += 1;
            pos = (pos + 1) & self.mask();
        }
    }
}

impl UidHash for MmapUidHash {
    fn lookup(&self, uid: u32) -> u64 {
        if uid == 0 || uid == TOMBSTONE {
            return 0;
        }
        let mask = self.mask();
        let mut pos = (uid as u64) & mask;
        let mut probe_dist = 0u32;

        loop {
            let slot = self.read_slot(pos);
            if slot.uid == 0 {
                return 0;
            }
            if slot.uid == uid {
                return slot.offset;
            }
            if slot.probe_dist < probe_dist {
                return 0;
            }
            probe_dist += 1;
            pos = (pos + 1) & mask;
        }
    }

    fn update(&mut self, uid: u32, offset: u64) -> Result<(), Error> {
        if uid == 0 || uid == TOMBSTONE {
            bail!("cannot index reserved uid {uid}");
        }

        if offset == 0 {
            self.remove_slot(uid);
        } else {
            let existed = self.lookup(uid) != 0;
            if !existed {
                self.ensure_capacity(self.count + 1)?;
            }
            self.insert_slot(uid, offset);
            if !existed {
                self.count += 1;
            }
        }
        self.write_u64(8, self.count);
        Ok(())
    }

    fn rebuild(&mut self, entries: &[(u32, u64)]) -> Result<(), Error> {
        self.ensure_capacity(entries.len() as u64)?;

        let cap = self.capacity;
        for idx in 0..cap {
            self.write_slot(idx, Slot::default());
        }
        self.count = 0;
        self.write_u64(8, 0);

        for &(uid, offset) in entries {
            self.insert_slot(uid, offset);
            self.count += 1;
        }
        self.write_u64(8, self.count);
        Ok(())
    }

    fn ensure_capacity(&mut self, min_entries: u64) -> Result<(), Error> {
        while min_entries as f64 / self.capacity as f64 > MAX_LOAD_FACTOR {
            self.grow()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        use nix::sys::mman::{msync, MsFlags};
        unsafe { msync(self.base as *mut std::ffi::c_void, self.mapped_len(), MsFlags::MS_SYNC) }
            .map_err(|err| anyhow::anyhow!("msync() failed for uid hash: {err}"))
    }
}

impl Drop for MmapUidHash {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe {
            let _ = munmap(self.base as *mut std::ffi::c_void, self.mapped_len());
        }
        self.base = std::ptr::null_mut();
    }
}
