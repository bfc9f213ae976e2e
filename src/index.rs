//! The index file itself: header + dense record array, the lock-escalation
//! protocol layered over advisory locking, and the crash-recovery cascade.
//!
//! This is the focus of §3-§7 of the spec; structurally it follows
//! `mail_index_set_lock`/`mail_index_open_file`/`mail_index_expunge`/
//! `mail_index_append` in `original_source/src/lib-index/mail-index.c`
//! nearly line for line, re-expressed as methods on [`MailIndex`] instead
//! of function-pointer dispatch through a global struct -- the "virtual
//! methods" design note in §9 is honored at the `DataStore`/`UidHash`/
//! `ModLog` trait boundary (genuinely swappable backends), not at
//! `rebuild`/`fsck`/`compress` themselves, since this crate has exactly one
//! index format and no competing implementation to dispatch between.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::{debug, error, info, warn};

use crate::data_store::{DataStore, FileDataStore};
use crate::dir_lock::DirLock;
use crate::error::IndexError;
use crate::header::{CachedFields, HeaderFlags, IndexHeader, MsgFlags};
use crate::mapping::IndexMapping;
use crate::mod_log::{FileModLog, ModLog};
use crate::record::IndexRecord;
use crate::uid_hash::{MmapUidHash, UidHash};

/// Fixed primary file name, carried over from the original implementation
/// this spec was distilled from (§6, "Naming").
pub const INDEX_FILE_PREFIX: &str = "dovecot.index";

/// Once `next_uid` comes within this many values of `u32::MAX`, the index
/// flags itself for rebuild so a fresh `indexid` and renumbering happen on
/// the next open (§4.2 step 5).
const DEFAULT_UID_GUARD_BAND: u32 = 1024;

/// Starting capacity for a freshly created (empty) uid hash. Reopening an
/// existing index instead sizes the hash from `messages_count` so it never
/// has to fail an append for being undersized (§2.3).
const DEFAULT_UID_HASH_CAPACITY: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

/// Options threaded through `open_or_create`, gathered the way the teacher
/// gathers filesystem-creation knobs into `CreateOptions`.
#[derive(Debug, Clone, Copy)]
pub struct IndexOpenOptions {
    /// Advance the \Recent watermark on open (§4.2 step 4).
    pub update_recent: bool,
    /// Guard band before `next_uid` wraps (§4.2 step 5). Exposed mainly for
    /// tests that want to exercise the rollover without appending 4 billion
    /// records.
    pub uid_guard_band: u32,
}

impl Default for IndexOpenOptions {
    fn default() -> Self {
        Self {
            update_recent: true,
            uid_guard_band: DEFAULT_UID_GUARD_BAND,
        }
    }
}

pub struct MailIndex {
    dir: PathBuf,
    file: File,
    filepath: PathBuf,
    indexid: u32,
    lock: LockState,
    file_lock: mail_index_tools::FileLock,
    mapping: Option<IndexMapping>,
    dirty_mmap: bool,
    updating: bool,
    inconsistent: bool,
    inconsistency: Option<(u32, u32)>,
    last_lookup_seq: u32,
    last_lookup_pos: Option<usize>,
    set_flags: HeaderFlags,
    set_cache_fields: CachedFields,
    first_recent_uid: u32,
    last_error: Option<String>,
    uid_guard_band: u32,

    data_store: FileDataStore,
    uid_hash: MmapUidHash,
    mod_log: FileModLog,
}

fn read_header(file: &mut File) -> Result<IndexHeader, Error> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; IndexHeader::SIZE];
    std::io::Read::read_exact(file, &mut buf)?;
    // `buf` is a stack byte array with no particular alignment guarantee,
    // so go through `read_unaligned` rather than casting and dereferencing.
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const IndexHeader) })
}

fn check_compatible_file(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let stat = match nix::sys::stat::fstat(file.as_raw_fd()) {
        Ok(s) => s,
        Err(_) => return false,
    };
    if (stat.st_size as usize) < IndexHeader::SIZE {
        return false;
    }
    let mut file = file;
    match read_header(&mut file) {
        Ok(hdr) => hdr.is_compatible(),
        Err(_) => false,
    }
}

/// §4.1: try the canonical name first, then scan the directory for any
/// compatible sibling. An incompatible primary is ignored, not deleted.
fn find_compatible(dir: &Path) -> Option<PathBuf> {
    let primary = dir.join(INDEX_FILE_PREFIX);
    if check_compatible_file(&primary) {
        return Some(primary);
    }

    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(INDEX_FILE_PREFIX) {
            let path = dir.join(&*name);
            if check_compatible_file(&path) {
                return Some(path);
            }
        }
    }
    None
}

fn data_store_path(dir: &Path) -> PathBuf {
    dir.join(format!("{INDEX_FILE_PREFIX}.data"))
}

fn uid_hash_path(dir: &Path) -> PathBuf {
    dir.join(format!("{INDEX_FILE_PREFIX}.hash"))
}

fn mod_log_path(dir: &Path) -> PathBuf {
    dir.join(format!("{INDEX_FILE_PREFIX}.log"))
}

impl MailIndex {
    // ---- discovery, open, create (§4.1, §4.2) -----------------------------

    /// Open a compatible index if one exists, creating one under the
    /// directory lock otherwise (§4.2).
    pub fn open_or_create(dir: &Path, opts: IndexOpenOptions) -> Result<Self, Error> {
        if let Some(path) = find_compatible(dir) {
            if let Ok(index) = Self::open_file(dir, &path, &opts) {
                return Ok(index);
            }
        }

        let dir_lock = DirLock::open(dir)?;
        dir_lock.lock_exclusive()?;

        if let Some(path) = find_compatible(dir) {
            if let Ok(index) = Self::open_file(dir, &path, &opts) {
                dir_lock.unlock()?;
                return Ok(index);
            }
        }

        // Resolution of Open Question (a) in §9: the directory lock is held
        // across the entire create-then-rebuild sequence, not released
        // right after the atomic link/rename, so no other process can ever
        // observe the index before its initial rebuild has run.
        let result = Self::create(dir, &opts);
        dir_lock.unlock()?;
        result
    }

    /// Open an existing compatible index, failing if none is found.
    pub fn open(dir: &Path, opts: IndexOpenOptions) -> Result<Self, Error> {
        let path = find_compatible(dir).ok_or_else(|| anyhow::anyhow!("no compatible index in {dir:?}"))?;
        Self::open_file(dir, &path, &opts)
    }

    fn open_file(dir: &Path, path: &Path, opts: &IndexOpenOptions) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("can't open index {path:?}"))?;

        let hdr = read_header(&mut file)?;
        if !hdr.is_compatible() {
            bail!("non-compatible index file {path:?}");
        }
        let hdr_flags_at_open = hdr.flags();

        let data_store = FileDataStore::open_or_create(&data_store_path(dir))?;
        let mut uid_hash = MmapUidHash::open_or_create(&uid_hash_path(dir), hdr.messages_count as u64)?;
        // The hash file may have been left undersized by an older process,
        // or by messages appended while it was temporarily unreachable --
        // grow it to the header's own count before trusting it.
        uid_hash.ensure_capacity(hdr.messages_count as u64)?;
        let mod_log = FileModLog::open_or_create(&mod_log_path(dir))?;

        let file_lock = mail_index_tools::FileLock::open(path)?;

        let mut index = Self {
            dir: dir.to_path_buf(),
            file,
            filepath: path.to_path_buf(),
            indexid: hdr.indexid,
            lock: LockState::Unlocked,
            file_lock,
            mapping: None,
            dirty_mmap: true,
            updating: true,
            inconsistent: false,
            inconsistency: None,
            last_lookup_seq: 0,
            last_lookup_pos: None,
            set_flags: HeaderFlags::empty(),
            set_cache_fields: CachedFields::empty(),
            first_recent_uid: 1,
            last_error: None,
            uid_guard_band: opts.uid_guard_band,
            data_store,
            uid_hash,
            mod_log,
        };

        debug!("opening index {path:?}, flags at open: {hdr_flags_at_open:?}");

        let result = (|| -> Result<(), Error> {
            index.set_lock(LockState::Exclusive)?;

            if hdr_flags_at_open.contains(HeaderFlags::REBUILD) {
                warn!("index {path:?} flagged REBUILD, recovering");
                index.rebuild_all()?;
            }
            if hdr_flags_at_open.contains(HeaderFlags::FSCK) {
                warn!("index {path:?} flagged FSCK, recomputing counters");
                index.fsck()?;
            }
            if hdr_flags_at_open.contains(HeaderFlags::COMPRESS) {
                info!("index {path:?} flagged COMPRESS, eliminating tombstones");
                index.compress()?;
            }
            if hdr_flags_at_open.contains(HeaderFlags::REBUILD_HASH) {
                info!("index {path:?} flagged REBUILD_HASH, rebuilding uid hash");
                index.rebuild_hash()?;
            }
            if hdr_flags_at_open.contains(HeaderFlags::CACHE_FIELDS) {
                index.backfill_cache_fields()?;
            }
            if hdr_flags_at_open.contains(HeaderFlags::COMPRESS_DATA) {
                index.compress_data()?;
            }

            index.apply_open_init(opts.update_recent)?;
            Ok(())
        })();

        index.updating = false;

        if result.is_ok() {
            index.set_lock(LockState::Unlocked)?;
        } else {
            let _ = index.set_lock(LockState::Unlocked);
        }
        result.map(|()| index)
    }

    /// §4.2 `update_recent` and the UID-rollover guard (`mail_index_open_init`).
    fn apply_open_init(&mut self, update_recent: bool) -> Result<(), Error> {
        let (last_nonrecent_uid, next_uid) = {
            let hdr = self.mapping_mut()?.header();
            (hdr.last_nonrecent_uid, hdr.next_uid)
        };

        if update_recent && last_nonrecent_uid != next_uid.saturating_sub(1) {
            if self.lock == LockState::Shared {
                self.set_lock(LockState::Unlocked)?;
            }
            self.set_lock(LockState::Exclusive)?;

            let hdr = self.mapping_mut()?.header_mut();
            self.first_recent_uid = hdr.last_nonrecent_uid + 1;
            hdr.last_nonrecent_uid = hdr.next_uid - 1;
        } else {
            self.first_recent_uid = last_nonrecent_uid + 1;
        }

        if next_uid >= u32::MAX - self.uid_guard_band {
            self.set_flags.insert(HeaderFlags::REBUILD);
        }

        Ok(())
    }

    fn create(dir: &Path, opts: &IndexOpenOptions) -> Result<Self, Error> {
        std::fs::create_dir_all(dir)?;

        let indexid = now_secs();
        let hdr = IndexHeader::new(indexid);
        info!("creating new index in {dir:?}, indexid {indexid}");

        let tmp_name = format!(".{INDEX_FILE_PREFIX}.tmp-{}-{}", std::process::id(), indexid);
        let tmp_path = dir.join(&tmp_name);

        {
            let mut tmp_file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp_path)?;
            tmp_file.write_all(hdr.as_bytes())?;
            tmp_file.flush()?;
        }

        let canonical = dir.join(INDEX_FILE_PREFIX);
        let final_path = match nix::unistd::linkat(
            None,
            &tmp_path,
            None,
            &canonical,
            nix::unistd::LinkatFlags::NoSymlinkFollow,
        ) {
            Ok(()) => {
                let _ = std::fs::remove_file(&tmp_path);
                canonical
            }
            Err(nix::errno::Errno::EEXIST) => {
                // §4.2 step 2 fallback: PREFIX-<hostname> via rename.
                let hostname = gethostname_lossy();
                let sibling = dir.join(format!("{INDEX_FILE_PREFIX}-{hostname}"));
                std::fs::rename(&tmp_path, &sibling)?;
                sibling
            }
            Err(err) => {
                let _ = std::fs::remove_file(&tmp_path);
                bail!("link({tmp_path:?}, {canonical:?}) failed: {err}");
            }
        };

        let file = OpenOptions::new().read(true).write(true).open(&final_path)?;
        let file_lock = mail_index_tools::FileLock::open(&final_path)?;

        let data_store = FileDataStore::open_or_create(&data_store_path(dir))?;
        let uid_hash = MmapUidHash::open_or_create(&uid_hash_path(dir), DEFAULT_UID_HASH_CAPACITY)?;
        let mod_log = FileModLog::open_or_create(&mod_log_path(dir))?;

        let mut index = Self {
            dir: dir.to_path_buf(),
            file,
            filepath: final_path,
            indexid,
            lock: LockState::Unlocked,
            file_lock,
            mapping: None,
            dirty_mmap: true,
            updating: true,
            inconsistent: false,
            inconsistency: None,
            last_lookup_seq: 0,
            last_lookup_pos: None,
            set_flags: HeaderFlags::empty(),
            set_cache_fields: CachedFields::empty(),
            first_recent_uid: 1,
            last_error: None,
            uid_guard_band: opts.uid_guard_band,
            data_store,
            uid_hash,
            mod_log,
        };

        index.set_lock(LockState::Exclusive)?;
        index.rebuild_all()?;
        index.apply_open_init(opts.update_recent)?;
        index.updating = false;

        index.set_lock(LockState::Unlocked)?;

        Ok(index)
    }

    // ---- locking (§4.3) ----------------------------------------------------

    pub fn lock_state(&self) -> LockState {
        self.lock
    }

    pub fn is_inconsistency_error(&self) -> bool {
        self.inconsistent
    }

    pub fn get_last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Lowest UID that still counts as `\Recent` (§4.2 step 4).
    pub fn first_recent_uid(&self) -> u32 {
        self.first_recent_uid
    }

    pub fn path(&self) -> &Path {
        &self.filepath
    }

    fn set_error(&mut self, msg: impl Into<String>) {
        self.last_error = Some(msg.into());
    }

    fn mark_corrupt(&mut self, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        warn!("marking index {:?} for rebuild: {msg}", self.filepath);
        if let Some(mapping) = self.mapping.as_mut() {
            mapping.header_mut().insert_flags(HeaderFlags::REBUILD);
        } else {
            self.set_flags.insert(HeaderFlags::REBUILD);
        }
        self.set_error(msg.clone());
        Error::new(IndexError::Corrupt(msg))
    }

    fn mapping_mut(&mut self) -> Result<&mut IndexMapping, Error> {
        self.mapping
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("index not locked"))
    }

    fn mapping(&self) -> Result<&IndexMapping, Error> {
        self.mapping
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("index not locked"))
    }

    /// Re-establish the mapping if `dirty_mmap` is set (§4.3, "Mapping"). A
    /// file shorter than the header (truncated out from under us) self-heals
    /// into a fresh, REBUILD-flagged header rather than failing every open
    /// forever.
    fn refresh_mapping_if_dirty(&mut self) -> Result<(), Error> {
        if self.mapping.is_none() {
            self.mapping = Some(match IndexMapping::map(&self.file) {
                Ok(mapping) => mapping,
                Err(err) => self.recover_from_truncated_file(err)?,
            });
            self.dirty_mmap = false;
        } else if self.dirty_mmap {
            if let Err(err) = self.mapping.as_mut().unwrap().refresh(&self.file) {
                let mapping = self.recover_from_truncated_file(err)?;
                self.mapping = Some(mapping);
            }
            self.dirty_mmap = false;
        }
        Ok(())
    }

    /// Short mapping ⇒ truncated file ⇒ reset to a fresh header (already
    /// REBUILD-flagged by `IndexHeader::new`) and remap, so the normal
    /// recovery cascade picks it up on the next lock cycle (§4.3 "Mapping").
    fn recover_from_truncated_file(&mut self, cause: Error) -> Result<IndexMapping, Error> {
        warn!("index {:?} mapping failed ({cause}), resetting to a fresh header", self.filepath);
        self.set_error(format!("truncated index file, rebuilding: {cause}"));

        let fresh_indexid = now_secs();
        let hdr = IndexHeader::new(fresh_indexid);
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(hdr.as_bytes())?;
        self.file.flush()?;
        self.indexid = fresh_indexid;

        IndexMapping::map(&self.file)
    }

    /// Flushes the data store, msyncs the mapping, syncs the hash and
    /// modification log, and fsyncs the index file (§4.3 step 2,
    /// `mail_index_sync_file`).
    fn sync_file(&mut self) -> Result<(), Error> {
        self.data_store.sync()?;
        if let Some(mapping) = self.mapping.as_ref() {
            mapping.msync(mapping.len())?;
        }
        self.uid_hash.sync()?;
        self.mod_log.sync()?;
        self.file.flush()?;
        nix::unistd::fsync(self.file.as_raw_fd()).map_err(|err| anyhow::anyhow!("fsync failed: {err}"))?;
        Ok(())
    }

    /// Pick up changes another process may have made since our last lock
    /// (§5, "Ordering guarantees"). This crate's backends have no
    /// independent external-change cache beyond the mapping (which is
    /// refreshed separately), so this flushes our own pending writers --
    /// the hook point still matches where the spec calls `index->sync()`.
    fn subsystem_sync(&mut self) -> Result<(), Error> {
        self.uid_hash.sync()?;
        self.mod_log.flush_failures()?;
        Ok(())
    }

    fn fold_pending_header_changes(&mut self) -> Result<(), Error> {
        let set_flags = self.set_flags;
        let set_cache_fields = self.set_cache_fields;
        let hdr = self.mapping_mut()?.header_mut();
        if !set_flags.is_empty() {
            hdr.insert_flags(set_flags);
        }
        if !set_cache_fields.is_empty() {
            hdr.cache_fields |= set_cache_fields.bits();
        }
        self.set_flags = HeaderFlags::empty();
        self.set_cache_fields = CachedFields::empty();
        Ok(())
    }

    /// Non-blocking variant; never performs escalation side effects (§4.3).
    pub fn try_lock(&mut self, target: LockState) -> Result<bool, Error> {
        if self.inconsistent {
            bail!(self.inconsistency_error());
        }
        if self.lock == target {
            return Ok(true);
        }
        if target == LockState::Exclusive && self.lock == LockState::Shared {
            debug_assert!(false, "Shared -> Exclusive lock upgrade is forbidden");
            bail!(IndexError::LockContract(
                "Shared -> Exclusive upgrade is forbidden; drop to Unlocked first".into()
            ));
        }

        use mail_index_tools::LockKind;
        let acquired = match target {
            LockState::Unlocked => {
                self.file_lock.unlock()?;
                true
            }
            LockState::Shared => self.file_lock.try_lock(LockKind::Shared)?,
            LockState::Exclusive => self.file_lock.try_lock(LockKind::Exclusive)?,
        };
        if acquired {
            self.lock = target;
        }
        Ok(acquired)
    }

    /// Blocking escalation protocol (§4.3). Mirrors `mail_index_set_lock`.
    pub fn set_lock(&mut self, target: LockState) -> Result<(), Error> {
        if self.inconsistent {
            bail!(self.inconsistency_error());
        }
        if self.lock == target {
            return Ok(());
        }
        if target == LockState::Exclusive && self.lock == LockState::Shared {
            debug_assert!(false, "Shared -> Exclusive lock upgrade is forbidden");
            bail!(IndexError::LockContract(
                "Shared -> Exclusive upgrade is forbidden; drop to Unlocked first".into()
            ));
        }

        if self.lock == LockState::Exclusive {
            // releasing exclusive
            if let Some(mapping) = self.mapping.as_mut() {
                mapping.header_mut().remove_flags(HeaderFlags::FSCK);
            }
            self.fold_pending_header_changes()?;
            self.sync_file()?;
        }

        if target != LockState::Unlocked && self.lock == LockState::Unlocked && !self.updating {
            self.updating = true;
            let sync_result = self.subsystem_sync();
            let result = sync_result.and_then(|()| self.set_lock(target));
            self.updating = false;
            return result;
        }

        use mail_index_tools::LockKind;
        match target {
            LockState::Unlocked => self.file_lock.unlock()?,
            LockState::Shared => self.file_lock.lock_blocking(LockKind::Shared)?,
            LockState::Exclusive => self.file_lock.lock_blocking(LockKind::Exclusive)?,
        }

        if target == LockState::Unlocked {
            self.last_lookup_seq = 0;
            self.last_lookup_pos = None;
        }

        let old_lock = self.lock;
        self.lock = target;

        if target != LockState::Unlocked {
            if let Err(err) = self.refresh_mapping_if_dirty() {
                let _ = self.set_lock(LockState::Unlocked);
                return Err(err);
            }

            let on_disk_indexid = self.mapping()?.header().indexid;
            if on_disk_indexid != self.indexid {
                self.inconsistent = true;
                self.inconsistency = Some((self.indexid, on_disk_indexid));
                let msg = format!(
                    "Inconsistency - index was rebuilt while we had it open ({} != {})",
                    self.indexid, on_disk_indexid
                );
                error!("{msg}");
                self.set_error(msg);
                bail!(self.inconsistency_error());
            }
        } else if old_lock == LockState::Shared {
            // releasing shared: don't let hints get lost (§4.3 step 6)
            let (flags, cache_fields) = {
                let hdr = self.mapping()?.header();
                (hdr.flags(), hdr.cache_fields())
            };
            let needs_header_write = (flags | self.set_flags) != flags
                || (CachedFields::from_bits_truncate(cache_fields.bits() | self.set_cache_fields.bits())
                    != cache_fields);

            if needs_header_write {
                self.updating = true;
                if self.set_lock(LockState::Exclusive).is_ok() {
                    self.fold_pending_header_changes()?;
                }
                self.updating = false;
                return self.set_lock(LockState::Unlocked);
            }
        }

        if target == LockState::Exclusive {
            let mapping = self.mapping_mut()?;
            mapping.header_mut().insert_flags(HeaderFlags::FSCK);
            mapping.msync_header()?;
        }

        let needs_rebuild = target != LockState::Unlocked
            && !self.updating
            && self.mapping()?.header().flags().contains(HeaderFlags::REBUILD);

        if needs_rebuild {
            self.updating = true;
            if target == LockState::Shared {
                self.set_lock(LockState::Unlocked)?;
            }
            let rebuild_result = self.rebuild_all();
            let result = rebuild_result.and_then(|()| self.set_lock(target));
            self.updating = false;
            return result;
        }

        if target == LockState::Unlocked {
            self.last_lookup_seq = 0;
            self.last_lookup_pos = None;
        }

        Ok(())
    }

    fn inconsistency_error(&self) -> IndexError {
        let (expected, found) = self.inconsistency.unwrap_or((self.indexid, self.indexid));
        IndexError::Inconsistent { expected, found }
    }

    // ---- lookup (§4.4) ------------------------------------------------------

    /// `lookup_by_seq`: returns the record's 0-based array position.
    pub fn lookup_by_seq(&mut self, seq: u32) -> Result<Option<usize>, Error> {
        if seq == 0 {
            bail!("sequence numbers are 1-based");
        }

        if Some(seq) == self.last_lookup_seq_opt() {
            if let Some(pos) = self.last_lookup_pos {
                if self.mapping()?.record(pos).map(|r| !r.is_tombstone()).unwrap_or(false) {
                    return Ok(Some(pos));
                }
            }
        }

        self.refresh_mapping_if_dirty()?;
        let mapping = self.mapping()?;
        let target_pos = seq as usize - 1;
        if target_pos >= mapping.record_count() {
            return Ok(None);
        }

        let first_hole_pos = mapping.header().first_hole_position;
        let seek_offset = mapping.record_offset(target_pos);

        let pos = if first_hole_pos == 0 || first_hole_pos > seek_offset {
            if mapping.record(target_pos).unwrap().is_tombstone() {
                return Err(self.mark_corrupt(
                    "first_hole_position wasn't updated properly: record at expected dense position is a tombstone",
                ));
            }
            target_pos
        } else {
            let (mut cur_pos, mut cur_seq) = match (self.last_lookup_pos, self.last_lookup_seq_opt()) {
                (Some(p), Some(s)) if seq > s => (p, s),
                _ => {
                    let hole_records = mapping.header().first_hole_records;
                    if hole_records == 0 {
                        return Err(self.mark_corrupt("first_hole_records is 0 but first_hole_position is set"));
                    }
                    let hole_pos = mapping.position_of_offset(first_hole_pos);
                    (hole_pos + hole_records as usize, hole_pos as u32 + 1)
                }
            };

            while cur_seq < seq && cur_pos < mapping.record_count() {
                if !mapping.record(cur_pos).unwrap().is_tombstone() {
                    cur_seq += 1;
                }
                if cur_seq == seq {
                    break;
                }
                cur_pos += 1;
            }

            if cur_pos >= mapping.record_count() {
                return Ok(None);
            }
            cur_pos
        };

        self.last_lookup_seq = seq;
        self.last_lookup_pos = Some(pos);
        Ok(Some(pos))
    }

    fn last_lookup_seq_opt(&self) -> Option<u32> {
        if self.last_lookup_seq == 0 {
            None
        } else {
            Some(self.last_lookup_seq)
        }
    }

    /// Probe the hash for up to 5 UIDs at the low end, fall back to a
    /// linear scan (§4.4).
    pub fn lookup_uid_range(&mut self, first_uid: u32, last_uid: u32) -> Result<Option<usize>, Error> {
        if first_uid == 0 || last_uid == 0 {
            bail!("uid 0 is reserved for tombstones");
        }
        if first_uid > last_uid {
            return Ok(None);
        }

        self.refresh_mapping_if_dirty()?;

        let last_try_uid = last_uid.min(first_uid.saturating_add(4));
        for uid in first_uid..=last_try_uid {
            let offset = self.uid_hash.lookup(uid);
            if offset != 0 {
                let pos = self.mapping()?.position_of_offset(offset);
                return Ok(Some(pos));
            }
        }

        let mapping = self.mapping()?;
        for pos in 0..mapping.record_count() {
            let rec = mapping.record(pos).unwrap();
            if rec.uid != 0 {
                if rec.uid > last_uid {
                    return Ok(None);
                }
                if rec.uid >= first_uid {
                    return Ok(Some(pos));
                }
            }
        }
        Ok(None)
    }

    /// First live record after `pos`, or `None`.
    pub fn next(&self, pos: usize) -> Option<usize> {
        let mapping = self.mapping.as_ref()?;
        let mut p = pos + 1;
        while p < mapping.record_count() {
            if !mapping.record(p).unwrap().is_tombstone() {
                return Some(p);
            }
            p += 1;
        }
        None
    }

    /// Sequence number of the record at `pos` (§4.4).
    pub fn get_sequence(&mut self, pos: usize) -> Result<u32, Error> {
        if self.last_lookup_pos == Some(pos) {
            if let Some(seq) = self.last_lookup_seq_opt() {
                return Ok(seq);
            }
        }

        let mapping = self.mapping()?;
        let first_hole_pos = mapping.header().first_hole_position;

        if first_hole_pos == 0 {
            return Ok(pos as u32 + 1);
        }

        let hole_pos = mapping.position_of_offset(first_hole_pos);
        if pos < hole_pos {
            return Ok(pos as u32 + 1);
        }

        let hole_records = mapping.header().first_hole_records as usize;
        let mut seq = hole_pos as u32 + 1;
        let mut p = hole_pos + hole_records;
        while p != pos {
            if !mapping.record(p).unwrap().is_tombstone() {
                seq += 1;
            }
            p += 1;
        }
        Ok(seq)
    }

    pub fn record_at(&self, pos: usize) -> Option<IndexRecord> {
        self.mapping.as_ref()?.record(pos).copied()
    }

    pub fn header_snapshot(&self) -> Result<IndexHeader, Error> {
        Ok(*self.mapping()?.header())
    }

    /// The full modification log, oldest first.
    pub fn read_mod_log(&mut self) -> Result<Vec<crate::mod_log::ModLogEvent>, Error> {
        self.mod_log.read_all()
    }

    // ---- append (§4.5) -------------------------------------------------------

    pub fn append(&mut self, msg_flags: MsgFlags, data: &[u8]) -> Result<usize, Error> {
        if self.lock != LockState::Exclusive {
            bail!(IndexError::LockContract("append requires the exclusive lock".into()));
        }

        let data_offset = self.data_store.append(data)?;
        let data_size = data.len() as u32;

        let uid = {
            let hdr = self.mapping_mut()?.header_mut();
            let uid = hdr.next_uid;
            hdr.next_uid += 1;
            uid
        };

        let record = IndexRecord {
            uid,
            msg_flags: msg_flags.bits(),
            cached_fields: self.mapping()?.header().cache_fields().bits(),
            data_size,
            data_offset,
        };

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(unsafe {
            std::slice::from_raw_parts(&record as *const IndexRecord as *const u8, crate::record::RECORD_SIZE)
        })?;
        self.file.flush()?;

        {
            let hdr = self.mapping_mut()?.header_mut();
            hdr.messages_count += 1;
        }
        self.mark_flag_transition_counts(uid, MsgFlags::empty(), msg_flags)?;

        let file_offset = IndexHeader::SIZE as u64
            + (self.mapping()?.record_count()) as u64 * crate::record::RECORD_SIZE as u64;
        self.uid_hash.update(uid, file_offset)?;

        self.dirty_mmap = true;
        self.refresh_mapping_if_dirty()?;

        let pos = self.mapping()?.position_of_offset(file_offset);
        Ok(pos)
    }

    // ---- expunge (§4.6) -------------------------------------------------------

    pub fn expunge(&mut self, pos: usize, seq: u32, external: bool) -> Result<(), Error> {
        if self.lock != LockState::Exclusive {
            bail!(IndexError::LockContract("expunge requires the exclusive lock".into()));
        }

        let (uid, old_flags, data_size) = {
            let rec = self
                .mapping()?
                .record(pos)
                .ok_or_else(|| anyhow::anyhow!("no record at position {pos}"))?;
            if rec.uid == 0 {
                bail!("record at position {pos} is already expunged");
            }
            (rec.uid, rec.msg_flags(), rec.data_size)
        };

        if seq != 0 {
            self.mod_log.add_expunge(seq, uid, external)?;
        }

        self.uid_hash.update(uid, 0)?;

        {
            let mapping = self.mapping_mut()?;
            let rec = mapping.record_mut(pos).unwrap();
            rec.uid = 0;
        }

        if seq != 0 {
            if seq == self.last_lookup_seq {
                self.last_lookup_pos = None;
                self.last_lookup_seq = 0;
            } else if seq < self.last_lookup_seq {
                self.last_lookup_seq -= 1;
            }
        }

        let pos_offset = self.mapping()?.record_offset(pos);
        {
            let hdr = self.mapping_mut()?.header_mut();
            if hdr.first_hole_position == 0 {
                hdr.first_hole_position = pos_offset;
                hdr.first_hole_records = 1;
            } else if hdr.first_hole_position == pos_offset + crate::record::RECORD_SIZE as u64 {
                hdr.first_hole_position = pos_offset;
                hdr.first_hole_records += 1;
            } else if hdr.first_hole_position
                + hdr.first_hole_records as u64 * crate::record::RECORD_SIZE as u64
                == pos_offset
            {
                hdr.first_hole_records += 1;
            } else {
                hdr.insert_flags(HeaderFlags::COMPRESS);
                if hdr.first_hole_position > pos_offset {
                    hdr.first_hole_position = pos_offset;
                    hdr.first_hole_records = 1;
                }
            }
        }
        self.update_first_hole_records_extension()?;

        {
            let hdr = self.mapping_mut()?.header_mut();
            hdr.messages_count -= 1;
        }
        self.mark_flag_transition_counts(uid, old_flags, MsgFlags::empty())?;

        let messages_count = self.mapping()?.header().messages_count;
        if messages_count == 0 {
            self.truncate_to_empty()?;
        } else {
            self.data_store.add_deleted_space(data_size);
        }

        Ok(())
    }

    /// Greedily absorb further contiguous tombstones after the hole grew on
    /// its right edge (`update_first_hole_records` in the original).
    fn update_first_hole_records_extension(&mut self) -> Result<(), Error> {
        let mapping = self.mapping_mut()?;
        let hdr = *mapping.header();
        if hdr.first_hole_position == 0 {
            return Ok(());
        }
        let start = mapping.position_of_offset(hdr.first_hole_position) + hdr.first_hole_records as usize;
        let mut extra = 0u32;
        let mut p = start;
        while p < mapping.record_count() && mapping.record(p).unwrap().is_tombstone() {
            extra += 1;
            p += 1;
        }
        if extra > 0 {
            mapping.header_mut().first_hole_records += extra;
        }
        Ok(())
    }

    fn truncate_to_empty(&mut self) -> Result<(), Error> {
        {
            let hdr = self.mapping_mut()?.header_mut();
            hdr.first_hole_position = 0;
            hdr.first_hole_records = 0;
        }
        self.file.set_len(IndexHeader::SIZE as u64)?;
        self.data_store.reset()?;
        self.dirty_mmap = true;
        self.refresh_mapping_if_dirty()?;
        Ok(())
    }

    // ---- flags (§4.7) -------------------------------------------------------

    pub fn set_flags(&mut self, pos: usize, seq: u32, new_flags: MsgFlags, external: bool) -> Result<(), Error> {
        if self.lock != LockState::Exclusive {
            bail!(IndexError::LockContract("set_flags requires the exclusive lock".into()));
        }
        if seq == 0 {
            bail!("set_flags requires a non-zero sequence number");
        }

        let (uid, old_flags) = {
            let rec = self
                .mapping()?
                .record(pos)
                .ok_or_else(|| anyhow::anyhow!("no record at position {pos}"))?;
            (rec.uid, rec.msg_flags())
        };

        if old_flags == new_flags {
            return Ok(());
        }

        self.mark_flag_transition_counts(uid, old_flags, new_flags)?;

        self.mapping_mut()?.record_mut(pos).unwrap().msg_flags = new_flags.bits();

        self.mod_log.add_flags(seq, uid, external)?;
        Ok(())
    }

    /// `index_mark_flag_changes`: exactly one transition per call, in
    /// priority order unseen->seen, seen->unseen, undeleted->deleted,
    /// deleted->undeleted (§4.7, §9(b)). Preserved, not "fixed": a caller
    /// that flips both SEEN and DELETED in one `set_flags` only gets one
    /// counter updated per invocation, matching the original.
    fn mark_flag_transition_counts(&mut self, uid: u32, old: MsgFlags, new: MsgFlags) -> Result<(), Error> {
        let hdr = self.mapping_mut()?.header_mut();

        if !old.contains(MsgFlags::SEEN) && new.contains(MsgFlags::SEEN) {
            hdr.seen_messages_count += 1;
        } else if old.contains(MsgFlags::SEEN) && !new.contains(MsgFlags::SEEN) {
            if hdr.seen_messages_count == hdr.messages_count {
                hdr.first_unseen_uid_lowwater = uid;
            } else if uid < hdr.first_unseen_uid_lowwater {
                hdr.first_unseen_uid_lowwater = uid;
            }
            hdr.seen_messages_count -= 1;
        } else if !old.contains(MsgFlags::DELETED) && new.contains(MsgFlags::DELETED) {
            hdr.deleted_messages_count += 1;
            if hdr.deleted_messages_count == 1 {
                hdr.first_deleted_uid_lowwater = uid;
            } else if uid < hdr.first_deleted_uid_lowwater {
                hdr.first_deleted_uid_lowwater = uid;
            }
        } else if old.contains(MsgFlags::DELETED) && !new.contains(MsgFlags::DELETED) {
            hdr.deleted_messages_count -= 1;
        }

        Ok(())
    }

    // ---- recovery cascade (§4.2 step 3, §5 "Recovery scope") ----------------

    /// REBUILD: recompute everything this core can derive from the record
    /// array and rebuild the UID hash from it. The original rebuilds
    /// records from the mailbox's actual message store; that store is out
    /// of this spec's scope (§1), so here REBUILD and FSCK converge on the
    /// same recomputation -- see DESIGN.md.
    fn rebuild_all(&mut self) -> Result<(), Error> {
        self.recompute_counters()?;
        if self.needs_uid_renumber()? {
            self.renumber_uids()?;
            // Renumbering moves the uids first_unseen/first_deleted_uid_lowwater
            // pointed at, so recompute those (and the plain counters) again.
            self.recompute_counters()?;
        }
        self.rebuild_hash()?;
        self.mapping_mut()?.header_mut().remove_flags(HeaderFlags::REBUILD);
        Ok(())
    }

    /// `next_uid` is close enough to `u32::MAX` that the guard band from
    /// `apply_open_init` tripped (§4.2 step 5).
    fn needs_uid_renumber(&mut self) -> Result<bool, Error> {
        let next_uid = self.mapping_mut()?.header().next_uid;
        Ok(next_uid >= u32::MAX - self.uid_guard_band)
    }

    /// Assign a fresh `indexid`/`uid_validity` and densely renumber every
    /// live record's uid starting at 1, so `next_uid` moves back far from
    /// `u32::MAX` (§4.2 step 5, §3 "file was rebuilt under us"). Only this
    /// handle's own `indexid` is advanced in lockstep with what's written to
    /// disk -- every other open handle will see the mismatch on its next
    /// `set_lock` and correctly report inconsistency.
    fn renumber_uids(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;
        let fresh_indexid = now_secs();

        let mut next_uid = 1u32;
        let count = self.mapping()?.record_count();
        for pos in 0..count {
            let mapping = self.mapping_mut()?;
            if let Some(rec) = mapping.record_mut(pos) {
                if rec.uid != 0 {
                    rec.uid = next_uid;
                    next_uid += 1;
                }
            }
        }

        {
            let hdr = self.mapping_mut()?.header_mut();
            hdr.indexid = fresh_indexid;
            hdr.uid_validity = fresh_indexid;
            hdr.next_uid = next_uid;
        }
        self.indexid = fresh_indexid;
        warn!(
            "index {:?} hit the uid rollover guard band, renumbered and assigned fresh indexid {fresh_indexid}",
            self.filepath
        );
        Ok(())
    }

    /// FSCK: recompute counters and `first_hole_*` without discarding
    /// records (§4.2).
    fn fsck(&mut self) -> Result<(), Error> {
        self.recompute_counters()
    }

    fn recompute_counters(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;
        let mapping = self.mapping_mut()?;
        let count = mapping.record_count();

        let mut messages_count = 0u32;
        let mut seen = 0u32;
        let mut deleted = 0u32;
        let mut first_unseen = u32::MAX;
        let mut first_deleted = u32::MAX;
        let mut first_hole_position = 0u64;
        let mut first_hole_records = 0u32;
        let mut in_hole = false;

        for pos in 0..count {
            let rec = *mapping.record(pos).unwrap();
            if rec.uid == 0 {
                if !in_hole && first_hole_position == 0 {
                    first_hole_position = mapping.record_offset(pos);
                    in_hole = true;
                }
                if first_hole_position == mapping.record_offset(pos) {
                    first_hole_records += 1;
                }
                continue;
            }
            in_hole = false;
            messages_count += 1;
            let flags = rec.msg_flags();
            if flags.contains(MsgFlags::SEEN) {
                seen += 1;
            } else if rec.uid < first_unseen {
                first_unseen = rec.uid;
            }
            if flags.contains(MsgFlags::DELETED) {
                deleted += 1;
                if rec.uid < first_deleted {
                    first_deleted = rec.uid;
                }
            }
        }

        if first_unseen == u32::MAX {
            first_unseen = 0;
        }
        if first_deleted == u32::MAX {
            first_deleted = 0;
        }

        let hdr = mapping.header_mut();
        hdr.messages_count = messages_count;
        hdr.seen_messages_count = seen;
        hdr.deleted_messages_count = deleted;
        hdr.first_unseen_uid_lowwater = first_unseen;
        hdr.first_deleted_uid_lowwater = first_deleted;
        hdr.first_hole_position = first_hole_position;
        hdr.first_hole_records = first_hole_records;

        Ok(())
    }

    /// COMPRESS: rewrite the index eliminating tombstones, shifting
    /// records down and re-keying the hash.
    fn compress(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;

        let live: Vec<IndexRecord> = {
            let mapping = self.mapping()?;
            (0..mapping.record_count())
                .filter_map(|pos| mapping.record(pos).copied())
                .filter(|r| !r.is_tombstone())
                .collect()
        };

        self.file.seek(SeekFrom::Start(IndexHeader::SIZE as u64))?;
        for rec in &live {
            self.file.write_all(unsafe {
                std::slice::from_raw_parts(rec as *const IndexRecord as *const u8, crate::record::RECORD_SIZE)
            })?;
        }
        let new_len = IndexHeader::SIZE as u64 + live.len() as u64 * crate::record::RECORD_SIZE as u64;
        self.file.set_len(new_len)?;
        self.file.flush()?;

        self.dirty_mmap = true;
        self.refresh_mapping_if_dirty()?;

        {
            let hdr = self.mapping_mut()?.header_mut();
            hdr.first_hole_position = 0;
            hdr.first_hole_records = 0;
            hdr.remove_flags(HeaderFlags::COMPRESS);
        }

        let entries: Vec<(u32, u64)> = live
            .iter()
            .enumerate()
            .map(|(pos, rec)| (rec.uid, IndexHeader::SIZE as u64 + pos as u64 * crate::record::RECORD_SIZE as u64))
            .collect();
        self.uid_hash.rebuild(&entries)?;

        self.last_lookup_seq = 0;
        self.last_lookup_pos = None;

        Ok(())
    }

    /// REBUILD_HASH: recompute the hash only.
    fn rebuild_hash(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;
        let entries: Vec<(u32, u64)> = {
            let mapping = self.mapping()?;
            (0..mapping.record_count())
                .filter_map(|pos| mapping.record(pos).map(|r| (pos, r)))
                .filter(|(_, r)| !r.is_tombstone())
                .map(|(pos, r)| (r.uid, mapping.record_offset(pos)))
                .collect()
        };

        self.uid_hash.rebuild(&entries)?;
        self.mapping_mut()?.header_mut().remove_flags(HeaderFlags::REBUILD_HASH);
        Ok(())
    }

    /// CACHE_FIELDS: promote `cache_fields` by marking matching data
    /// verified present on every live record (§4.2). This crate stores one
    /// opaque blob per message rather than per-field entries, so "backfill"
    /// here means: verify the blob is still readable, then promote the
    /// record's `cached_fields` to the header's target set.
    fn backfill_cache_fields(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;
        let target = self.mapping()?.header().cache_fields();

        let positions: Vec<usize> = {
            let mapping = self.mapping()?;
            (0..mapping.record_count())
                .filter(|&pos| !mapping.record(pos).unwrap().is_tombstone())
                .collect()
        };

        for pos in positions {
            let (offset, size) = {
                let rec = self.mapping()?.record(pos).unwrap();
                (rec.data_offset, rec.data_size)
            };
            if self.data_store.verify(offset, size)? {
                self.mapping_mut()?.record_mut(pos).unwrap().cached_fields = target.bits();
            }
        }

        self.mapping_mut()?.header_mut().remove_flags(HeaderFlags::CACHE_FIELDS);
        Ok(())
    }

    /// COMPRESS_DATA: garbage-collect unused ranges in the data store by
    /// rewriting it with only the bytes live records still reference,
    /// updating `data_offset` in place. Runs after `backfill_cache_fields`
    /// since backfill can leave holes (§4.2).
    fn compress_data(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;

        let tmp_path = data_store_path(&self.dir).with_extension("data.compact");
        let mut new_store = FileDataStore::open_or_create(&tmp_path)?;

        let positions: Vec<usize> = {
            let mapping = self.mapping()?;
            (0..mapping.record_count())
                .filter(|&pos| !mapping.record(pos).unwrap().is_tombstone())
                .collect()
        };

        for pos in positions {
            let (offset, size) = {
                let rec = self.mapping()?.record(pos).unwrap();
                (rec.data_offset, rec.data_size)
            };
            let data = self.data_store.lookup(offset, size)?;
            let new_offset = new_store.append(&data)?;
            self.mapping_mut()?.record_mut(pos).unwrap().data_offset = new_offset;
        }

        new_store.sync()?;
        drop(new_store);
        std::fs::rename(&tmp_path, data_store_path(&self.dir))?;
        self.data_store = FileDataStore::open_or_create(&data_store_path(&self.dir))?;

        self.mapping_mut()?.header_mut().remove_flags(HeaderFlags::COMPRESS_DATA);
        Ok(())
    }

    /// All testable invariants I1-I6 (§8), checked after every mutation in
    /// the integration tests.
    pub fn check_invariants(&mut self) -> Result<(), Error> {
        self.refresh_mapping_if_dirty()?;
        let mapping = self.mapping()?;
        let hdr = *mapping.header();

        let mut live = 0u32;
        let mut seen = 0u32;
        let mut deleted = 0u32;
        for pos in 0..mapping.record_count() {
            let rec = mapping.record(pos).unwrap();
            if rec.uid != 0 {
                live += 1;
                if rec.msg_flags().contains(MsgFlags::SEEN) {
                    seen += 1;
                }
                if rec.msg_flags().contains(MsgFlags::DELETED) {
                    deleted += 1;
                }
                if rec.uid >= hdr.next_uid {
                    bail!("I5 violated: record uid {} >= next_uid {}", rec.uid, hdr.next_uid);
                }
                if rec.uid < hdr.first_unseen_uid_lowwater && !rec.msg_flags().contains(MsgFlags::SEEN) {
                    bail!("I4 violated: unseen record below first_unseen_uid_lowwater");
                }
                if rec.uid < hdr.first_deleted_uid_lowwater && !rec.msg_flags().contains(MsgFlags::DELETED) {
                    bail!("I4 violated: undeleted record below first_deleted_uid_lowwater");
                }
            }
        }

        if live != hdr.messages_count {
            bail!("I1 violated: messages_count {} != live {}", hdr.messages_count, live);
        }
        if seen != hdr.seen_messages_count {
            bail!("I2 violated: seen_messages_count {} != actual {}", hdr.seen_messages_count, seen);
        }
        if deleted != hdr.deleted_messages_count {
            bail!("I2 violated: deleted_messages_count {} != actual {}", hdr.deleted_messages_count, deleted);
        }
        if hdr.seen_messages_count > hdr.messages_count || hdr.deleted_messages_count > hdr.messages_count {
            bail!("I2 violated: counters exceed messages_count");
        }

        if hdr.first_hole_position == 0 {
            // no tombstones
        } else {
            let pos = mapping.position_of_offset(hdr.first_hole_position);
            for i in 0..hdr.first_hole_records as usize {
                if !mapping.record(pos + i).map(|r| r.is_tombstone()).unwrap_or(false) {
                    bail!("I3 violated: hole record at {} isn't a tombstone", pos + i);
                }
            }
        }

        let expected_len = IndexHeader::SIZE as u64 + mapping.record_count() as u64 * crate::record::RECORD_SIZE as u64;
        if mapping.len() as u64 != expected_len {
            bail!("I6 violated: mapping length doesn't match header+records");
        }

        Ok(())
    }
}

fn now_secs() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn gethostname_lossy() -> String {
    nix::unistd::gethostname()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}
