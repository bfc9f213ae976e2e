//! The fixed-size header at offset 0 of the index file.
//!
//! Layout mirrors the teacher's `FixedIndexHeader` (a `#[repr(C)]` struct
//! padded to a round size with a `reserved` tail) but sized for a record
//! index rather than a page-sized chunk index: callers mmap the header far
//! more often per open than a content-addressed store ever remaps its
//! 4096-byte page, so 256 bytes is plenty and keeps tiny mailboxes cheap.

use bitflags::bitflags;

/// Size/endian fingerprint stored in `compat_data`. A file whose
/// `compat_data` differs from this is not ours, full stop -- see
/// `MailIndex::check_compat`.
pub const COMPAT_FLAGS: u8 = 0x01;

/// Exact version this implementation understands. Bumped whenever the
/// on-disk record or header layout changes incompatibly.
pub const INDEX_VERSION: u32 = 1;

bitflags! {
    /// Header-level recovery/maintenance markers.
    ///
    /// Each bit persists a "needs recovery of kind X" decision across a
    /// crash; see `MailIndex::open_file`'s recovery cascade.
    #[derive(Default)]
    pub struct HeaderFlags: u32 {
        const REBUILD        = 0b0000_0001;
        const FSCK           = 0b0000_0010;
        const COMPRESS       = 0b0000_0100;
        const COMPRESS_DATA  = 0b0000_1000;
        const REBUILD_HASH   = 0b0001_0000;
        const CACHE_FIELDS   = 0b0010_0000;
    }
}

bitflags! {
    /// Which per-message data-store fields the index promises to cache
    /// for every future record (`header.cache_fields`), and which fields a
    /// given record actually has cached (`record.cached_fields`).
    #[derive(Default)]
    pub struct CachedFields: u32 {
        const LOCATION = 0b0000_0001;
        const HEADER   = 0b0000_0010;
        const BODY     = 0b0000_0100;
    }
}

bitflags! {
    /// Per-message flags (`record.msg_flags`).
    #[derive(Default)]
    pub struct MsgFlags: u32 {
        const SEEN    = 0b0000_0001;
        const DELETED = 0b0000_0010;
        const FLAGGED = 0b0000_0100;
        const ANSWERED = 0b0000_1000;
        const DRAFT   = 0b0001_0000;
    }
}

const HEADER_SIZE: usize = 256;
const HEADER_FIXED_SIZE: usize = 64;

/// On-disk index header. `#[repr(C)]`, exactly [`HEADER_SIZE`] bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IndexHeader {
    /// `[flag_byte, sizeof(u32), sizeof(i64), sizeof(u64)]`
    pub compat_data: [u8; 4],
    pub version: u32,
    pub indexid: u32,
    pub flags: u32,
    pub cache_fields: u32,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub messages_count: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,
    pub first_unseen_uid_lowwater: u32,
    pub first_deleted_uid_lowwater: u32,
    pub first_hole_position: u64,
    pub first_hole_records: u32,
    pub last_nonrecent_uid: u32,
    reserved: [u8; HEADER_SIZE - HEADER_FIXED_SIZE],
}

const _: () = assert!(std::mem::size_of::<IndexHeader>() == HEADER_SIZE);

impl IndexHeader {
    pub const SIZE: usize = HEADER_SIZE;

    /// A freshly zeroed header with compat data, version and REBUILD set,
    /// matching `mail_index_init_header`.
    pub fn new(indexid: u32) -> Self {
        Self {
            compat_data: [
                COMPAT_FLAGS,
                std::mem::size_of::<u32>() as u8,
                std::mem::size_of::<i64>() as u8,
                std::mem::size_of::<u64>() as u8,
            ],
            version: INDEX_VERSION,
            indexid,
            flags: HeaderFlags::REBUILD.bits(),
            cache_fields: CachedFields::LOCATION.bits(),
            uid_validity: indexid,
            next_uid: 1,
            messages_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            first_unseen_uid_lowwater: 0,
            first_deleted_uid_lowwater: 0,
            first_hole_position: 0,
            first_hole_records: 0,
            last_nonrecent_uid: 0,
            reserved: [0; HEADER_SIZE - HEADER_FIXED_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, HEADER_SIZE)
        }
    }

    /// `true` if `compat_data` and `version` match what this build expects.
    pub fn is_compatible(&self) -> bool {
        self.compat_data[0] == COMPAT_FLAGS
            && self.compat_data[1] as usize == std::mem::size_of::<u32>()
            && self.compat_data[2] as usize == std::mem::size_of::<i64>()
            && self.compat_data[3] as usize == std::mem::size_of::<u64>()
            && self.version == INDEX_VERSION
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: HeaderFlags) {
        self.flags = flags.bits();
    }

    pub fn insert_flags(&mut self, flags: HeaderFlags) {
        self.flags |= flags.bits();
    }

    pub fn remove_flags(&mut self, flags: HeaderFlags) {
        self.flags &= !flags.bits();
    }

    pub fn cache_fields(&self) -> CachedFields {
        CachedFields::from_bits_truncate(self.cache_fields)
    }
}
