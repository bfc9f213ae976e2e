//! The fixed-size record packed sequentially after the header.

use crate::header::{CachedFields, MsgFlags};

/// One message slot. `uid == 0` marks a tombstone (§3, "Tombstone").
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub msg_flags: u32,
    pub cached_fields: u32,
    pub data_size: u32,
    /// Opaque positional back-pointer into the data store.
    pub data_offset: u64,
}

pub const RECORD_SIZE: usize = std::mem::size_of::<IndexRecord>();

const _: () = assert!(RECORD_SIZE == 24);

impl IndexRecord {
    pub fn is_tombstone(&self) -> bool {
        self.uid == 0
    }

    pub fn msg_flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.msg_flags)
    }

    pub fn cached_fields(&self) -> CachedFields {
        CachedFields::from_bits_truncate(self.cached_fields)
    }
}
