//! A persistent, memory-mapped per-mailbox message index: a dense
//! UID-keyed record array backed by a fixed-size header, with an
//! auxiliary variable-length data store, a UID-to-offset hash
//! accelerator, and an append-only modification log, all serialized by a
//! directory lock (creation) and a three-state advisory lock (mutation).
//!
//! Structurally this follows the teacher's `pbs-datastore` split between
//! a format-agnostic tools crate (`mail-index-tools`, advisory locking)
//! and a format-aware core (this crate).

mod data_store;
mod dir_lock;
mod error;
mod header;
mod index;
mod mapping;
mod mod_log;
mod record;
mod uid_hash;

pub use data_store::{DataStore, FileDataStore};
pub use dir_lock::DirLock;
pub use error::IndexError;
pub use header::{CachedFields, HeaderFlags, IndexHeader, MsgFlags, INDEX_VERSION};
pub use index::{IndexOpenOptions, LockState, MailIndex, INDEX_FILE_PREFIX};
pub use mod_log::{ModLog, ModLogEvent};
pub use record::{IndexRecord, RECORD_SIZE};
pub use uid_hash::UidHash;
