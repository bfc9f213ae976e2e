//! Small, format-agnostic helpers shared by the index store.
//!
//! Nothing in this crate knows about the mail index file layout; it only
//! wraps the advisory locking primitives the kernel gives us.

mod lock;

pub use lock::{FileLock, LockKind};
