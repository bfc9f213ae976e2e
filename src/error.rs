use thiserror::Error;

/// Typed errors the index store can raise.
///
/// Public methods return `anyhow::Result<T>`; callers that need to tell
/// corruption or inconsistency apart from a plain I/O failure can
/// `err.downcast_ref::<IndexError>()` the way callers of `chunk_store.rs`
/// lean on `anyhow`'s context chaining.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted index: {0}")]
    Corrupt(String),

    #[error("index identity changed under handle (indexid {expected} != {found})")]
    Inconsistent { expected: u32, found: u32 },

    #[error("locking contract violation: {0}")]
    LockContract(String),
}
