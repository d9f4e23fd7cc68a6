//! Error types shared across the crate.
//!
//! The core produces typed errors and leaves translation to OS status codes
//! to the filesystem dispatch layer. The only place errors are collapsed is
//! the SQLite VFS boundary, where everything becomes `SQLITE_IOERR` because
//! no Rust error may cross the C ABI.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A ciphertext block failed AES-GCM authentication.
    ///
    /// The stream that produced this error must be considered untrusted from
    /// this point on; callers are expected to fail the whole user operation.
    #[error("block {block_index} failed authentication")]
    IntegrityFailed { block_index: u64 },

    /// Unwrapping the master keys failed.
    ///
    /// Cryptographically indistinguishable from a wrong password: both yield
    /// the wrong key-encryption key, and the GCM tag over the wrapped keys
    /// does not verify.
    #[error("master key unwrap failed: wrong credentials or tampered config")]
    KeyUnwrapFailed,

    /// A path component other than the last does not exist.
    #[error("path has a non-existent component")]
    PathNotFound,

    /// Attempted to remove a directory that still has children.
    #[error("directory is not empty")]
    NotEmpty,

    /// An entry with the same `(parent, name)` already exists.
    #[error("entry already exists")]
    AlreadyExists,

    /// Misconfiguration: bad block size, wrong salt length, unsupported
    /// lookup mode, and the like.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Host I/O failure.
    #[error("storage failed: {0}")]
    Storage(#[from] io::Error),

    /// SQL engine failure not mapped to a more specific kind.
    #[error("sql engine failed: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A violated internal assertion. Not recoverable.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::InternalInvariant(msg.into())
    }
}
