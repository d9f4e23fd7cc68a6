//! The encrypted tree index database.
//!
//! Two layers: [`vfs`] interposes an encrypting virtual filesystem between
//! SQLite and the host OS, and [`tree`] implements the directory/metadata
//! tree as tables inside the resulting encrypted database file.

pub mod tree;
pub mod vfs;

pub use tree::{
    EntryInfo, EntryMetadata, FileType, NameLookupMode, PathLookup, RemoveOutcome, TreeDb,
    TreeOps, ROOT_INODE,
};
pub use vfs::{EncryptedVfs, EncryptedVfsParams};
