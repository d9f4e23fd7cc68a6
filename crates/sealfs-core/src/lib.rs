//! On-disk substrate for the sealfs encrypting userspace filesystem.
//!
//! A sealfs repository is a directory on the host filesystem holding three
//! kinds of state:
//!
//! - `config.pb`: a protobuf blob describing the encryption parameters and
//!   the password-wrapped master keys ([`repo::config`]);
//! - `tree.db`: a SQLite database mapping path components to inodes,
//!   transparently encrypted through a custom VFS ([`db`]);
//! - `<hh>/<hh>/<16 hex>`: per-inode content files, each an independently
//!   encrypted block stream ([`io::crypto`]).
//!
//! This crate deliberately stops at the substrate: the FUSE/WinFSP dispatch
//! layer, command-line handling, and logging setup live elsewhere and call
//! into the types exported here.

pub mod db;
pub mod error;
pub mod io;
pub mod repo;
pub mod rng;

pub use error::{Error, Result};
