//! Repository lifecycle: creation, opening, and content sharding.
//!
//! A repository directory holds `config.pb`, the encrypted `tree.db`, and
//! one content file per inode under a two-level shard layout:
//! `<repo>/<hh1>/<hh2>/<16 hex>`, where `hh1` and `hh2` are the top two
//! bytes of the inode in big-endian order. With at most 65 536 inner
//! directories, per-directory entry counts stay bounded on common host
//! filesystems.

pub mod config;
pub mod kdf;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use prost::Message;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::db::tree::{NameLookupMode, TreeDb, ROOT_INODE};
use crate::db::vfs::{EncryptedVfs, EncryptedVfsParams};
use crate::error::{Error, Result};
use crate::io::crypto::OVERHEAD;
use crate::io::{AesGcmRandomAccess, CreateMode, FileIo, RandomAccess};
use crate::rng::fill_random;

pub use config::{
    Argon2idParams, EncryptedData, FileSystemParams, MasterKeys, RepositoryConfig,
    CONFIG_FILE_NAME, FORMAT_VERSION, MASTER_KEY_LEN, SALT_LEN, TREE_DB_FILE_NAME,
};

/// Default physical block size for content files.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
/// Default plaintext sector size for the tree database.
pub const DEFAULT_TREE_DB_VIRTUAL_BLOCK_SIZE: u64 = 4096;

/// Outer shard directory for an inode: byte 0, big-endian, lowercase hex.
pub fn outer_shard(inode: i64) -> String {
    let bytes = (inode as u64).to_be_bytes();
    format!("{:02x}", bytes[0])
}

/// Inner shard directory for an inode: byte 1, big-endian, lowercase hex.
pub fn inner_shard(inode: i64) -> String {
    let bytes = (inode as u64).to_be_bytes();
    format!("{:02x}", bytes[1])
}

/// Content file name for an inode: all 8 bytes as 16 lowercase hex chars.
pub fn content_file_name(inode: i64) -> String {
    hex::encode((inode as u64).to_be_bytes())
}

/// Shard path of an inode's content file, relative to the repository root.
pub fn content_relative_path(inode: i64) -> PathBuf {
    [
        outer_shard(inode),
        inner_shard(inode),
        content_file_name(inode),
    ]
    .iter()
    .collect()
}

/// Parameters for [`create_repo`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub repository: PathBuf,
    pub password: String,
    pub key_file: Option<PathBuf>,
    /// Override for the config location; defaults to `<repo>/config.pb`.
    pub config_path: Option<PathBuf>,
    /// Override for the tree database; defaults to `<repo>/tree.db`.
    pub tree_db_path: Option<PathBuf>,
    pub exact_name_only: bool,
    pub name_lookup_mode: NameLookupMode,
    pub underlying_block_size: u64,
    pub virtual_block_size_for_tree_db: u64,
    pub argon2_params: Argon2idParams,
}

impl CreateOptions {
    pub fn new(repository: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            password: password.into(),
            key_file: None,
            config_path: None,
            tree_db_path: None,
            exact_name_only: false,
            name_lookup_mode: NameLookupMode::Exact,
            underlying_block_size: DEFAULT_BLOCK_SIZE,
            virtual_block_size_for_tree_db: DEFAULT_TREE_DB_VIRTUAL_BLOCK_SIZE,
            argon2_params: Argon2idParams {
                time_cost: 3,
                memory_cost: 64,
                parallelism: 4,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.password.is_empty() && self.key_file.is_none() {
            return Err(Error::invalid("either a password or a key file is required"));
        }
        if self.underlying_block_size <= OVERHEAD {
            return Err(Error::invalid(format!(
                "content block size {} does not exceed the {OVERHEAD}-byte overhead",
                self.underlying_block_size
            )));
        }
        if self.virtual_block_size_for_tree_db == 0 {
            return Err(Error::invalid("tree database block size must be positive"));
        }
        if self.exact_name_only && self.name_lookup_mode != NameLookupMode::Exact {
            return Err(Error::invalid(
                "non-exact lookup modes need the derived name columns",
            ));
        }
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.repository.join(CONFIG_FILE_NAME))
    }

    fn tree_db_path(&self) -> PathBuf {
        self.tree_db_path
            .clone()
            .unwrap_or_else(|| self.repository.join(TREE_DB_FILE_NAME))
    }
}

/// Removes everything a failed creation left behind, in reverse creation
/// order. Disarmed once the repository is complete.
struct CreationCleanup {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
    armed: bool,
}

impl CreationCleanup {
    fn new() -> Self {
        Self {
            files: Vec::new(),
            dirs: Vec::new(),
            armed: true,
        }
    }

    fn dir(&mut self, path: PathBuf) {
        self.dirs.push(path);
    }

    fn file(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CreationCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for file in self.files.iter().rev() {
            if let Err(e) = fs::remove_file(file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %file.display(), error = %e, "could not undo file creation");
                }
            }
        }
        for dir in self.dirs.iter().rev() {
            if let Err(e) = fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), error = %e, "could not undo directory creation");
                }
            }
        }
    }
}

fn read_write_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

fn read_only_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

/// Create a new repository.
///
/// Any failure removes every file and directory this call created, in
/// reverse order, leaving the host filesystem as it was.
#[instrument(skip_all, fields(repository = %options.repository.display()))]
pub fn create_repo(options: &CreateOptions) -> Result<()> {
    options.validate()?;
    let repo = &options.repository;
    let mut cleanup = CreationCleanup::new();

    fs::create_dir(repo)?;
    cleanup.dir(repo.clone());
    let outer = repo.join(outer_shard(ROOT_INODE));
    fs::create_dir(&outer)?;
    cleanup.dir(outer.clone());
    let inner = outer.join(inner_shard(ROOT_INODE));
    fs::create_dir(&inner)?;
    cleanup.dir(inner);

    // A plausible-looking root content file, so a filesystem client that
    // stats or reads the root immediately after mounting finds one.
    let root_content = repo.join(content_relative_path(ROOT_INODE));
    {
        let file = FileIo::open(&root_content, CreateMode::CreateOnly, false)?;
        cleanup.file(root_content);
        let mut placeholder = vec![0u8; options.underlying_block_size as usize];
        fill_random(&mut placeholder);
        file.write(0, &placeholder)?;
    }

    let mut salt = vec![0u8; SALT_LEN];
    fill_random(&mut salt);
    let master_keys = MasterKeys::generate();
    let user_key = kdf::derive_user_key(
        options.password.as_bytes(),
        options.key_file.as_deref(),
        &salt,
        &options.argon2_params,
    )?;
    let wrapped = config::encrypt_master_keys(&master_keys, &user_key)?;

    let repo_config = RepositoryConfig {
        params: Some(FileSystemParams {
            format_version: FORMAT_VERSION,
            underlying_block_size: options.underlying_block_size,
            virtual_block_size_for_tree_db: options.virtual_block_size_for_tree_db,
            exact_name_only: options.exact_name_only,
            name_lookup_mode: options.name_lookup_mode as i32,
        }),
        argon2_params: Some(options.argon2_params.clone()),
        salt,
        encrypted_master_keys: Some(wrapped),
    };
    let config_path = options.config_path();
    {
        let file = FileIo::open(&config_path, CreateMode::CreateOnly, false)?;
        cleanup.file(config_path);
        file.write(0, &repo_config.encode_to_vec())?;
    }

    let vfs = EncryptedVfs::new(EncryptedVfsParams {
        key: master_keys.tree_key()?,
        underlying_block_size: options.virtual_block_size_for_tree_db + OVERHEAD,
        read_only: false,
    })?;
    let tree_db_path = options.tree_db_path();
    if tree_db_path.exists() {
        return Err(Error::AlreadyExists);
    }
    cleanup.file(tree_db_path.clone());
    let conn = Connection::open_with_flags_and_vfs(&tree_db_path, read_write_flags(), vfs.name())?;
    let tree = TreeDb::new(conn, options.name_lookup_mode, false)?;
    tree.with_txn(|ops| ops.create_tables(options.exact_name_only))?;
    drop(tree);
    drop(vfs);

    cleanup.disarm();
    debug!("repository created");
    Ok(())
}

/// Parameters for [`Repository::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub repository: PathBuf,
    pub password: String,
    pub key_file: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub tree_db_path: Option<PathBuf>,
    pub read_only: bool,
}

impl OpenOptions {
    pub fn new(repository: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            password: password.into(),
            key_file: None,
            config_path: None,
            tree_db_path: None,
            read_only: false,
        }
    }
}

/// An opened repository: the tree database plus access to per-inode
/// content streams, all keyed from the unwrapped master keys.
#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    params: FileSystemParams,
    content_key: Zeroizing<[u8; MASTER_KEY_LEN]>,
    tree: TreeDb,
    read_only: bool,
    // The VFS registration must outlive the tree database connection.
    _vfs: EncryptedVfs,
}

impl Repository {
    #[instrument(skip_all, fields(repository = %options.repository.display(), read_only = options.read_only))]
    pub fn open(options: &OpenOptions) -> Result<Self> {
        let config_path = options
            .config_path
            .clone()
            .unwrap_or_else(|| options.repository.join(CONFIG_FILE_NAME));
        let repo_config = RepositoryConfig::decode_from(&fs::read(&config_path)?)?;
        let params = repo_config
            .params
            .clone()
            .ok_or_else(|| Error::invalid("repository config has no filesystem params"))?;
        let argon2_params = repo_config
            .argon2_params
            .clone()
            .ok_or_else(|| Error::invalid("repository config has no argon2 params"))?;
        let wrapped = repo_config
            .encrypted_master_keys
            .as_ref()
            .ok_or_else(|| Error::invalid("repository config has no master keys"))?;

        if params.underlying_block_size <= OVERHEAD {
            return Err(Error::invalid("configured content block size is too small"));
        }
        let mode = params.lookup_mode()?;
        if params.exact_name_only && mode != NameLookupMode::Exact {
            return Err(Error::invalid(
                "repository was created without derived name columns",
            ));
        }

        let user_key = kdf::derive_user_key(
            options.password.as_bytes(),
            options.key_file.as_deref(),
            &repo_config.salt,
            &argon2_params,
        )?;
        let master_keys = config::decrypt_master_keys(wrapped, &user_key)?;

        let vfs = EncryptedVfs::new(EncryptedVfsParams {
            key: master_keys.tree_key()?,
            underlying_block_size: params.virtual_block_size_for_tree_db + OVERHEAD,
            read_only: options.read_only,
        })?;
        let tree_db_path = options
            .tree_db_path
            .clone()
            .unwrap_or_else(|| options.repository.join(TREE_DB_FILE_NAME));
        let flags = if options.read_only {
            read_only_flags()
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = Connection::open_with_flags_and_vfs(&tree_db_path, flags, vfs.name())?;
        let tree = TreeDb::new(conn, mode, options.read_only)?;

        debug!("repository opened");
        Ok(Self {
            root: options.repository.clone(),
            content_key: Zeroizing::new(master_keys.content_key()?),
            params,
            tree,
            read_only: options.read_only,
            _vfs: vfs,
        })
    }

    pub fn tree(&self) -> &TreeDb {
        &self.tree
    }

    pub fn params(&self) -> &FileSystemParams {
        &self.params
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Absolute shard path of an inode's content file.
    pub fn content_path(&self, inode: i64) -> PathBuf {
        self.root.join(content_relative_path(inode))
    }

    /// Open the existing content stream of an inode.
    pub fn open_content_file(&self, inode: i64) -> Result<AesGcmRandomAccess<FileIo>> {
        self.content_stream(inode, CreateMode::OpenOnly)
    }

    /// Open an inode's content stream, creating the file (and its shard
    /// directories) on first use. Content files exist lazily: nothing is
    /// on disk until the first write to the inode.
    pub fn create_content_file(&self, inode: i64) -> Result<AesGcmRandomAccess<FileIo>> {
        if self.read_only {
            return Err(Error::invalid("repository is opened read-only"));
        }
        let path = self.content_path(inode);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.content_stream(inode, CreateMode::CreateIfAbsent)
    }

    /// Delete an inode's content file, once the tree layer reports the last
    /// link gone. Absence is not an error: content files are created
    /// lazily, so an inode that was never written has none.
    pub fn remove_content_file(&self, inode: i64) -> Result<()> {
        if self.read_only {
            return Err(Error::invalid("repository is opened read-only"));
        }
        match fs::remove_file(self.content_path(inode)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn content_stream(
        &self,
        inode: i64,
        create: CreateMode,
    ) -> Result<AesGcmRandomAccess<FileIo>> {
        let file = FileIo::open(&self.content_path(inode), create, self.read_only)?;
        AesGcmRandomAccess::new(
            Arc::new(file),
            &self.content_key,
            self.params.underlying_block_size,
            self.read_only,
        )
    }
}

fn _assert_send_sync(repo: Repository) -> impl Send + Sync {
    repo
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn shard_paths_follow_the_big_endian_convention() {
        let inode = 0x0123_4567_89ab_cdefu64 as i64;
        assert_eq!(outer_shard(inode), "01");
        assert_eq!(inner_shard(inode), "23");
        assert_eq!(content_file_name(inode), "0123456789abcdef");
        assert_eq!(
            content_relative_path(inode),
            Path::new("01").join("23").join("0123456789abcdef")
        );
    }

    #[test]
    fn root_inode_shards_to_80() {
        assert_eq!(outer_shard(ROOT_INODE), "80");
        assert_eq!(inner_shard(ROOT_INODE), "00");
        assert_eq!(content_file_name(ROOT_INODE), "8000000000000000");
    }

    #[test]
    fn create_options_reject_missing_credentials() {
        let options = CreateOptions::new("/tmp/nowhere", "");
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn create_options_reject_tiny_blocks() {
        let mut options = CreateOptions::new("/tmp/nowhere", "pw");
        options.underlying_block_size = OVERHEAD;
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn create_options_reject_non_exact_mode_without_columns() {
        let mut options = CreateOptions::new("/tmp/nowhere", "pw");
        options.exact_name_only = true;
        options.name_lookup_mode = NameLookupMode::Nfc;
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidParameter(_))
        ));
    }
}
