//! The filesystem tree, stored in a SQLite database.
//!
//! Every tree-mutating filesystem operation runs inside exactly one
//! [`TreeDb::with_txn`] window, which couples the in-process mutex with the
//! SQL transaction: the closure's `Ok` commits, its `Err` rolls back. The
//! database itself is opened in `NOMUTEX` mode; all serialization happens
//! here.
//!
//! Name lookup supports three modes frozen at repository creation. For the
//! non-exact modes the table carries derived columns populated by custom
//! scalar functions that return NULL whenever the transform is a fixed
//! point, so the derived indexes only pay for names that actually
//! disambiguate.

use std::sync::Mutex;

use caseless::default_case_fold_str;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};
use crate::rng::random_u64;

/// The reserved inode of the root directory. Never allocated to an entry.
pub const ROOT_INODE: i64 = i64::MIN;

/// Upper bound (exclusive) on an inode's link count.
pub const MAX_LINK_COUNT: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FileType {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
}

impl TryFrom<i64> for FileType {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(FileType::Regular),
            1 => Ok(FileType::Directory),
            2 => Ok(FileType::Symlink),
            other => Err(Error::internal(format!(
                "invalid file type {other} in the tree database"
            ))),
        }
    }
}

/// How single path components are matched against stored names.
///
/// Frozen into the repository configuration at creation time; the numeric
/// values are part of the config wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NameLookupMode {
    Exact = 0,
    CaseInsensitive = 1,
    Nfc = 2,
}

impl TryFrom<i32> for NameLookupMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(NameLookupMode::Exact),
            1 => Ok(NameLookupMode::CaseInsensitive),
            2 => Ok(NameLookupMode::Nfc),
            other => Err(Error::invalid(format!(
                "unsupported name lookup mode {other}"
            ))),
        }
    }
}

/// A resolved directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub inode: i64,
    pub file_type: FileType,
    pub link_count: u32,
}

/// Ownership metadata stored alongside an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub security_descriptor: Option<Vec<u8>>,
}

/// Outcome of a full-path resolution.
///
/// `entry` is `None` for a negative lookup on the final component; the
/// parent inode and the final component are still populated so the caller
/// can turn the result into a create.
#[derive(Debug, Clone)]
pub struct PathLookup {
    pub parent_inode: i64,
    pub last_component: String,
    pub entry: Option<EntryInfo>,
}

/// What `remove_entry` did to the inode's backing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Other links still name the inode; the content file must stay.
    StillReferenced,
    /// The last link is gone; the caller should delete the content file.
    FullyRemoved,
}

fn casefold(input: &str) -> String {
    default_case_fold_str(input)
}

fn nfc(input: &str) -> String {
    input.nfc().collect()
}

/// Register a `<name>(text) -> text|NULL` scalar that applies `transform`
/// and returns NULL iff the input was already in its final form.
fn register_transform(
    conn: &Connection,
    name: &'static str,
    transform: fn(&str) -> String,
) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        name,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let input = ctx
                .get_raw(0)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let mapped = transform(input);
            Ok(if mapped == input { None } else { Some(mapped) })
        },
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// The tree index database handle.
///
/// Wraps the connection and its prepared-statement cache in a single
/// exclusive mutex. One [`with_txn`](Self::with_txn) scope may be active at
/// a time; every entry, lookup, removal, and xattr operation requires it.
#[derive(Debug)]
pub struct TreeDb {
    conn: Mutex<Connection>,
    mode: NameLookupMode,
    read_only: bool,
}

impl TreeDb {
    /// Wrap an open connection, registering the name-transform scalar
    /// functions the schema depends on.
    pub fn new(conn: Connection, mode: NameLookupMode, read_only: bool) -> Result<Self> {
        register_transform(&conn, "casefold_if_changed", casefold)?;
        register_transform(&conn, "nfc_if_changed", nfc)?;
        Ok(Self {
            conn: Mutex::new(conn),
            mode,
            read_only,
        })
    }

    /// The lookup mode frozen into this repository.
    pub fn lookup_mode(&self) -> NameLookupMode {
        self.mode
    }

    /// Run `f` inside the scoped locker: mutex + transaction together.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. The
    /// transaction is `BEGIN IMMEDIATE` so lock acquisition fails eagerly
    /// rather than at the first write (read-only repositories use a
    /// deferred transaction instead, since they may not take write locks).
    pub fn with_txn<T>(&self, f: impl FnOnce(&mut TreeOps<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::internal("tree database mutex poisoned"))?;
        let behavior = if self.read_only {
            TransactionBehavior::Deferred
        } else {
            TransactionBehavior::Immediate
        };
        let txn = conn.transaction_with_behavior(behavior)?;
        let mut ops = TreeOps {
            conn: &txn,
            mode: self.mode,
        };
        match f(&mut ops) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback() {
                    warn!(error = %rollback_err, "rollback of tree transaction failed");
                }
                Err(e)
            }
        }
    }
}

/// Tree operations, valid within one transactional window.
///
/// Statements are prepared lazily on first use and cached on the
/// connection; reuse goes through the cache, which re-binds parameters
/// fresh on every call.
pub struct TreeOps<'txn> {
    conn: &'txn Connection,
    mode: NameLookupMode,
}

impl TreeOps<'_> {
    /// Create all tables and indexes.
    ///
    /// With `exact_name_only` the derived-name columns and their partial
    /// indexes are omitted entirely; such a repository supports only
    /// [`NameLookupMode::Exact`].
    pub fn create_tables(&mut self, exact_name_only: bool) -> Result<()> {
        if exact_name_only {
            self.conn.execute_batch(
                r#"
                CREATE TABLE Entries (
                    inode INTEGER NOT NULL,
                    parent_inode INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    file_type INTEGER NOT NULL,
                    link_count INTEGER NOT NULL DEFAULT 1
                        CHECK (link_count > 0 AND link_count < 65536),
                    uid INTEGER,
                    gid INTEGER,
                    security_descriptor BLOB
                );
                CREATE INDEX InodeOnEntries ON Entries (inode);
                CREATE UNIQUE INDEX ParentNameOnEntries ON Entries (parent_inode, name);

                CREATE TABLE Xattr (
                    inode INTEGER NOT NULL,
                    xattr_key TEXT NOT NULL,
                    xattr_value BLOB NOT NULL
                );
                CREATE UNIQUE INDEX InodeKeyOnXattr ON Xattr (inode, xattr_key);
                "#,
            )?;
        } else {
            self.conn.execute_batch(
                r#"
                CREATE TABLE Entries (
                    inode INTEGER NOT NULL,
                    parent_inode INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    file_type INTEGER NOT NULL,
                    link_count INTEGER NOT NULL DEFAULT 1
                        CHECK (link_count > 0 AND link_count < 65536),
                    uid INTEGER,
                    gid INTEGER,
                    security_descriptor BLOB,
                    casefolded_name TEXT AS (casefold_if_changed(name)) STORED,
                    nfc_normed_name TEXT AS (nfc_if_changed(name)) STORED
                );
                CREATE INDEX InodeOnEntries ON Entries (inode);
                CREATE UNIQUE INDEX ParentNameOnEntries ON Entries (parent_inode, name);
                CREATE INDEX ParentCasefoldedNameOnEntries
                    ON Entries (parent_inode, casefolded_name)
                    WHERE casefolded_name IS NOT NULL;
                CREATE INDEX ParentNfcNormedNameOnEntries
                    ON Entries (parent_inode, nfc_normed_name)
                    WHERE nfc_normed_name IS NOT NULL;

                CREATE TABLE Xattr (
                    inode INTEGER NOT NULL,
                    xattr_key TEXT NOT NULL,
                    xattr_value BLOB NOT NULL
                );
                CREATE UNIQUE INDEX InodeKeyOnXattr ON Xattr (inode, xattr_key);
                "#,
            )?;
        }
        Ok(())
    }

    /// Allocate a fresh inode and insert one entry row for it.
    ///
    /// Inodes are drawn by rejection sampling from the CSPRNG: draw, reject
    /// on collision with any existing row (or the reserved root), adopt.
    pub fn create_entry(
        &mut self,
        parent_inode: i64,
        name: &str,
        file_type: FileType,
    ) -> Result<i64> {
        let inode = loop {
            let candidate = random_u64() as i64;
            if candidate == ROOT_INODE {
                continue;
            }
            let taken: i64 = self
                .conn
                .prepare_cached("SELECT COUNT(1) FROM Entries WHERE inode = ?1;")?
                .query_row([candidate], |row| row.get(0))?;
            if taken == 0 {
                break candidate;
            }
        };
        let inserted = self
            .conn
            .prepare_cached(
                "INSERT INTO Entries (inode, parent_inode, name, file_type, link_count)
                     VALUES (?1, ?2, ?3, ?4, 1);",
            )?
            .execute(params![inode, parent_inode, name, file_type as i32]);
        match inserted {
            Ok(_) => Ok(inode),
            Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a single component under `parent_inode`.
    ///
    /// For the non-exact modes the query name is transformed first, then
    /// matched against both the stored name and the derived column.
    pub fn lookup_entry(
        &mut self,
        parent_inode: i64,
        name: &str,
        mode: NameLookupMode,
    ) -> Result<Option<EntryInfo>> {
        let transformed;
        let (sql, query_name): (&str, &str) = match mode {
            NameLookupMode::Exact => (
                "SELECT inode, file_type, link_count FROM Entries
                     WHERE parent_inode = ?1 AND name = ?2;",
                name,
            ),
            NameLookupMode::CaseInsensitive => {
                transformed = casefold(name);
                (
                    "SELECT inode, file_type, link_count FROM Entries
                         WHERE parent_inode = ?1 AND (name = ?2 OR casefolded_name = ?2)
                         LIMIT 1;",
                    &transformed,
                )
            }
            NameLookupMode::Nfc => {
                transformed = nfc(name);
                (
                    "SELECT inode, file_type, link_count FROM Entries
                         WHERE parent_inode = ?1 AND (name = ?2 OR nfc_normed_name = ?2)
                         LIMIT 1;",
                    &transformed,
                )
            }
        };
        let row = self
            .conn
            .prepare_cached(sql)?
            .query_row(params![parent_inode, query_name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .optional()?;
        row.map(|(inode, file_type, link_count)| {
            Ok(EntryInfo {
                inode,
                file_type: FileType::try_from(file_type)?,
                link_count: link_count as u32,
            })
        })
        .transpose()
    }

    /// Resolve a full path from the root, component by component, using the
    /// repository's frozen lookup mode.
    ///
    /// A missing intermediate component is [`Error::PathNotFound`]; a
    /// missing final component is a negative lookup that still carries the
    /// parent and the final name. Empty components (leading, trailing, or
    /// doubled separators) are skipped; the empty path resolves to the root.
    pub fn lookup_path(&mut self, path: &str) -> Result<PathLookup> {
        let components: Vec<&str> = path
            .split(std::path::MAIN_SEPARATOR)
            .filter(|c| !c.is_empty())
            .collect();
        if components.is_empty() {
            return Ok(PathLookup {
                parent_inode: ROOT_INODE,
                last_component: String::new(),
                entry: Some(EntryInfo {
                    inode: ROOT_INODE,
                    file_type: FileType::Directory,
                    link_count: 1,
                }),
            });
        }

        let mode = self.mode;
        let mut parent = ROOT_INODE;
        let mut entry = None;
        for (i, component) in components.iter().enumerate() {
            let is_last = i + 1 == components.len();
            match self.lookup_entry(parent, component, mode)? {
                Some(info) => {
                    if !is_last {
                        parent = info.inode;
                    }
                    entry = Some(info);
                }
                None if is_last => entry = None,
                None => return Err(Error::PathNotFound),
            }
        }
        Ok(PathLookup {
            parent_inode: parent,
            last_component: (*components.last().expect("components is non-empty")).to_owned(),
            entry,
        })
    }

    /// Remove the entry naming `inode` under `parent_inode`.
    ///
    /// Directories must be empty. For inodes with multiple hard links the
    /// remaining rows' link counts are decremented and the content file
    /// stays; on the last link the xattrs are dropped and the caller is
    /// told to delete the content file.
    pub fn remove_entry(&mut self, parent_inode: i64, inode: i64) -> Result<RemoveOutcome> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT file_type, link_count FROM Entries
                     WHERE parent_inode = ?1 AND inode = ?2 LIMIT 1;",
            )?
            .query_row(params![parent_inode, inode], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        let (file_type, link_count) = row.ok_or(Error::PathNotFound)?;
        if FileType::try_from(file_type)? == FileType::Directory {
            let has_children: i64 = self
                .conn
                .prepare_cached("SELECT EXISTS (SELECT 1 FROM Entries WHERE parent_inode = ?1);")?
                .query_row([inode], |row| row.get(0))?;
            if has_children != 0 {
                return Err(Error::NotEmpty);
            }
        }
        // Several links to the same inode may live in one directory; remove
        // exactly one row per call.
        self.conn
            .prepare_cached(
                "DELETE FROM Entries WHERE rowid IN
                     (SELECT rowid FROM Entries
                          WHERE parent_inode = ?1 AND inode = ?2 LIMIT 1);",
            )?
            .execute(params![parent_inode, inode])?;
        if link_count > 1 {
            self.conn
                .prepare_cached("UPDATE Entries SET link_count = link_count - 1 WHERE inode = ?1;")?
                .execute([inode])?;
            Ok(RemoveOutcome::StillReferenced)
        } else {
            self.conn
                .prepare_cached("DELETE FROM Xattr WHERE inode = ?1;")?
                .execute([inode])?;
            Ok(RemoveOutcome::FullyRemoved)
        }
    }

    /// Move one entry row to a new parent and name.
    ///
    /// The destination must be free; callers implementing replace-on-rename
    /// remove the destination entry first, inside the same transactional
    /// window, so the whole rename stays atomic.
    pub fn rename_entry(
        &mut self,
        old_parent_inode: i64,
        inode: i64,
        new_parent_inode: i64,
        new_name: &str,
    ) -> Result<()> {
        let rowid: Option<i64> = self
            .conn
            .prepare_cached(
                "SELECT rowid FROM Entries WHERE parent_inode = ?1 AND inode = ?2 LIMIT 1;",
            )?
            .query_row(params![old_parent_inode, inode], |row| row.get(0))
            .optional()?;
        let rowid = rowid.ok_or(Error::PathNotFound)?;
        let updated = self
            .conn
            .prepare_cached(
                "UPDATE Entries SET parent_inode = ?2, name = ?3 WHERE rowid = ?1;",
            )?
            .execute(params![rowid, new_parent_inode, new_name]);
        match updated {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Add another name for an existing inode, keeping every row's
    /// `link_count` equal to the number of rows naming the inode.
    pub fn add_hard_link(
        &mut self,
        inode: i64,
        new_parent_inode: i64,
        new_name: &str,
    ) -> Result<()> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT file_type, link_count FROM Entries WHERE inode = ?1 LIMIT 1;",
            )?
            .query_row([inode], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        let (file_type, link_count) = row.ok_or(Error::PathNotFound)?;
        if FileType::try_from(file_type)? == FileType::Directory {
            return Err(Error::invalid("directories cannot be hard linked"));
        }
        if link_count + 1 >= i64::from(MAX_LINK_COUNT) {
            return Err(Error::invalid(format!(
                "inode already has {link_count} links"
            )));
        }
        let inserted = self
            .conn
            .prepare_cached(
                "INSERT INTO Entries (inode, parent_inode, name, file_type, link_count)
                     VALUES (?1, ?2, ?3, ?4, ?5);",
            )?
            .execute(params![inode, new_parent_inode, new_name, file_type, link_count]);
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(Error::AlreadyExists),
            Err(e) => return Err(e.into()),
        }
        self.conn
            .prepare_cached("UPDATE Entries SET link_count = link_count + 1 WHERE inode = ?1;")?
            .execute([inode])?;
        Ok(())
    }

    /// List the children of a directory, ordered by stored name.
    pub fn list_directory(&mut self, parent_inode: i64) -> Result<Vec<(String, EntryInfo)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name, inode, file_type, link_count FROM Entries
                 WHERE parent_inode = ?1 ORDER BY name;",
        )?;
        let rows = stmt.query_map([parent_inode], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (name, inode, file_type, link_count) = row?;
            entries.push((
                name,
                EntryInfo {
                    inode,
                    file_type: FileType::try_from(file_type)?,
                    link_count: link_count as u32,
                },
            ));
        }
        Ok(entries)
    }

    /// Store or replace one extended attribute.
    pub fn set_xattr(&mut self, inode: i64, key: &str, value: &[u8]) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO Xattr (inode, xattr_key, xattr_value) VALUES (?1, ?2, ?3)
                     ON CONFLICT (inode, xattr_key)
                     DO UPDATE SET xattr_value = excluded.xattr_value;",
            )?
            .execute(params![inode, key, value])?;
        Ok(())
    }

    pub fn get_xattr(&mut self, inode: i64, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .prepare_cached("SELECT xattr_value FROM Xattr WHERE inode = ?1 AND xattr_key = ?2;")?
            .query_row(params![inode, key], |row| row.get(0))
            .optional()?)
    }

    pub fn list_xattrs(&mut self, inode: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT xattr_key FROM Xattr WHERE inode = ?1 ORDER BY xattr_key;")?;
        let keys = stmt
            .query_map([inode], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Remove one extended attribute; returns whether it existed.
    pub fn remove_xattr(&mut self, inode: i64, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .prepare_cached("DELETE FROM Xattr WHERE inode = ?1 AND xattr_key = ?2;")?
            .execute(params![inode, key])?;
        Ok(affected > 0)
    }

    /// Set the ownership columns on every row naming `inode`.
    pub fn set_owner(&mut self, inode: i64, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let affected = self
            .conn
            .prepare_cached("UPDATE Entries SET uid = ?2, gid = ?3 WHERE inode = ?1;")?
            .execute(params![inode, uid, gid])?;
        if affected == 0 {
            return Err(Error::PathNotFound);
        }
        Ok(())
    }

    pub fn set_security_descriptor(&mut self, inode: i64, descriptor: Option<&[u8]>) -> Result<()> {
        let affected = self
            .conn
            .prepare_cached("UPDATE Entries SET security_descriptor = ?2 WHERE inode = ?1;")?
            .execute(params![inode, descriptor])?;
        if affected == 0 {
            return Err(Error::PathNotFound);
        }
        Ok(())
    }

    pub fn entry_metadata(&mut self, inode: i64) -> Result<EntryMetadata> {
        self.conn
            .prepare_cached(
                "SELECT uid, gid, security_descriptor FROM Entries WHERE inode = ?1 LIMIT 1;",
            )?
            .query_row([inode], |row| {
                Ok(EntryMetadata {
                    uid: row.get(0)?,
                    gid: row.get(1)?,
                    security_descriptor: row.get(2)?,
                })
            })
            .optional()?
            .ok_or(Error::PathNotFound)
    }
}
