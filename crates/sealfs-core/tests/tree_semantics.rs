//! Tree-index behavior over a real repository: mixed-mode name lookup,
//! link accounting, and transactional atomicity through the encrypted
//! database file.

use std::path::PathBuf;

use sealfs_core::db::tree::{FileType, NameLookupMode, RemoveOutcome, ROOT_INODE};
use sealfs_core::repo::{create_repo, Argon2idParams, CreateOptions, OpenOptions, Repository};
use sealfs_core::Error;

fn open_non_exact_repo(dir: &tempfile::TempDir, mode: NameLookupMode) -> Repository {
    let repo_path: PathBuf = dir.path().join("repo");
    let mut options = CreateOptions::new(repo_path.clone(), "p");
    options.argon2_params = Argon2idParams {
        time_cost: 1,
        memory_cost: 1,
        parallelism: 1,
    };
    options.exact_name_only = false;
    options.name_lookup_mode = mode;
    create_repo(&options).unwrap();
    Repository::open(&OpenOptions::new(repo_path, "p")).unwrap()
}

#[test]
fn mixed_mode_create_lookup_remove() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_non_exact_repo(&dir, NameLookupMode::CaseInsensitive);
    let tree = repo.tree();

    let (dir_inode, file_inode, link_inode) = tree
        .with_txn(|ops| {
            let d = ops.create_entry(ROOT_INODE, "abc", FileType::Directory)?;
            let f = ops.create_entry(ROOT_INODE, "AaBbCc", FileType::Regular)?;
            let l = ops.create_entry(ROOT_INODE, "cafe\u{0301}", FileType::Symlink)?;
            Ok((d, f, l))
        })
        .unwrap();

    tree.with_txn(|ops| {
        let found = ops.lookup_entry(ROOT_INODE, "abc", NameLookupMode::Exact)?.unwrap();
        assert_eq!(
            (found.inode, found.file_type, found.link_count),
            (dir_inode, FileType::Directory, 1)
        );

        let found = ops
            .lookup_entry(ROOT_INODE, "aabbcc", NameLookupMode::CaseInsensitive)?
            .unwrap();
        assert_eq!(
            (found.inode, found.file_type, found.link_count),
            (file_inode, FileType::Regular, 1)
        );

        // The composed query form reaches the stored decomposed name.
        let found = ops
            .lookup_entry(ROOT_INODE, "caf\u{00e9}", NameLookupMode::Nfc)?
            .unwrap();
        assert_eq!(
            (found.inode, found.file_type, found.link_count),
            (link_inode, FileType::Symlink, 1)
        );
        Ok(())
    })
    .unwrap();

    assert_eq!(
        tree.with_txn(|ops| ops.remove_entry(ROOT_INODE, dir_inode)).unwrap(),
        RemoveOutcome::FullyRemoved
    );
    tree.with_txn(|ops| {
        assert!(ops.lookup_entry(ROOT_INODE, "abc", NameLookupMode::Exact)?.is_none());
        assert!(ops
            .lookup_entry(ROOT_INODE, "AaBbCc", NameLookupMode::Exact)?
            .is_some());
        Ok(())
    })
    .unwrap();
}

#[test]
fn lookups_survive_reopen_of_the_encrypted_database() {
    let dir = tempfile::tempdir().unwrap();
    let repo_path: PathBuf = dir.path().join("repo");
    let mut options = CreateOptions::new(repo_path.clone(), "p");
    options.argon2_params = Argon2idParams {
        time_cost: 1,
        memory_cost: 1,
        parallelism: 1,
    };
    options.name_lookup_mode = NameLookupMode::Nfc;
    create_repo(&options).unwrap();

    let stored;
    {
        let repo = Repository::open(&OpenOptions::new(repo_path.clone(), "p")).unwrap();
        stored = repo
            .tree()
            .with_txn(|ops| ops.create_entry(ROOT_INODE, "cafe\u{0301}", FileType::Regular))
            .unwrap();
    }

    let repo = Repository::open(&OpenOptions::new(repo_path, "p")).unwrap();
    let found = repo
        .tree()
        .with_txn(|ops| ops.lookup_entry(ROOT_INODE, "caf\u{00e9}", NameLookupMode::Nfc))
        .unwrap()
        .unwrap();
    assert_eq!(found.inode, stored);
}

#[test]
fn full_path_lookup_feeds_creation() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_non_exact_repo(&dir, NameLookupMode::Exact);
    let tree = repo.tree();
    let sep = std::path::MAIN_SEPARATOR;

    let parent = tree
        .with_txn(|ops| {
            let a = ops.create_entry(ROOT_INODE, "a", FileType::Directory)?;
            ops.create_entry(a, "b", FileType::Directory)
        })
        .unwrap();

    let inode = tree
        .with_txn(|ops| {
            let resolved = ops.lookup_path(&format!("a{sep}b{sep}new.txt"))?;
            assert_eq!(resolved.parent_inode, parent);
            assert!(resolved.entry.is_none());
            ops.create_entry(resolved.parent_inode, &resolved.last_component, FileType::Regular)
        })
        .unwrap();

    let resolved = tree
        .with_txn(|ops| ops.lookup_path(&format!("a{sep}b{sep}new.txt")))
        .unwrap();
    assert_eq!(resolved.entry.unwrap().inode, inode);
}

#[test]
fn atomicity_holds_across_a_failed_window() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_non_exact_repo(&dir, NameLookupMode::Exact);
    let tree = repo.tree();

    let result: Result<(), Error> = tree.with_txn(|ops| {
        ops.create_entry(ROOT_INODE, "one", FileType::Regular)?;
        ops.create_entry(ROOT_INODE, "two", FileType::Regular)?;
        ops.set_xattr(ROOT_INODE, "user.marker", b"x")?;
        Err(Error::InvalidParameter("deliberate failure".into()))
    });
    assert!(result.is_err());

    tree.with_txn(|ops| {
        assert!(ops.list_directory(ROOT_INODE)?.is_empty());
        assert!(ops.get_xattr(ROOT_INODE, "user.marker")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn link_accounting_matches_row_counts() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_non_exact_repo(&dir, NameLookupMode::Exact);
    let tree = repo.tree();

    let inode = tree
        .with_txn(|ops| {
            let subdir = ops.create_entry(ROOT_INODE, "sub", FileType::Directory)?;
            let inode = ops.create_entry(ROOT_INODE, "original", FileType::Regular)?;
            ops.add_hard_link(inode, subdir, "alias")?;
            Ok(inode)
        })
        .unwrap();

    tree.with_txn(|ops| {
        let mut rows = 0;
        for parent in [
            ROOT_INODE,
            ops.lookup_entry(ROOT_INODE, "sub", NameLookupMode::Exact)?.unwrap().inode,
        ] {
            for (_, info) in ops.list_directory(parent)? {
                if info.inode == inode {
                    assert_eq!(info.link_count, 2);
                    rows += 1;
                }
            }
        }
        assert_eq!(rows, 2);
        Ok(())
    })
    .unwrap();
}
