//! Bare git tree construction and flattening.
//!
//! Every write to the metadata branch and to shadow refs goes through
//! these helpers: blobs and trees are built directly in the object
//! database and refs advanced afterwards, so no write ever touches a
//! working tree or index.

use std::collections::BTreeMap;

use git2::{Oid, Repository, Tree};

use crate::error::EntireResult;

const FILE_MODE: i32 = 0o100_644;
const EXEC_MODE: i32 = 0o100_755;
const DIR_MODE: i32 = 0o040_000;

/// One entry in a flat tree map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    pub oid: Oid,
    pub executable: bool,
}

impl TreeEntry {
    pub fn file(oid: Oid) -> Self {
        TreeEntry {
            oid,
            executable: false,
        }
    }
}

/// Flatten a tree into `path -> blob` entries, recursing into subtrees.
pub fn flatten_tree(
    repo: &Repository,
    tree: &Tree<'_>,
    prefix: &str,
    out: &mut BTreeMap<String, TreeEntry>,
) -> EntireResult<()> {
    for entry in tree.iter() {
        let name = match entry.name() {
            Some(n) => n,
            None => continue,
        };
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        match entry.kind() {
            Some(git2::ObjectType::Tree) => {
                let sub = repo.find_tree(entry.id())?;
                flatten_tree(repo, &sub, &path, out)?;
            }
            Some(git2::ObjectType::Blob) => {
                out.insert(
                    path,
                    TreeEntry {
                        oid: entry.id(),
                        executable: entry.filemode() == EXEC_MODE,
                    },
                );
            }
            _ => {}
        }
    }
    Ok(())
}

/// Build a tree object from flat `path -> blob` entries and return its ID.
pub fn build_tree(repo: &Repository, entries: &BTreeMap<String, TreeEntry>) -> EntireResult<Oid> {
    let mut builder = repo.treebuilder(None)?;
    let mut subdirs: BTreeMap<String, BTreeMap<String, TreeEntry>> = BTreeMap::new();

    for (path, entry) in entries {
        match path.split_once('/') {
            None => {
                let mode = if entry.executable { EXEC_MODE } else { FILE_MODE };
                builder.insert(path, entry.oid, mode)?;
            }
            Some((dir, rest)) => {
                subdirs
                    .entry(dir.to_string())
                    .or_default()
                    .insert(rest.to_string(), *entry);
            }
        }
    }

    for (dir, sub) in &subdirs {
        let sub_oid = build_tree(repo, sub)?;
        builder.insert(dir, sub_oid, DIR_MODE)?;
    }

    Ok(builder.write()?)
}
