use alloc::string::String;
use alloc::vec::Vec;

use crate::config::*;
use crate::error::{FsError, Result};
use crate::inode::InodeTree;
use crate::structs::InodeKind;

/// One child of a directory as reported by `read_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_id: u32,
    pub name: String,
    pub kind: InodeKind,
}

const DOT_NAME: &str = ".";
const DOTDOT_NAME: &str = "..";

/// Checks a single path component before it is written into an inode record.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == DOT_NAME || name == DOTDOT_NAME {
        return Err(FsError::InvalidFileName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Query inode id of a child by name in a directory.
pub fn dir_lookup(tree: &InodeTree, dir_id: u32, name: &str) -> Result<u32> {
    let dir = tree.get(dir_id)?.as_dir()?;
    dir.children.get(name).copied().ok_or(FsError::NotFound)
}

pub fn dir_is_empty(tree: &InodeTree, dir_id: u32) -> Result<bool> {
    Ok(tree.get(dir_id)?.as_dir()?.children.is_empty())
}

/// Children of a directory in name order.
pub fn read_dir(tree: &InodeTree, dir_id: u32) -> Result<Vec<DirEntry>> {
    let dir = tree.get(dir_id)?.as_dir()?;
    let mut entries = Vec::with_capacity(dir.children.len());
    for (name, &id) in dir.children.iter() {
        entries.push(DirEntry {
            inode_id: id,
            name: name.clone(),
            kind: tree.get(id)?.kind(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inode::InodeEntry;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("a.txt"), Ok(()));
        assert_eq!(validate_name(""), Err(FsError::InvalidFileName));
        assert_eq!(validate_name(".."), Err(FsError::InvalidFileName));
        assert_eq!(validate_name("a/b"), Err(FsError::InvalidFileName));
        let long: String = core::iter::repeat('x').take(MAX_NAME_LEN + 1).collect();
        assert_eq!(validate_name(&long), Err(FsError::NameTooLong));
    }

    #[test]
    fn test_children_sorted_by_name() {
        let mut tree = InodeTree::new();
        tree.insert_root(InodeEntry::new_dir(ROOT_DIR_ID, ID_NONE, String::new()));
        tree.link(InodeEntry::new_file(FILE_ID_MIN + 1, ROOT_DIR_ID, "zeta".into())).unwrap();
        tree.link(InodeEntry::new_dir(1, ROOT_DIR_ID, "alpha".into())).unwrap();
        assert_eq!(
            tree.link(InodeEntry::new_file(FILE_ID_MIN + 2, ROOT_DIR_ID, "zeta".into())),
            Err(FsError::AlreadyExists)
        );

        let names: Vec<String> = read_dir(&tree, ROOT_DIR_ID).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
        assert_eq!(dir_lookup(&tree, ROOT_DIR_ID, "alpha"), Ok(1));
        assert_eq!(dir_lookup(&tree, FILE_ID_MIN + 1, "x"), Err(FsError::NotDirectory));
        assert_eq!(dir_is_empty(&tree, 1), Ok(true));
    }
}
