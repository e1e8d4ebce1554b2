//! Path resolution and manipulation utilities.

use crate::config::ROOT_DIR_ID;
use crate::directory::dir_lookup;
use crate::inode::InodeTree;
use crate::{Error, Result};

/// Resolves an absolute path to inode ids.
/// Returns a tuple of (parent inode id, inode id); the root is its own parent.
pub fn resolve(tree: &InodeTree, path: &str) -> Result<(u32, u32)> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath);
    }

    let mut parent_id = ROOT_DIR_ID;
    let mut current_id = ROOT_DIR_ID;
    for component in path.split('/').filter(|s| !s.is_empty()) {
        if !tree.get(current_id)?.is_dir() {
            return Err(Error::NotDirectory);
        }
        parent_id = current_id;
        current_id = dir_lookup(tree, current_id, component)?;
    }
    Ok((parent_id, current_id))
}

/// Splits a path into its parent path and final component.
/// Trailing slashes are ignored; the final component of "/" is empty.
pub fn split(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("/", trimmed),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split("/a"), ("/", "a"));
        assert_eq!(split("/a/b/c"), ("/a/b", "c"));
        assert_eq!(split("/a/b/"), ("/a", "b"));
        assert_eq!(split("/"), ("/", ""));
    }
}
