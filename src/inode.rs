//! RAM inode tree. Nodes are keyed by inode id; parent and child links are
//! ids as well, so the tree never holds references into itself.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::area::FlashLoc;
use crate::config::*;
use crate::structs::{DiskInode, InodeKind};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    /// Head of the backward-linked block chain, `NO_BLOCK` when empty.
    pub newest_block: u32,
    /// Sum of the data lengths along the chain.
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirNode {
    /// Children ordered by name.
    pub children: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Directory(DirNode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeEntry {
    pub id: u32,
    pub parent: u32,
    pub name: String,
    pub node: Node,
    /// Bit `n` set when area `n` may hold a record of this id.
    pub footprint: u64,
}

impl InodeEntry {
    pub fn new_file(id: u32, parent: u32, name: String) -> Self {
        Self {
            id,
            parent,
            name,
            node: Node::File(FileNode {
                newest_block: NO_BLOCK,
                size: 0,
            }),
            footprint: 0,
        }
    }

    pub fn new_dir(id: u32, parent: u32, name: String) -> Self {
        Self {
            id,
            parent,
            name,
            node: Node::Directory(DirNode::default()),
            footprint: 0,
        }
    }

    /// Rebuilds a node from its newest record. File sizes are filled in
    /// once the chain has been walked.
    pub fn from_disk(id: u32, disk: &DiskInode) -> Self {
        let mut entry = match disk.kind {
            InodeKind::File => Self::new_file(id, disk.parent, disk.name.clone()),
            InodeKind::Directory => Self::new_dir(id, disk.parent, disk.name.clone()),
        };
        if let Node::File(file) = &mut entry.node {
            file.newest_block = disk.newest_block;
        }
        entry
    }

    pub fn kind(&self) -> InodeKind {
        match self.node {
            Node::File(_) => InodeKind::File,
            Node::Directory(_) => InodeKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.node, Node::Directory(_))
    }

    pub fn as_file(&self) -> Result<&FileNode> {
        match &self.node {
            Node::File(f) => Ok(f),
            Node::Directory(_) => Err(Error::NotFile),
        }
    }

    pub fn as_file_mut(&mut self) -> Result<&mut FileNode> {
        match &mut self.node {
            Node::File(f) => Ok(f),
            Node::Directory(_) => Err(Error::NotFile),
        }
    }

    pub fn as_dir(&self) -> Result<&DirNode> {
        match &self.node {
            Node::Directory(d) => Ok(d),
            Node::File(_) => Err(Error::NotDirectory),
        }
    }

    pub fn as_dir_mut(&mut self) -> Result<&mut DirNode> {
        match &mut self.node {
            Node::Directory(d) => Ok(d),
            Node::File(_) => Err(Error::NotDirectory),
        }
    }

    /// The record that describes this inode on flash.
    pub fn to_disk(&self) -> DiskInode {
        let newest_block = match &self.node {
            Node::File(f) => f.newest_block,
            Node::Directory(_) => NO_BLOCK,
        };
        DiskInode {
            parent: self.parent,
            newest_block,
            kind: self.kind(),
            name: self.name.clone(),
        }
    }
}

/// A deletion record that must survive sweeps while an older record of the
/// same id may still exist somewhere on flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub id: u32,
    pub loc: FlashLoc,
    pub footprint: u64,
}

pub fn area_bit(area: u8) -> u64 {
    1u64 << area
}

#[derive(Debug, Default)]
pub struct InodeTree {
    nodes: BTreeMap<u32, InodeEntry>,
}

impl InodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: u32) -> Result<&InodeEntry> {
        self.nodes.get(&id).ok_or(Error::NotFound)
    }

    pub fn get_mut(&mut self, id: u32) -> Result<&mut InodeEntry> {
        self.nodes.get_mut(&id).ok_or(Error::NotFound)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InodeEntry> + '_ {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InodeEntry> + '_ {
        self.nodes.values_mut()
    }

    /// Installs the root directory, which has no parent link.
    pub fn insert_root(&mut self, root: InodeEntry) {
        debug_assert_eq!(root.id, ROOT_DIR_ID);
        self.nodes.insert(root.id, root);
    }

    /// Adds `entry` under its parent directory.
    pub fn link(&mut self, entry: InodeEntry) -> Result<()> {
        let parent = self.nodes.get_mut(&entry.parent).ok_or(Error::NotFound)?;
        let dir = parent.as_dir_mut()?;
        if dir.children.contains_key(&entry.name) {
            return Err(Error::AlreadyExists);
        }
        dir.children.insert(entry.name.clone(), entry.id);
        self.nodes.insert(entry.id, entry);
        Ok(())
    }

    /// Detaches a single node from its parent and drops it.
    pub fn unlink(&mut self, id: u32) -> Option<InodeEntry> {
        let entry = self.nodes.remove(&id)?;
        if let Some(parent) = self.nodes.get_mut(&entry.parent) {
            if let Node::Directory(dir) = &mut parent.node {
                if dir.children.get(&entry.name) == Some(&id) {
                    dir.children.remove(&entry.name);
                }
            }
        }
        Some(entry)
    }

    /// `id` and all its descendants, children before their parents.
    pub fn subtree(&self, id: u32) -> Vec<u32> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((cur, expanded)) = stack.pop() {
            if expanded {
                order.push(cur);
                continue;
            }
            stack.push((cur, true));
            if let Some(Node::Directory(dir)) = self.nodes.get(&cur).map(|e| &e.node) {
                stack.extend(dir.children.values().map(|&c| (c, false)));
            }
        }
        order
    }

    /// True if `ancestor` is `id` or lies on the parent chain of `id`.
    pub fn is_ancestor(&self, ancestor: u32, id: u32) -> bool {
        let mut cur = id;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.nodes.get(&cur) {
                Some(e) if cur != ROOT_DIR_ID => cur = e.parent,
                _ => return false,
            }
        }
    }

    /// Moves a node to a new parent and name. The destination name must be free.
    pub fn relink(&mut self, id: u32, new_parent: u32, new_name: String) -> Result<()> {
        if self.get(new_parent)?.as_dir()?.children.contains_key(&new_name) {
            return Err(Error::AlreadyExists);
        }
        let mut entry = self.unlink(id).ok_or(Error::NotFound)?;
        entry.parent = new_parent;
        entry.name = new_name;
        self.link(entry)
    }
}
