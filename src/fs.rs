use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write;

use enumflags2::BitFlags;
use log::info;
use spin::{Mutex, MutexGuard};

use crate::area::AreaSet;
use crate::config::*;
use crate::directory::{dir_is_empty, read_dir, validate_name, DirEntry};
use crate::file::{File, OpenFlag};
use crate::flash::{AreaDesc, FlashDevice};
use crate::index::RamIndex;
use crate::inode::{InodeEntry, InodeTree, Node, Tombstone};
use crate::path::{resolve, split};
use crate::structs::InodeKind;
use crate::{Error, Result};

/// A mounted file system session. Owns every piece of RAM state derived
/// from flash; dropping it is an unmount.
#[derive(Debug)]
pub struct FileSystem<D: FlashDevice> {
    pub(crate) device: Arc<D>,
    pub(crate) config: Config,
    pub(crate) areas: AreaSet,
    pub(crate) index: RamIndex,
    pub(crate) tree: InodeTree,
    pub(crate) tombstones: BTreeMap<u32, Tombstone>,
    pub(crate) next_dir_id: u32,
    pub(crate) next_file_id: u32,
    pub(crate) next_block_id: u32,
}

impl<D: FlashDevice> FileSystem<D> {
    /// Erases all areas and writes an empty file system holding only the root directory.
    pub fn format(device: Arc<D>, descs: &[AreaDesc], config: Config) -> Result<Self> {
        config.validate()?;
        let areas = AreaSet::format(&*device, descs)?;
        let mut fs = Self {
            index: RamIndex::new(config.index_buckets, config.max_objects)?,
            device,
            config,
            areas,
            tree: InodeTree::new(),
            tombstones: BTreeMap::new(),
            next_dir_id: ROOT_DIR_ID + 1,
            next_file_id: FILE_ID_MIN,
            next_block_id: BLOCK_ID_MIN,
        };
        fs.write_root()?;
        info!(
            "formatted {} areas, current {:?}, scratch {:?}",
            descs.len(),
            fs.areas.current(),
            fs.areas.scratch()
        );
        Ok(fs)
    }

    /// Mounts an existing file system by scanning flash and rebuilding all RAM state.
    pub fn mount(device: Arc<D>, descs: &[AreaDesc], config: Config) -> Result<Self> {
        Self::detect(device, descs, config)
    }

    /// Drops the session. Nothing is cached, so there is nothing to flush.
    pub fn unmount(self) -> Arc<D> {
        self.device
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn areas(&self) -> &AreaSet {
        &self.areas
    }

    pub fn index(&self) -> &RamIndex {
        &self.index
    }

    pub fn tree(&self) -> &InodeTree {
        &self.tree
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> + '_ {
        self.tombstones.values()
    }

    pub fn root_inode_id(&self) -> u32 {
        ROOT_DIR_ID
    }

    /// Largest data payload a single block may carry with the current layout.
    pub(crate) fn block_max_data(&self) -> usize {
        let fits = self
            .areas
            .max_object_size()
            .saturating_sub(OBJECT_HEADER_SIZE + BLOCK_FIXED_SIZE);
        self.config.block_max_data.min(fits).max(1)
    }

    // Following methods operate directly on the session; wrap it in a
    // `SharedFileSystem` when more than one context needs it.

    /// Looks up a path, returning its inode id and kind.
    pub fn lookup(&self, path: &str) -> Result<(u32, InodeKind)> {
        let (_, id) = resolve(&self.tree, path)?;
        Ok((id, self.tree.get(id)?.kind()))
    }

    pub fn exists(&self, path: &str) -> bool {
        resolve(&self.tree, path).is_ok()
    }

    pub fn get_inode(&self, id: u32) -> Result<&InodeEntry> {
        self.tree.get(id)
    }

    fn parent_dir(&self, path: &str) -> Result<(u32, String)> {
        if !path.starts_with('/') {
            return Err(Error::InvalidPath);
        }
        let (parent_path, name) = split(path);
        validate_name(name)?;
        let (_, parent_id) = resolve(&self.tree, parent_path)?;
        if !self.tree.get(parent_id)?.is_dir() {
            return Err(Error::NotDirectory);
        }
        Ok((parent_id, String::from(name)))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<u32> {
        let (parent_id, name) = self.parent_dir(path)?;
        self.write_inode(parent_id, &name, InodeKind::Directory)
    }

    /// Creates an empty file. Fails if the name is taken.
    pub fn create(&mut self, path: &str) -> Result<u32> {
        let (parent_id, name) = self.parent_dir(path)?;
        self.write_inode(parent_id, &name, InodeKind::File)
    }

    pub fn open(&mut self, path: &str, flags: BitFlags<OpenFlag>) -> Result<File> {
        if !flags.intersects(OpenFlag::Read | OpenFlag::Write) {
            return Err(Error::NotPermitted);
        }
        let id = match resolve(&self.tree, path) {
            Ok((_, id)) => id,
            Err(Error::NotFound) if flags.contains(OpenFlag::Write) => self.create(path)?,
            Err(e) => return Err(e),
        };
        let size = self.tree.get(id)?.as_file()?.size;
        let mut pos = 0;
        if flags.contains(OpenFlag::Write) && flags.contains(OpenFlag::Truncate) && size > 0 {
            self.truncate(id)?;
        } else if flags.contains(OpenFlag::Append) {
            pos = size;
        }
        Ok(File::new(id, pos, flags))
    }

    /// Removes a file, or a directory together with everything below it.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (_, id) = resolve(&self.tree, path)?;
        if id == ROOT_DIR_ID {
            return Err(Error::InvalidPath);
        }
        self.delete(id)
    }

    /// Moves `from` to `to`. An existing file at `to` is replaced, as is an
    /// empty directory when `from` is a directory.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (_, id) = resolve(&self.tree, from)?;
        if id == ROOT_DIR_ID {
            return Err(Error::InvalidPath);
        }
        let (new_parent, new_name) = self.parent_dir(to)?;
        if self.tree.is_ancestor(id, new_parent) {
            return Err(Error::InvalidPath);
        }

        let moving_dir = self.tree.get(id)?.is_dir();
        let existing = self.tree.get(new_parent)?.as_dir()?.children.get(&new_name).copied();
        if let Some(existing) = existing {
            if existing == id {
                return Ok(());
            }
            let target = self.tree.get(existing)?;
            match (moving_dir, target.is_dir()) {
                (false, false) => {}
                (true, true) if dir_is_empty(&self.tree, existing)? => {}
                (true, true) => return Err(Error::DirectoryNotEmpty),
                (false, true) => return Err(Error::NotFile),
                (true, false) => return Err(Error::NotDirectory),
            }
            self.delete(existing)?;
        }

        let mut moved = self.tree.get(id)?.clone();
        moved.parent = new_parent;
        moved.name = new_name.clone();
        let (loc, size) = self.write_inode_record(&moved)?;
        self.tree.relink(id, new_parent, new_name)?;
        self.commit_inode_loc(id, loc, size)
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (_, id) = resolve(&self.tree, path)?;
        read_dir(&self.tree, id)
    }

    /// Length in bytes of the file at `path`.
    pub fn file_len(&self, path: &str) -> Result<u64> {
        let (_, id) = resolve(&self.tree, path)?;
        Ok(self.tree.get(id)?.as_file()?.size)
    }

    /// Deterministic text rendering of the tree and the index, for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "areas: current {:?} scratch {:?}", self.areas.current(), self.areas.scratch());
        for (i, area) in self.areas.areas().iter().enumerate() {
            let _ = writeln!(
                out,
                "  area {} seq {} {:?} cursor {}",
                i, area.seq, area.state, area.cursor
            );
        }
        let _ = writeln!(out, "tree:");
        self.dump_dir(&mut out, ROOT_DIR_ID, 1);
        let mut entries: Vec<_> = self.index.iter().copied().collect();
        entries.sort_by_key(|e| e.id);
        let _ = writeln!(out, "index: {} entries", entries.len());
        for e in entries {
            let _ = writeln!(out, "  {:#010x} -> {}:{} ({} bytes)", e.id, e.loc.area, e.loc.offset, e.size);
        }
        let _ = writeln!(out, "tombstones: {}", self.tombstones.len());
        for t in self.tombstones.values() {
            let _ = writeln!(out, "  {:#010x} at {}:{} footprint {:#x}", t.id, t.loc.area, t.loc.offset, t.footprint);
        }
        out
    }

    fn dump_dir(&self, out: &mut String, id: u32, depth: usize) {
        let Ok(entry) = self.tree.get(id) else {
            return;
        };
        match &entry.node {
            Node::Directory(dir) => {
                let _ = writeln!(out, "{:indent$}{}/ [{:#010x}]", "", entry.name, id, indent = depth * 2);
                for &child in dir.children.values() {
                    self.dump_dir(out, child, depth + 1);
                }
            }
            Node::File(file) => {
                let _ = writeln!(
                    out,
                    "{:indent$}{} [{:#010x}] {} bytes, newest {:#010x}",
                    "",
                    entry.name,
                    id,
                    file.size,
                    file.newest_block,
                    indent = depth * 2
                );
            }
        }
    }
}

/// The single global lock every file operation runs under.
pub struct SharedFileSystem<D: FlashDevice> {
    inner: Mutex<FileSystem<D>>,
}

impl<D: FlashDevice> SharedFileSystem<D> {
    pub fn new(fs: FileSystem<D>) -> Self {
        Self { inner: Mutex::new(fs) }
    }

    pub fn lock(&self) -> MutexGuard<'_, FileSystem<D>> {
        self.inner.lock()
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut FileSystem<D>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> FileSystem<D> {
        self.inner.into_inner()
    }
}
