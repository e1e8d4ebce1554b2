//! The object log writer. Every mutation follows the same discipline: the
//! record is programmed to flash first and RAM state changes only after the
//! write returned successfully. A crash in between leaves flash ahead of RAM,
//! which the detector reconciles on the next mount.

use alloc::string::String;
use alloc::vec::Vec;

use enumflags2::BitFlags;
use log::{debug, warn};

use crate::area::FlashLoc;
use crate::block::chain_ids;
use crate::config::*;
use crate::directory::validate_name;
use crate::flash::FlashDevice;
use crate::fs::FileSystem;
use crate::index::HashEntry;
use crate::inode::{area_bit, InodeEntry, Node, Tombstone};
use crate::structs::{encode_object, DiskBlock, InodeKind, ObjectFlag, ObjectKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdSpace {
    Dir,
    File,
    Block,
}

impl<D: FlashDevice> FileSystem<D> {
    pub(crate) fn alloc_id(&mut self, space: IdSpace) -> Result<u32> {
        let (next, max) = match space {
            IdSpace::Dir => (&mut self.next_dir_id, DIR_ID_MAX),
            IdSpace::File => (&mut self.next_file_id, FILE_ID_MAX),
            IdSpace::Block => (&mut self.next_block_id, BLOCK_ID_MAX),
        };
        if *next >= max {
            return Err(Error::IdExhausted);
        }
        let id = *next;
        *next += 1;
        Ok(id)
    }

    /// Finds room for `len` bytes: the current area, then a fresh free area,
    /// then whatever one sweep pass can reclaim.
    pub(crate) fn allocate(&mut self, len: usize) -> Result<FlashLoc> {
        if let Some(loc) = self.areas.reserve(len) {
            return Ok(loc);
        }
        if len > self.areas.max_object_size() {
            return Err(Error::OutOfSpace);
        }
        if self.areas.rotate(&*self.device, len)? {
            if let Some(loc) = self.areas.reserve(len) {
                return Ok(loc);
            }
        }
        debug!("no free area for {} bytes, sweeping", len);
        if self.sweep_once()? {
            if let Some(loc) = self.areas.reserve(len) {
                return Ok(loc);
            }
        }
        warn!("out of space allocating {} bytes", len);
        Err(Error::OutOfSpace)
    }

    /// Appends a complete encoded record to the log.
    pub(crate) fn append_record(&mut self, raw: &[u8]) -> Result<FlashLoc> {
        let loc = self.allocate(raw.len())?;
        if let Err(e) = self.areas.write(&*self.device, loc, raw) {
            // The slot may be half programmed; nothing may be appended behind it.
            warn!("write at {}:{} failed: {:?}", loc.area, loc.offset, e);
            self.areas.retire_current();
            return Err(e);
        }
        Ok(loc)
    }

    pub(crate) fn write_inode_record(&mut self, entry: &InodeEntry) -> Result<(FlashLoc, u32)> {
        let raw = encode_object(ObjectKind::Inode, BitFlags::empty(), entry.id, &entry.to_disk().encode());
        let loc = self.append_record(&raw)?;
        Ok((loc, raw.len() as u32))
    }

    /// Points the index at the newest record of an inode already in the tree.
    pub(crate) fn commit_inode_loc(&mut self, id: u32, loc: FlashLoc, size: u32) -> Result<()> {
        self.index.insert(HashEntry { id, loc, size })?;
        self.tree.get_mut(id)?.footprint |= area_bit(loc.area);
        Ok(())
    }

    fn ensure_index_room(&self, additional: usize) -> Result<()> {
        if self.index.len() + additional > self.index.capacity() {
            return Err(Error::NoMemory);
        }
        Ok(())
    }

    pub(crate) fn write_root(&mut self) -> Result<()> {
        self.ensure_index_room(1)?;
        let root = InodeEntry::new_dir(ROOT_DIR_ID, ID_NONE, String::new());
        let (loc, size) = self.write_inode_record(&root)?;
        self.tree.insert_root(root);
        self.commit_inode_loc(ROOT_DIR_ID, loc, size)
    }

    /// Creates a file or directory record under `parent_id`.
    pub fn write_inode(&mut self, parent_id: u32, name: &str, kind: InodeKind) -> Result<u32> {
        validate_name(name)?;
        let parent = self.tree.get(parent_id)?.as_dir()?;
        if parent.children.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        self.ensure_index_room(1)?;

        let id = match kind {
            InodeKind::File => self.alloc_id(IdSpace::File)?,
            InodeKind::Directory => self.alloc_id(IdSpace::Dir)?,
        };
        let entry = match kind {
            InodeKind::File => InodeEntry::new_file(id, parent_id, String::from(name)),
            InodeKind::Directory => InodeEntry::new_dir(id, parent_id, String::from(name)),
        };
        let (loc, size) = self.write_inode_record(&entry)?;
        self.tree.link(entry)?;
        self.commit_inode_loc(id, loc, size)?;
        debug!("created {:?} {:#010x} '{}' in {:#010x}", kind, id, name, parent_id);
        Ok(id)
    }

    /// Writes `data` as new block records chained after `prev`, returning the
    /// new ids oldest first. Blocks become indexed as they land but stay
    /// unreachable until the owner's inode record points at the last one.
    pub(crate) fn write_chain(&mut self, owner: u32, mut prev: u32, data: &[u8]) -> Result<Vec<u32>> {
        let max = self.block_max_data();
        self.ensure_index_room(data.len().div_ceil(max))?;
        let mut ids = Vec::new();
        for chunk in data.chunks(max) {
            let written = self.alloc_id(IdSpace::Block).and_then(|id| {
                let block = DiskBlock {
                    inode: owner,
                    prev,
                    data_len: chunk.len() as u16,
                };
                let raw = encode_object(ObjectKind::Block, BitFlags::empty(), id, &block.encode(chunk));
                let loc = self.append_record(&raw)?;
                self.index.insert(HashEntry {
                    id,
                    loc,
                    size: raw.len() as u32,
                })?;
                Ok(id)
            });
            match written {
                Ok(id) => {
                    ids.push(id);
                    prev = id;
                }
                Err(e) => {
                    self.forget_blocks(&ids);
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    fn forget_blocks(&mut self, ids: &[u32]) {
        for id in ids {
            self.index.remove(*id);
        }
    }

    /// Publishes a new chain head for a file by writing a new inode version.
    /// `written` are blocks of the new chain to forget if that write fails,
    /// `dropped` are blocks of the old chain to forget once it succeeds.
    pub(crate) fn commit_file(
        &mut self,
        id: u32,
        newest_block: u32,
        size: u64,
        dropped: &[u32],
        written: &[u32],
    ) -> Result<()> {
        let mut entry = self.tree.get(id)?.clone();
        let file = entry.as_file_mut()?;
        file.newest_block = newest_block;
        file.size = size;

        let (loc, rec_size) = match self.write_inode_record(&entry) {
            Ok(r) => r,
            Err(e) => {
                self.forget_blocks(written);
                return Err(e);
            }
        };
        self.tree.get_mut(id)?.node = entry.node;
        self.commit_inode_loc(id, loc, rec_size)?;
        self.forget_blocks(dropped);
        Ok(())
    }

    /// Appends one block of data to a file, returning the new block id.
    /// Data longer than the block limit is split across several blocks; the
    /// last id is returned.
    pub fn write_block(&mut self, inode_id: u32, data: &[u8]) -> Result<u32> {
        let file = self.tree.get(inode_id)?.as_file()?.clone();
        if data.is_empty() {
            return Ok(file.newest_block);
        }
        let ids = self.write_chain(inode_id, file.newest_block, data)?;
        let newest = ids.last().copied().unwrap_or(file.newest_block);
        self.commit_file(inode_id, newest, file.size + data.len() as u64, &[], &ids)?;
        Ok(newest)
    }

    pub(crate) fn truncate(&mut self, id: u32) -> Result<()> {
        let newest = self.tree.get(id)?.as_file()?.newest_block;
        if newest == NO_BLOCK {
            return Ok(());
        }
        let dropped = chain_ids(&*self.device, &self.areas, &self.index, newest);
        self.commit_file(id, NO_BLOCK, 0, &dropped, &[])
    }

    pub(crate) fn write_tombstone(&mut self, id: u32) -> Result<(FlashLoc, u32)> {
        let raw = encode_object(ObjectKind::Inode, ObjectFlag::Tombstone.into(), id, &[]);
        let loc = self.append_record(&raw)?;
        Ok((loc, raw.len() as u32))
    }

    /// Deletes an inode and, for a directory, everything below it.
    /// The inode's own tombstone commits the deletion; descendants get
    /// tombstones too so their ids can never be revived by a reused parent id.
    /// Each inode leaves RAM as soon as its own tombstone lands, before the
    /// next tombstone can start a sweep.
    pub fn delete(&mut self, id: u32) -> Result<()> {
        if id == ROOT_DIR_ID {
            return Err(Error::InvalidPath);
        }
        self.tree.get(id)?;
        let order = self.tree.subtree(id);
        for (i, &victim) in order.iter().rev().enumerate() {
            let written = match self.write_tombstone(victim) {
                Ok((loc, _)) => Some(loc),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    warn!("tombstone for {:#010x} not written: {:?}", victim, e);
                    None
                }
            };
            let Some(entry) = self.tree.unlink(victim) else {
                continue;
            };
            self.index.remove(victim);
            if let Node::File(file) = &entry.node {
                let blocks = chain_ids(&*self.device, &self.areas, &self.index, file.newest_block);
                self.forget_blocks(&blocks);
            }
            if let Some(loc) = written {
                self.tombstones.insert(
                    victim,
                    Tombstone {
                        id: victim,
                        loc,
                        footprint: entry.footprint,
                    },
                );
            }
        }
        debug!("deleted {:#010x} and {} descendants", id, order.len() - 1);
        Ok(())
    }
}
