//! Open-file handles and the byte-level read/write path on top of block chains.

use alloc::vec;
use alloc::vec::Vec;

use enumflags2::{bitflags, BitFlags};
use log::debug;

use crate::block::{chain, read_chain};
use crate::config::NO_BLOCK;
use crate::flash::FlashDevice;
use crate::fs::FileSystem;
use crate::{Error, Result};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    Read = 0b0001,
    Write = 0b0010,
    /// Every write lands at the end of the file.
    Append = 0b0100,
    /// Drop existing content when opened for writing.
    Truncate = 0b1000,
}

/// A position in one file. Holds no borrow of the session, so a handle
/// whose file is deleted simply fails with `NotFound` on next use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct File {
    id: u32,
    pos: u64,
    flags: BitFlags<OpenFlag>,
}

impl File {
    pub(crate) fn new(id: u32, pos: u64, flags: BitFlags<OpenFlag>) -> Self {
        Self { id, pos, flags }
    }

    pub fn inode_id(&self) -> u32 {
        self.id
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn flags(&self) -> BitFlags<OpenFlag> {
        self.flags
    }
}

impl<D: FlashDevice> FileSystem<D> {
    /// Reads from the handle's position, returning the number of bytes read.
    /// Zero means end of file.
    pub fn read(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        if !file.flags.contains(OpenFlag::Read) {
            return Err(Error::NotPermitted);
        }
        let n = self.read_at(file.id, file.pos, buf)?;
        file.pos += n as u64;
        Ok(n)
    }

    pub(crate) fn read_at(&self, id: u32, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let node = self.tree.get(id)?.as_file()?;
        if pos >= node.size || buf.is_empty() {
            return Ok(0);
        }
        let want = ((node.size - pos) as usize).min(buf.len());
        let blocks = chain(&*self.device, &self.areas, &self.index, id, node.newest_block)?;
        read_chain(&*self.device, &self.areas, &blocks, pos, &mut buf[..want])
    }

    /// Writes at the handle's position, or at the end with `Append`.
    pub fn write(&mut self, file: &mut File, data: &[u8]) -> Result<usize> {
        if !file.flags.contains(OpenFlag::Write) {
            return Err(Error::NotPermitted);
        }
        let size = self.tree.get(file.id)?.as_file()?.size;
        if file.flags.contains(OpenFlag::Append) {
            file.pos = size;
        }
        self.write_at(file.id, file.pos, data)?;
        file.pos += data.len() as u64;
        Ok(data.len())
    }

    /// Writing at the end appends blocks. Writing inside the file rewrites
    /// every block from the first one touched onward and chains the copies
    /// after the last untouched block, so the old chain stays intact on
    /// flash until the new inode version lands.
    pub(crate) fn write_at(&mut self, id: u32, pos: u64, data: &[u8]) -> Result<()> {
        let node = self.tree.get(id)?.as_file()?.clone();
        if pos > node.size {
            return Err(Error::InvalidOffset);
        }
        if data.is_empty() {
            return Ok(());
        }
        if pos == node.size {
            self.write_block(id, data)?;
            return Ok(());
        }

        let blocks = chain(&*self.device, &self.areas, &self.index, id, node.newest_block)?;
        let mut keep = 0;
        let mut keep_end = 0u64;
        for block in &blocks {
            let end = keep_end + block.data_len as u64;
            if end > pos {
                break;
            }
            keep += 1;
            keep_end = end;
        }

        let write_end = pos + data.len() as u64;
        let new_size = node.size.max(write_end);
        let mut content = vec![0u8; (new_size - keep_end) as usize];
        let head = (pos - keep_end) as usize;
        read_chain(&*self.device, &self.areas, &blocks, keep_end, &mut content[..head])?;
        content[head..head + data.len()].copy_from_slice(data);
        if write_end < node.size {
            let tail_start = head + data.len();
            read_chain(&*self.device, &self.areas, &blocks, write_end, &mut content[tail_start..])?;
        }

        let prev = if keep == 0 { NO_BLOCK } else { blocks[keep - 1].id };
        let dropped: Vec<u32> = blocks[keep..].iter().map(|b| b.id).collect();
        let written = self.write_chain(id, prev, &content)?;
        let newest = written.last().copied().unwrap_or(prev);
        debug!(
            "rewrote {:#010x} from byte {}: {} blocks replaced by {}",
            id,
            keep_end,
            dropped.len(),
            written.len()
        );
        self.commit_file(id, newest, new_size, &dropped, &written)
    }

    /// Moves the handle to an absolute position no further than end of file.
    pub fn seek(&mut self, file: &mut File, pos: u64) -> Result<u64> {
        let size = self.tree.get(file.id)?.as_file()?.size;
        if pos > size {
            return Err(Error::InvalidOffset);
        }
        file.pos = pos;
        Ok(pos)
    }

    /// Releases a handle. Every write is durable when it returns, so there is
    /// nothing left to flush.
    pub fn close(&mut self, file: File) -> Result<()> {
        self.tree.get(file.id)?;
        Ok(())
    }

    /// Reads a whole file into memory.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (id, _) = self.lookup(path)?;
        let size = self.tree.get(id)?.as_file()?.size;
        let mut buf = vec![0u8; size as usize];
        let n = self.read_at(id, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
