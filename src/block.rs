//! Block chains. A file's content is the chain of block records reached by
//! following previous-block ids back from the newest block; only the RAM
//! index tells where each record sits, the links themselves live on flash.

use alloc::vec;
use alloc::vec::Vec;

use crate::area::{AreaSet, FlashLoc};
use crate::config::*;
use crate::flash::FlashDevice;
use crate::index::{HashEntry, RamIndex};
use crate::structs::{verify_object, DiskBlock, ObjectHeader, ObjectKind};
use crate::{Error, Result};

/// A resolved, CRC-checked link of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub id: u32,
    pub loc: FlashLoc,
    pub inode: u32,
    pub prev: u32,
    pub data_len: u16,
}

impl BlockRef {
    /// Location of the first data byte.
    pub fn data_loc(&self) -> FlashLoc {
        FlashLoc::new(
            self.loc.area,
            self.loc.offset + (OBJECT_HEADER_SIZE + BLOCK_FIXED_SIZE) as u32,
        )
    }
}

/// Reads a block record through its index entry and validates it end to end.
pub fn read_block(device: &impl FlashDevice, areas: &AreaSet, entry: &HashEntry) -> Result<BlockRef> {
    let mut raw = vec![0u8; entry.size as usize];
    areas.read(device, entry.loc, &mut raw)?;
    if !verify_object(&raw) {
        return Err(Error::Corrupt);
    }
    let mut hdr_buf = [0u8; OBJECT_HEADER_SIZE];
    hdr_buf.copy_from_slice(&raw[..OBJECT_HEADER_SIZE]);
    let header = ObjectHeader::decode(&hdr_buf).map_err(|_| Error::Corrupt)?;
    if header.kind != ObjectKind::Block || header.id != entry.id || header.size() != raw.len() {
        return Err(Error::Corrupt);
    }
    let block = DiskBlock::decode(&raw[OBJECT_HEADER_SIZE..]).ok_or(Error::Corrupt)?;
    Ok(BlockRef {
        id: entry.id,
        loc: entry.loc,
        inode: block.inode,
        prev: block.prev,
        data_len: block.data_len,
    })
}

/// Walks the chain of `owner` back from `newest`, oldest block first.
/// Any link that is missing, fails its CRC, or belongs to another inode makes
/// the whole chain `Corrupt`; a truncated chain is never returned.
pub fn chain(
    device: &impl FlashDevice,
    areas: &AreaSet,
    index: &RamIndex,
    owner: u32,
    newest: u32,
) -> Result<Vec<BlockRef>> {
    let mut blocks = Vec::new();
    let mut next = newest;
    while next != NO_BLOCK {
        if blocks.len() > index.len() {
            // Longer than the number of indexed ids: the links loop.
            return Err(Error::Corrupt);
        }
        let entry = index.lookup(next).ok_or(Error::Corrupt)?;
        let block = read_block(device, areas, entry)?;
        if block.inode != owner {
            return Err(Error::Corrupt);
        }
        next = block.prev;
        blocks.push(block);
    }
    blocks.reverse();
    Ok(blocks)
}

/// Ids reachable from `newest` until the first unresolvable link.
/// Used when dropping a chain, where a damaged link must not stop the cleanup.
pub fn chain_ids(device: &impl FlashDevice, areas: &AreaSet, index: &RamIndex, newest: u32) -> Vec<u32> {
    let mut ids = Vec::new();
    let mut next = newest;
    while next != NO_BLOCK && ids.len() <= index.len() {
        let Some(entry) = index.lookup(next) else {
            break;
        };
        ids.push(next);
        match read_block(device, areas, entry) {
            Ok(block) => next = block.prev,
            Err(_) => break,
        }
    }
    ids
}

/// Copies file bytes `[offset, offset + buf.len())` out of an already resolved chain.
/// Returns the number of bytes copied.
pub fn read_chain(
    device: &impl FlashDevice,
    areas: &AreaSet,
    blocks: &[BlockRef],
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let mut block_start = 0u64;
    let mut copied = 0usize;
    for block in blocks {
        let block_end = block_start + block.data_len as u64;
        let want_start = offset + copied as u64;
        if copied == buf.len() {
            break;
        }
        if want_start < block_end {
            let inner = (want_start - block_start) as u32;
            let n = ((block_end - want_start) as usize).min(buf.len() - copied);
            let data = block.data_loc();
            areas.read(
                device,
                FlashLoc::new(data.area, data.offset + inner),
                &mut buf[copied..copied + n],
            )?;
            copied += n;
        }
        block_start = block_end;
    }
    Ok(copied)
}
