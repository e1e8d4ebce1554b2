//! Flash area bookkeeping: which area receives appends, which one is held
//! back as the sweep destination, and how far each log has grown.

use alloc::vec::Vec;

use log::debug;

use crate::config::*;
use crate::flash::{AreaDesc, FlashDevice};
use crate::structs::AreaHeader;
use crate::{Error, Result};

/// Physical position of a record: area index plus byte offset inside the area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlashLoc {
    pub area: u8,
    pub offset: u32,
}

impl FlashLoc {
    pub const fn new(area: u8, offset: u32) -> Self {
        Self { area, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaState {
    /// Erased and unclaimed.
    Free,
    /// Reserved, erased destination for the next sweep.
    Scratch,
    /// The current write area.
    Active,
    /// Holds a log that no longer receives appends.
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct Area {
    pub desc: AreaDesc,
    pub seq: u32,
    pub swept_from: Option<u8>,
    pub state: AreaState,
    /// Offset of the next append, relative to the area base.
    pub cursor: u32,
}

impl Area {
    pub fn erased(desc: AreaDesc, state: AreaState) -> Self {
        Self {
            desc,
            seq: 0,
            swept_from: None,
            state,
            cursor: 0,
        }
    }

    pub fn has_header(&self) -> bool {
        matches!(self.state, AreaState::Active | AreaState::Full)
    }

    pub fn free_space(&self) -> u32 {
        self.desc.length - self.cursor
    }

    /// Bytes an object log can occupy in this area once it carries a header.
    pub fn capacity(&self) -> u32 {
        self.desc.length - AREA_HEADER_SIZE as u32
    }
}

#[derive(Debug)]
pub struct AreaSet {
    areas: Vec<Area>,
    current: Option<usize>,
    scratch: Option<usize>,
    next_seq: u32,
}

impl AreaSet {
    /// Rejects layouts the engine cannot run on: too few or too many areas,
    /// areas too small for a header and one object, overlapping areas.
    pub fn validate_layout(descs: &[AreaDesc]) -> Result<()> {
        if descs.len() < MIN_AREAS || descs.len() > MAX_AREAS {
            return Err(Error::ConfigError);
        }
        let min_len = (AREA_HEADER_SIZE + OBJECT_HEADER_SIZE + INODE_FIXED_SIZE) as u32;
        for (i, a) in descs.iter().enumerate() {
            if a.length < min_len || a.offset.checked_add(a.length).is_none() {
                return Err(Error::ConfigError);
            }
            let a_end = a.offset as u64 + a.length as u64;
            for b in &descs[i + 1..] {
                let b_end = b.offset as u64 + b.length as u64;
                if (a.offset as u64) < b_end && (b.offset as u64) < a_end {
                    return Err(Error::ConfigError);
                }
            }
        }
        Ok(())
    }

    /// Erases every area, claims the lowest non-scratch area as the first
    /// write area and holds the largest one back as scratch.
    pub fn format(device: &impl FlashDevice, descs: &[AreaDesc]) -> Result<Self> {
        Self::validate_layout(descs)?;
        for desc in descs {
            device.erase(desc.offset, desc.length)?;
        }

        let mut scratch = 0;
        for (i, desc) in descs.iter().enumerate() {
            if desc.length >= descs[scratch].length {
                scratch = i;
            }
        }

        let areas = descs
            .iter()
            .enumerate()
            .map(|(i, &desc)| {
                let state = if i == scratch { AreaState::Scratch } else { AreaState::Free };
                Area::erased(desc, state)
            })
            .collect();
        let mut set = Self {
            areas,
            current: None,
            scratch: Some(scratch),
            next_seq: 1,
        };
        let first = if scratch == 0 { 1 } else { 0 };
        set.write_header(device, first, None)?;
        set.current = Some(first);
        Ok(set)
    }

    /// Rebuilds the set from areas classified by the detector.
    pub fn restored(areas: Vec<Area>, current: Option<usize>, scratch: Option<usize>, next_seq: u32) -> Self {
        Self {
            areas,
            current,
            scratch,
            next_seq,
        }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn area(&self, idx: usize) -> &Area {
        &self.areas[idx]
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn scratch(&self) -> Option<usize> {
        self.scratch
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Largest object any area could hold.
    pub fn max_object_size(&self) -> usize {
        self.areas.iter().map(|a| a.capacity() as usize).max().unwrap_or(0)
    }

    fn addr(&self, loc: FlashLoc, len: usize) -> Result<u32> {
        let area = self.areas.get(loc.area as usize).ok_or(Error::Corrupt)?;
        let end = loc.offset as usize + len;
        if end > area.desc.length as usize {
            return Err(Error::Corrupt);
        }
        Ok(area.desc.offset + loc.offset)
    }

    pub fn read(&self, device: &impl FlashDevice, loc: FlashLoc, buf: &mut [u8]) -> Result<()> {
        let addr = self.addr(loc, buf.len())?;
        device.read(addr, buf)
    }

    pub fn write(&self, device: &impl FlashDevice, loc: FlashLoc, buf: &[u8]) -> Result<()> {
        let addr = self.addr(loc, buf.len())?;
        device.write(addr, buf)
    }

    /// Erases an area; it becomes free with its cursor reset.
    pub fn erase(&mut self, device: &impl FlashDevice, idx: usize) -> Result<()> {
        let desc = self.areas[idx].desc;
        device.erase(desc.offset, desc.length)?;
        self.areas[idx] = Area::erased(desc, AreaState::Free);
        if self.current == Some(idx) {
            self.current = None;
        }
        if self.scratch == Some(idx) {
            self.scratch = None;
        }
        Ok(())
    }

    /// Designates an erased area as the sweep destination.
    pub fn set_scratch(&mut self, idx: usize) {
        debug_assert_eq!(self.areas[idx].state, AreaState::Free);
        self.areas[idx].state = AreaState::Scratch;
        self.scratch = Some(idx);
    }

    /// Writes a fresh area header carrying the next sequence number.
    /// The area must be erased; it becomes active but not yet current.
    pub fn write_header(&mut self, device: &impl FlashDevice, idx: usize, swept_from: Option<u8>) -> Result<()> {
        if self.next_seq == u32::MAX {
            return Err(Error::IdExhausted);
        }
        let header = AreaHeader {
            seq: self.next_seq,
            swept_from,
        };
        let desc = self.areas[idx].desc;
        if self.scratch == Some(idx) {
            self.scratch = None;
        }
        // Anything programmed from here on may be partial, so the area is
        // unusable for appends until the header is known to be in place.
        self.areas[idx] = Area {
            desc,
            seq: header.seq,
            swept_from,
            state: AreaState::Full,
            cursor: AREA_HEADER_SIZE as u32,
        };
        self.next_seq += 1;
        device.write(desc.offset, &header.encode())?;
        self.areas[idx].state = AreaState::Active;
        debug!("area {} claimed with seq {}", idx, header.seq);
        Ok(())
    }

    /// Makes `idx` the area that receives appends. Any previous current area
    /// stops accepting appends.
    pub fn make_current(&mut self, idx: usize) {
        self.retire_current();
        self.areas[idx].state = AreaState::Active;
        self.current = Some(idx);
    }

    /// The current area stops receiving appends.
    pub fn retire_current(&mut self) {
        if let Some(cur) = self.current.take() {
            self.areas[cur].state = AreaState::Full;
        }
    }

    /// Reserves `len` bytes at the cursor of the current area.
    pub fn reserve(&mut self, len: usize) -> Option<FlashLoc> {
        let cur = self.current?;
        self.reserve_in(cur, len)
    }

    /// Reserves `len` bytes at the cursor of a specific area that carries a header.
    pub fn reserve_in(&mut self, idx: usize, len: usize) -> Option<FlashLoc> {
        let area = &mut self.areas[idx];
        if area.has_header() && area.free_space() as usize >= len {
            let loc = FlashLoc::new(idx as u8, area.cursor);
            area.cursor += len as u32;
            Some(loc)
        } else {
            None
        }
    }

    /// Stops appends to an area that is not current, e.g. a sweep destination
    /// whose copy pass failed.
    pub fn mark_full(&mut self, idx: usize) {
        if self.current == Some(idx) {
            self.current = None;
        }
        self.areas[idx].state = AreaState::Full;
    }

    /// Moves appends to the lowest free area able to hold `len` bytes.
    /// Returns false when no free area exists.
    pub fn rotate(&mut self, device: &impl FlashDevice, len: usize) -> Result<bool> {
        let next = self
            .areas
            .iter()
            .position(|a| a.state == AreaState::Free && a.capacity() as usize >= len);
        let Some(next) = next else {
            return Ok(false);
        };
        let desc = self.areas[next].desc;
        device.erase(desc.offset, desc.length)?;
        self.write_header(device, next, None)?;
        debug!("rotating writes from area {:?} to area {}", self.current, next);
        self.make_current(next);
        Ok(true)
    }
}
