//! Garbage collection. A sweep copies the live records of one full area into
//! the scratch area, then erases the source, which becomes the new scratch.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::area::{AreaState, FlashLoc};
use crate::config::OBJECT_HEADER_SIZE;
use crate::flash::FlashDevice;
use crate::fs::FileSystem;
use crate::inode::area_bit;
use crate::structs::verify_object;
use crate::{Error, Result};

/// Per-area usage, as reported by [`FileSystem::area_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaStats {
    pub index: usize,
    pub state: AreaState,
    pub seq: u32,
    pub swept_from: Option<u8>,
    pub cursor: u32,
    pub length: u32,
    /// Bytes a sweep of this area would have to copy.
    pub live_bytes: u32,
}

/// A record that must survive the sweep of its area.
#[derive(Debug, Clone, Copy)]
enum Survivor {
    Indexed { id: u32, loc: FlashLoc, size: u32 },
    Tombstone { id: u32, loc: FlashLoc },
}

impl Survivor {
    fn loc(&self) -> FlashLoc {
        match *self {
            Survivor::Indexed { loc, .. } | Survivor::Tombstone { loc, .. } => loc,
        }
    }
}

impl<D: FlashDevice> FileSystem<D> {
    pub fn area_stats(&self) -> Vec<AreaStats> {
        self.areas
            .areas()
            .iter()
            .enumerate()
            .map(|(i, a)| AreaStats {
                index: i,
                state: a.state,
                seq: a.seq,
                swept_from: a.swept_from,
                cursor: a.cursor,
                length: a.desc.length,
                live_bytes: self.live_bytes(i),
            })
            .collect()
    }

    /// Live records of `area` in offset order: every index entry pointing
    /// into it, plus tombstones that still shadow a record in another area.
    fn survivors(&self, area: usize) -> Vec<Survivor> {
        let bit = area_bit(area as u8);
        let mut survivors: Vec<Survivor> = self
            .index
            .entries_in_area(area as u8)
            .into_iter()
            .map(|e| Survivor::Indexed {
                id: e.id,
                loc: e.loc,
                size: e.size,
            })
            .collect();
        survivors.extend(
            self.tombstones
                .values()
                .filter(|t| t.loc.area as usize == area && t.footprint & !bit != 0)
                .map(|t| Survivor::Tombstone { id: t.id, loc: t.loc }),
        );
        survivors.sort_by_key(|s| s.loc().offset);
        survivors
    }

    pub(crate) fn live_bytes(&self, area: usize) -> u32 {
        self.survivors(area)
            .iter()
            .map(|s| match *s {
                Survivor::Indexed { size, .. } => size,
                Survivor::Tombstone { .. } => OBJECT_HEADER_SIZE as u32,
            })
            .sum()
    }

    /// Full area with the fewest live bytes that still fits into scratch.
    /// Ties go to the older area.
    fn pick_victim(&self, scratch: usize) -> Option<usize> {
        let room = self.areas.area(scratch).capacity();
        self.areas
            .areas()
            .iter()
            .enumerate()
            .filter(|(i, a)| *i != scratch && a.state == AreaState::Full)
            .map(|(i, a)| (self.live_bytes(i), a.seq, i))
            .filter(|(live, _, _)| *live <= room)
            .min()
            .map(|(_, _, i)| i)
    }

    /// Runs one sweep pass on demand. Returns false when no area could be reclaimed.
    pub fn sweep(&mut self) -> Result<bool> {
        self.sweep_once()
    }

    pub(crate) fn sweep_once(&mut self) -> Result<bool> {
        let Some(scratch) = self.areas.scratch() else {
            warn!("no scratch area, sweep impossible");
            return Ok(false);
        };
        // The current area is where allocation just failed; it is swept like any other.
        let previous = self.areas.current();
        self.areas.retire_current();
        let Some(victim) = self.pick_victim(scratch) else {
            if let Some(cur) = previous {
                self.areas.make_current(cur);
            }
            debug!("sweep found nothing to reclaim");
            return Ok(false);
        };

        if let Err(e) = self.areas.erase(&*self.device, scratch) {
            if let Some(cur) = previous {
                self.areas.make_current(cur);
            }
            return Err(e);
        }
        let before = self.areas.area(victim).cursor;
        if let Err(e) = self.areas.write_header(&*self.device, scratch, Some(victim as u8)) {
            if self.areas.erase(&*self.device, scratch).is_ok() {
                self.areas.set_scratch(scratch);
            }
            if let Some(cur) = previous {
                self.areas.make_current(cur);
            }
            return Err(e);
        }
        if let Err(e) = self.evacuate(victim, scratch) {
            warn!("sweep of area {} into {} failed: {:?}", victim, scratch, e);
            self.areas.mark_full(scratch);
            return Err(e);
        }
        self.areas.make_current(scratch);
        self.finish_sweep(victim)?;
        info!(
            "swept area {} into area {}: {} bytes down to {}",
            victim,
            scratch,
            before,
            self.areas.area(scratch).cursor
        );
        Ok(true)
    }

    /// Copies every survivor of `src` to the end of `dest` and repoints RAM
    /// state at the copies. `dest` must carry a header newer than `src`.
    pub(crate) fn evacuate(&mut self, src: usize, dest: usize) -> Result<()> {
        let dest_bit = area_bit(dest as u8);
        for survivor in self.survivors(src) {
            let (id, loc, size) = match survivor {
                Survivor::Indexed { id, loc, size } => (id, loc, size as usize),
                Survivor::Tombstone { id, loc } => (id, loc, OBJECT_HEADER_SIZE),
            };
            let mut raw = vec![0u8; size];
            self.areas.read(&*self.device, loc, &mut raw)?;
            if !verify_object(&raw) {
                // Copying it would only move the damage; the owner is dropped at next mount.
                warn!("dropping unreadable record {:#010x} at {}:{}", id, loc.area, loc.offset);
                match survivor {
                    Survivor::Indexed { .. } => {
                        self.index.remove(id);
                    }
                    Survivor::Tombstone { .. } => {
                        self.tombstones.remove(&id);
                    }
                }
                continue;
            }
            let new_loc = self.areas.reserve_in(dest, size).ok_or(Error::OutOfSpace)?;
            self.areas.write(&*self.device, new_loc, &raw)?;
            match survivor {
                Survivor::Indexed { .. } => {
                    self.index.relocate(id, new_loc);
                    if let Ok(entry) = self.tree.get_mut(id) {
                        entry.footprint |= dest_bit;
                    }
                }
                Survivor::Tombstone { .. } => {
                    if let Some(t) = self.tombstones.get_mut(&id) {
                        t.loc = new_loc;
                    }
                }
            }
            debug!("moved {:#010x} from {}:{} to {}:{}", id, loc.area, loc.offset, new_loc.area, new_loc.offset);
        }
        Ok(())
    }

    /// Erases a fully evacuated area and makes it the scratch area unless one
    /// is already held back. No record of any id can live there afterwards,
    /// so it leaves every footprint.
    pub(crate) fn finish_sweep(&mut self, src: usize) -> Result<()> {
        self.areas.erase(&*self.device, src)?;
        if self.areas.scratch().is_none() {
            self.areas.set_scratch(src);
        }
        let mask = !area_bit(src as u8);
        for entry in self.tree.iter_mut() {
            entry.footprint &= mask;
        }
        self.tombstones.retain(|_, t| {
            t.footprint &= mask;
            t.footprint != 0
        });
        Ok(())
    }
}
