//! RAM index: object id to flash location, rebuilt from scratch on every mount.
//!
//! A fixed array of buckets, each heading a singly linked chain through a
//! slot arena. Freed slots are threaded onto a free list and reused, so the
//! arena never grows past the capacity chosen at mount.

use alloc::vec;
use alloc::vec::Vec;

use crate::area::FlashLoc;
use crate::{Error, Result};

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    pub id: u32,
    pub loc: FlashLoc,
    /// Record size on flash, header included.
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    entry: HashEntry,
    next: u32,
}

#[derive(Debug)]
pub struct RamIndex {
    buckets: Vec<u32>,
    slots: Vec<Slot>,
    free: u32,
    len: usize,
    capacity: usize,
}

fn mix(id: u32) -> u32 {
    let mut x = id;
    x ^= x >> 16;
    x = x.wrapping_mul(0x045d_9f3b);
    x ^= x >> 16;
    x
}

impl RamIndex {
    pub fn new(num_buckets: usize, capacity: usize) -> Result<Self> {
        if num_buckets == 0 || !num_buckets.is_power_of_two() || capacity == 0 || capacity >= NIL as usize {
            return Err(Error::ConfigError);
        }
        Ok(Self {
            buckets: vec![NIL; num_buckets],
            slots: Vec::new(),
            free: NIL,
            len: 0,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket(&self, id: u32) -> usize {
        mix(id) as usize & (self.buckets.len() - 1)
    }

    fn find(&self, id: u32) -> Option<usize> {
        let mut cur = self.buckets[self.bucket(id)];
        while cur != NIL {
            let slot = &self.slots[cur as usize];
            if slot.entry.id == id {
                return Some(cur as usize);
            }
            cur = slot.next;
        }
        None
    }

    pub fn lookup(&self, id: u32) -> Option<&HashEntry> {
        self.find(id).map(|i| &self.slots[i].entry)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.find(id).is_some()
    }

    /// Inserts or replaces the entry for `entry.id`, returning the replaced one.
    /// Fails with `NoMemory` when a new id would exceed the capacity.
    pub fn insert(&mut self, entry: HashEntry) -> Result<Option<HashEntry>> {
        if let Some(i) = self.find(entry.id) {
            let old = self.slots[i].entry;
            self.slots[i].entry = entry;
            return Ok(Some(old));
        }
        if self.len >= self.capacity {
            return Err(Error::NoMemory);
        }

        let bucket = self.bucket(entry.id);
        let slot = Slot {
            entry,
            next: self.buckets[bucket],
        };
        let idx = if self.free != NIL {
            let idx = self.free;
            self.free = self.slots[idx as usize].next;
            self.slots[idx as usize] = slot;
            idx
        } else {
            self.slots.push(slot);
            (self.slots.len() - 1) as u32
        };
        self.buckets[bucket] = idx;
        self.len += 1;
        Ok(None)
    }

    /// Points an existing entry at a new copy of its record.
    pub fn relocate(&mut self, id: u32, loc: FlashLoc) -> bool {
        match self.find(id) {
            Some(i) => {
                self.slots[i].entry.loc = loc;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<HashEntry> {
        let bucket = self.bucket(id);
        let mut prev = NIL;
        let mut cur = self.buckets[bucket];
        while cur != NIL {
            let next = self.slots[cur as usize].next;
            if self.slots[cur as usize].entry.id == id {
                if prev == NIL {
                    self.buckets[bucket] = next;
                } else {
                    self.slots[prev as usize].next = next;
                }
                self.slots[cur as usize].next = self.free;
                self.free = cur;
                self.len -= 1;
                return Some(self.slots[cur as usize].entry);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// All live entries, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = &HashEntry> + '_ {
        self.buckets.iter().flat_map(move |&head| {
            let mut cur = head;
            core::iter::from_fn(move || {
                if cur == NIL {
                    return None;
                }
                let slot = &self.slots[cur as usize];
                cur = slot.next;
                Some(&slot.entry)
            })
        })
    }

    /// Entries whose record lives in `area`, sorted by offset.
    pub fn entries_in_area(&self, area: u8) -> Vec<HashEntry> {
        let mut entries: Vec<HashEntry> = self.iter().filter(|e| e.loc.area == area).copied().collect();
        entries.sort_by_key(|e| e.loc.offset);
        entries
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = NIL);
        self.slots.clear();
        self.free = NIL;
        self.len = 0;
    }
}
