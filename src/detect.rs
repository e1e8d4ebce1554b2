//! Mount-time detection and restore. Flash is the only durable state, so
//! every mount rebuilds the area table, the RAM index and the inode tree from
//! a full scan, discarding whatever fails validation.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use enumflags2::BitFlags;
use log::{debug, info, warn};

use crate::area::{Area, AreaSet, AreaState, FlashLoc};
use crate::config::*;
use crate::flash::{AreaDesc, FlashDevice};
use crate::fs::FileSystem;
use crate::index::{HashEntry, RamIndex};
use crate::inode::{area_bit, InodeEntry, InodeTree, Node, Tombstone};
use crate::structs::*;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectState {
    Scanning,
    Validating,
    Indexing,
    TreeBuilding,
    Done,
    Failed,
}

/// A validated record, as visited by [`FileSystem::walk_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub loc: FlashLoc,
    pub seq: u32,
    pub kind: ObjectKind,
    pub flags: BitFlags<ObjectFlag>,
    pub id: u32,
    /// Record size, header included.
    pub size: u32,
}

/// Headers found in one area.
struct AreaScan {
    header: Option<AreaHeader>,
    records: Vec<(FlashLoc, ObjectHeader)>,
    /// Offset just past the last record that could be delimited.
    end: u32,
    /// The scan stopped at something that was neither a header nor erased flash.
    dirty: bool,
}

fn scan_area(device: &impl FlashDevice, idx: usize, desc: AreaDesc) -> Result<AreaScan> {
    let mut buf = [0u8; AREA_HEADER_SIZE];
    device.read(desc.offset, &mut buf)?;
    let Some(header) = AreaHeader::decode(&buf) else {
        return Ok(AreaScan {
            header: None,
            records: Vec::new(),
            end: 0,
            dirty: false,
        });
    };

    let mut records = Vec::new();
    let mut off = AREA_HEADER_SIZE as u32;
    let mut dirty = false;
    let mut buf = [0u8; OBJECT_HEADER_SIZE];
    while off as usize + OBJECT_HEADER_SIZE <= desc.length as usize {
        device.read(desc.offset + off, &mut buf)?;
        let (len, parsed) = match ObjectHeader::decode(&buf) {
            Ok(h) => (h.len, Some(h)),
            Err(HeaderError::Erased) => break,
            Err(HeaderError::BadMagic) => {
                dirty = true;
                break;
            }
            Err(HeaderError::Malformed { len }) => (len, None),
        };
        let size = (OBJECT_HEADER_SIZE + len as usize) as u32;
        if off + size > desc.length {
            dirty = true;
            break;
        }
        match parsed {
            Some(h) => records.push((FlashLoc::new(idx as u8, off), h)),
            None => warn!("skipping malformed header at {}:{}", idx, off),
        }
        off += size;
    }
    if dirty {
        warn!("area {} has unreadable data at offset {}, closing it", idx, off);
    }
    Ok(AreaScan {
        header: Some(header),
        records,
        end: off,
        dirty,
    })
}

#[derive(Debug, Clone)]
enum Payload {
    Inode(DiskInode),
    Block(DiskBlock),
    Tombstone,
}

/// Reads the full record behind a scanned header and checks it end to end:
/// CRC, payload layout and id space. `None` drops the record.
fn validate(device: &impl FlashDevice, desc: AreaDesc, loc: FlashLoc, header: &ObjectHeader) -> Result<Option<Payload>> {
    let mut raw = vec![0u8; header.size()];
    device.read(desc.offset + loc.offset, &mut raw)?;
    if !verify_object(&raw) {
        warn!("crc mismatch for {:#010x} at {}:{}", header.id, loc.area, loc.offset);
        return Ok(None);
    }
    let payload = &raw[OBJECT_HEADER_SIZE..];
    let id = header.id;
    let parsed = match header.kind {
        ObjectKind::Inode if header.is_tombstone() => {
            let valid = payload.is_empty() && id != ROOT_DIR_ID && (is_dir_id(id) || is_file_id(id));
            valid.then_some(Payload::Tombstone)
        }
        ObjectKind::Inode => DiskInode::decode(payload)
            .filter(|inode| match inode.kind {
                InodeKind::Directory => is_dir_id(id),
                InodeKind::File => is_file_id(id),
            })
            .map(Payload::Inode),
        ObjectKind::Block => DiskBlock::decode(payload)
            .filter(|block| {
                is_block_id(id) && is_file_id(block.inode) && (block.prev == NO_BLOCK || is_block_id(block.prev))
            })
            .map(Payload::Block),
    };
    if parsed.is_none() {
        warn!("invalid payload for {:#010x} at {}:{}", id, loc.area, loc.offset);
    }
    Ok(parsed)
}

#[derive(Debug, Clone)]
struct Record {
    seq: u32,
    loc: FlashLoc,
    size: u32,
    payload: Payload,
}

impl Record {
    fn recency(&self) -> (u32, u32) {
        (self.seq, self.loc.offset)
    }
}

/// Ids and locations a restored session starts from.
#[derive(Default)]
struct Restored {
    tree: InodeTree,
    index_entries: Vec<HashEntry>,
    tombstones: BTreeMap<u32, Tombstone>,
    /// Inodes dropped by recovery, with the areas their records occupy.
    doomed: Vec<(u32, u64)>,
    root_missing: bool,
}

/// Runs the detection phases over a set of areas and produces a mounted session.
pub struct Detector<D: FlashDevice> {
    device: Arc<D>,
    descs: Vec<AreaDesc>,
    config: Config,
    state: DetectState,
}

impl<D: FlashDevice> Detector<D> {
    pub fn new(device: Arc<D>, descs: &[AreaDesc], config: Config) -> Self {
        Self {
            device,
            descs: descs.to_vec(),
            config,
            state: DetectState::Scanning,
        }
    }

    pub fn state(&self) -> DetectState {
        self.state
    }

    fn enter(&mut self, next: DetectState) {
        debug!("detect: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn run(&mut self) -> Result<FileSystem<D>> {
        match self.run_phases() {
            Ok(fs) => {
                self.enter(DetectState::Done);
                Ok(fs)
            }
            Err(e) => {
                warn!("detect failed in {:?}: {:?}", self.state, e);
                self.enter(DetectState::Failed);
                Err(e)
            }
        }
    }

    fn run_phases(&mut self) -> Result<FileSystem<D>> {
        self.config.validate()?;
        AreaSet::validate_layout(&self.descs)?;
        let device = Arc::clone(&self.device);
        let descs = self.descs.clone();
        let n = descs.len();

        self.enter(DetectState::Scanning);
        let scans = descs
            .iter()
            .enumerate()
            .map(|(i, &desc)| scan_area(&*device, i, desc))
            .collect::<Result<Vec<_>>>()?;
        let Some(max_seq) = scans.iter().filter_map(|s| s.header.map(|h| h.seq)).max() else {
            return Err(Error::FilesystemNotFormatted);
        };

        // A destination header naming a source that still carries an older
        // header means the sweep between them never finished.
        let mut excluded = vec![false; n];
        let mut resume = None;
        for (d, scan) in scans.iter().enumerate() {
            let Some(AreaHeader { seq, swept_from: Some(s) }) = scan.header else {
                continue;
            };
            let s = s as usize;
            let source_alive = scans.get(s).and_then(|src| src.header).is_some_and(|h| h.seq < seq);
            if !source_alive {
                continue;
            }
            if scan.dirty {
                warn!("sweep of area {} into {} was cut off mid-copy, discarding the copy", s, d);
                excluded[d] = true;
            } else {
                warn!("sweep of area {} into {} was interrupted, resuming", s, d);
                resume = Some((s, d));
            }
        }

        let mut order: Vec<usize> = (0..n).filter(|&i| scans[i].header.is_some() && !excluded[i]).collect();
        order.sort_by_key(|&i| scans[i].header.map(|h| h.seq));

        self.enter(DetectState::Validating);
        let mut records = Vec::new();
        for &i in &order {
            let seq = scans[i].header.map(|h| h.seq).unwrap_or(0);
            for (loc, header) in &scans[i].records {
                if let Some(payload) = validate(&*device, descs[i], *loc, header)? {
                    let record = Record {
                        seq,
                        loc: *loc,
                        size: header.size() as u32,
                        payload,
                    };
                    records.push((header.id, record));
                }
            }
        }

        self.enter(DetectState::Indexing);
        let mut latest: BTreeMap<u32, Record> = BTreeMap::new();
        let mut older: BTreeMap<u32, u64> = BTreeMap::new();
        let mut max_dir = ROOT_DIR_ID;
        let mut max_file = None;
        let mut max_block = None;
        for (id, record) in records {
            if is_dir_id(id) {
                max_dir = max_dir.max(id);
            } else if is_file_id(id) {
                max_file = max_file.max(Some(id));
            } else {
                max_block = max_block.max(Some(id));
            }
            if let Some(prev) = latest.insert(id, record) {
                *older.entry(id).or_default() |= area_bit(prev.loc.area);
            }
        }

        self.enter(DetectState::TreeBuilding);
        let restored = build_tree(&latest, &older);
        let mut index = RamIndex::new(self.config.index_buckets, self.config.max_objects)?;
        if restored.index_entries.len() > index.capacity() {
            warn!(
                "{} live objects exceed the index capacity of {}",
                restored.index_entries.len(),
                index.capacity()
            );
            return Err(Error::ConfigError);
        }
        for entry in &restored.index_entries {
            index.insert(*entry).map_err(|_| Error::ConfigError)?;
        }

        let mut areas: Vec<Area> = descs.iter().map(|&d| Area::erased(d, AreaState::Free)).collect();
        for &i in &order {
            if let Some(h) = scans[i].header {
                areas[i].seq = h.seq;
                areas[i].swept_from = h.swept_from;
                areas[i].state = AreaState::Full;
                areas[i].cursor = scans[i].end;
            }
        }
        for (i, _) in excluded.iter().enumerate().filter(|(_, x)| **x) {
            device.erase(descs[i].offset, descs[i].length)?;
        }
        let current = order.last().copied().filter(|&i| !scans[i].dirty);
        if let Some(cur) = current {
            areas[cur].state = AreaState::Active;
        }
        let mut scratch: Option<usize> = None;
        for (i, area) in areas.iter().enumerate() {
            if area.state == AreaState::Free && scratch.is_none_or(|s| area.desc.length >= areas[s].desc.length) {
                scratch = Some(i);
            }
        }
        if let Some(s) = scratch {
            areas[s].state = AreaState::Scratch;
        }
        let next_seq = max_seq.saturating_add(1);

        let mut fs = FileSystem {
            device,
            config: self.config,
            areas: AreaSet::restored(areas, current, scratch, next_seq),
            index,
            tree: restored.tree,
            tombstones: restored.tombstones,
            next_dir_id: max_dir + 1,
            next_file_id: max_file.map_or(FILE_ID_MIN, |id| id + 1),
            next_block_id: max_block.map_or(BLOCK_ID_MIN, |id| id + 1),
        };

        if let Some((s, d)) = resume {
            match fs.evacuate(s, d).and_then(|_| fs.finish_sweep(s)) {
                Ok(()) => info!("finished interrupted sweep of area {} into {}", s, d),
                Err(e) => warn!("could not finish sweep of area {}: {:?}", s, e),
            }
        }
        if restored.root_missing {
            warn!("root directory record missing, rewriting it");
            let root = fs.tree.get(ROOT_DIR_ID)?.clone();
            let (loc, size) = fs.write_inode_record(&root)?;
            fs.commit_inode_loc(ROOT_DIR_ID, loc, size)?;
        }
        let live_mask = fs
            .areas
            .areas()
            .iter()
            .enumerate()
            .filter(|(_, a)| a.has_header())
            .fold(0u64, |mask, (i, _)| mask | area_bit(i as u8));
        for (id, footprint) in restored.doomed {
            match fs.write_tombstone(id) {
                Ok((loc, _)) if footprint & live_mask != 0 => {
                    fs.tombstones.insert(
                        id,
                        Tombstone {
                            id,
                            loc,
                            footprint: footprint & live_mask,
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("tombstone for recovered {:#010x} not written: {:?}", id, e),
            }
        }

        info!(
            "mounted: {} inodes, {} indexed objects, {} tombstones, current {:?}, scratch {:?}",
            fs.tree.len(),
            fs.index.len(),
            fs.tombstones.len(),
            fs.areas.current(),
            fs.areas.scratch()
        );
        Ok(fs)
    }
}

/// Walks a file chain through the latest block records.
/// Returns the block ids newest first and the total data length.
fn walk_chain(latest: &BTreeMap<u32, Record>, owner: u32, newest: u32) -> Option<(Vec<u32>, u64)> {
    let mut ids = Vec::new();
    let mut size = 0u64;
    let mut next = newest;
    while next != NO_BLOCK {
        if ids.len() >= latest.len() {
            return None;
        }
        let block = match &latest.get(&next)?.payload {
            Payload::Block(b) if b.inode == owner => *b,
            _ => return None,
        };
        size += block.data_len as u64;
        ids.push(next);
        next = block.prev;
    }
    Some((ids, size))
}

/// Links the newest inode records into a tree rooted at the root directory.
/// Anything not reachable from the root, the older of two same-named
/// siblings, and files with a broken chain are dropped.
fn build_tree(latest: &BTreeMap<u32, Record>, older: &BTreeMap<u32, u64>) -> Restored {
    let mut restored = Restored::default();
    let footprint = |id: u32, record: &Record| older.get(&id).copied().unwrap_or(0) | area_bit(record.loc.area);

    let mut children: BTreeMap<u32, Vec<((u32, u32), u32)>> = BTreeMap::new();
    for (&id, record) in latest {
        match &record.payload {
            Payload::Inode(inode) if id != ROOT_DIR_ID => {
                children.entry(inode.parent).or_default().push((record.recency(), id));
            }
            Payload::Tombstone => {
                let shadowed = older.get(&id).copied().unwrap_or(0);
                if shadowed != 0 {
                    restored.tombstones.insert(
                        id,
                        Tombstone {
                            id,
                            loc: record.loc,
                            footprint: shadowed,
                        },
                    );
                }
            }
            _ => {}
        }
    }

    let mut root = InodeEntry::new_dir(ROOT_DIR_ID, ID_NONE, String::new());
    match latest.get(&ROOT_DIR_ID) {
        Some(record) if matches!(record.payload, Payload::Inode(_)) => {
            root.footprint = footprint(ROOT_DIR_ID, record);
            restored.index_entries.push(HashEntry {
                id: ROOT_DIR_ID,
                loc: record.loc,
                size: record.size,
            });
        }
        _ => restored.root_missing = true,
    }
    restored.tree.insert_root(root);

    let mut queue = VecDeque::from([ROOT_DIR_ID]);
    while let Some(dir) = queue.pop_front() {
        let Some(mut kids) = children.remove(&dir) else {
            continue;
        };
        kids.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, kid) in kids {
            let record = &latest[&kid];
            let Payload::Inode(inode) = &record.payload else {
                continue;
            };
            let mut entry = InodeEntry::from_disk(kid, inode);
            entry.footprint = footprint(kid, record);
            let is_dir = entry.is_dir();
            if restored.tree.link(entry).is_err() {
                warn!("dropping {:#010x}: name '{}' already taken by a newer record", kid, inode.name);
                continue;
            }
            if is_dir {
                queue.push_back(kid);
            }
        }
    }

    let files: Vec<(u32, u32)> = restored
        .tree
        .iter()
        .filter_map(|e| match &e.node {
            Node::File(f) => Some((e.id, f.newest_block)),
            Node::Directory(_) => None,
        })
        .collect();
    for (id, newest) in files {
        let Some((blocks, size)) = walk_chain(latest, id, newest) else {
            warn!("file {:#010x} has a broken block chain, deleting it", id);
            restored.tree.unlink(id);
            continue;
        };
        if let Ok(file) = restored.tree.get_mut(id).and_then(|e| e.as_file_mut()) {
            file.size = size;
        }
        for block in blocks {
            let record = &latest[&block];
            restored.index_entries.push(HashEntry {
                id: block,
                loc: record.loc,
                size: record.size,
            });
        }
    }

    for (&id, record) in latest {
        if id == ROOT_DIR_ID || !matches!(record.payload, Payload::Inode(_)) {
            continue;
        }
        if restored.tree.contains(id) {
            restored.index_entries.push(HashEntry {
                id,
                loc: record.loc,
                size: record.size,
            });
        } else {
            restored.doomed.push((id, footprint(id, record)));
        }
    }
    if !restored.doomed.is_empty() {
        warn!("recovery deleted {} unreachable or damaged inodes", restored.doomed.len());
    }
    restored
}

impl<D: FlashDevice> FileSystem<D> {
    /// Scans flash and rebuilds a session. Fails with `FilesystemNotFormatted`
    /// when no area carries a valid header.
    pub fn detect(device: Arc<D>, descs: &[AreaDesc], config: Config) -> Result<Self> {
        Detector::new(device, descs, config).run()
    }

    /// Visits every record that passes validation, oldest area first.
    /// Read-only; returns the number of records visited.
    pub fn walk_log(&self, mut f: impl FnMut(&LogEntry)) -> Result<usize> {
        let mut order: Vec<usize> = (0..self.areas.len()).filter(|&i| self.areas.area(i).has_header()).collect();
        order.sort_by_key(|&i| self.areas.area(i).seq);
        let mut visited = 0;
        for i in order {
            let area = self.areas.area(i);
            let scan = scan_area(&*self.device, i, area.desc)?;
            for (loc, header) in &scan.records {
                if validate(&*self.device, area.desc, *loc, header)?.is_some() {
                    f(&LogEntry {
                        loc: *loc,
                        seq: area.seq,
                        kind: header.kind,
                        flags: header.flags,
                        id: header.id,
                        size: header.size() as u32,
                    });
                    visited += 1;
                }
            }
        }
        Ok(visited)
    }
}
