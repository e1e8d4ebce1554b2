//! On-flash record layouts. All multi-byte fields are little-endian.
//!
//! Area header (16 bytes):
//! `magic u32 | version u8 | swept_from u8 | reserved u16 | seq u32 | crc u32`
//!
//! Object header (16 bytes), followed by `len` payload bytes:
//! `magic u32 | len u16 | kind u8 | flags u8 | id u32 | crc u32`
//!
//! The object CRC covers the first 12 header bytes and the payload.

use alloc::string::String;
use alloc::vec::Vec;

use enumflags2::{bitflags, BitFlags};

use crate::config::*;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Inode = 1,
    Block = 2,
}

impl ObjectKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ObjectKind::Inode),
            2 => Some(ObjectKind::Block),
            _ => None,
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFlag {
    Tombstone = 0b0000_0001,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File = 1,
    Directory = 2,
}

impl InodeKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(InodeKind::File),
            2 => Some(InodeKind::Directory),
            _ => None,
        }
    }

    /// The id space new inodes of this kind are drawn from.
    pub fn id_range(&self) -> (u32, u32) {
        match self {
            InodeKind::File => (FILE_ID_MIN, FILE_ID_MAX),
            InodeKind::Directory => (DIR_ID_MIN, DIR_ID_MAX),
        }
    }
}

pub fn is_dir_id(id: u32) -> bool {
    id < DIR_ID_MAX
}

pub fn is_file_id(id: u32) -> bool {
    (FILE_ID_MIN..FILE_ID_MAX).contains(&id)
}

pub fn is_block_id(id: u32) -> bool {
    (BLOCK_ID_MIN..BLOCK_ID_MAX).contains(&id)
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(b)
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn is_erased(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == ERASED_BYTE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaHeader {
    /// Generation counter, strictly increasing across area lifetimes.
    pub seq: u32,
    /// Index of the area whose live objects were compacted into this one.
    pub swept_from: Option<u8>,
}

impl AreaHeader {
    pub fn encode(&self) -> [u8; AREA_HEADER_SIZE] {
        let mut buf = [0u8; AREA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&AREA_MAGIC.to_le_bytes());
        buf[4] = FORMAT_VERSION;
        buf[5] = self.swept_from.unwrap_or(NO_AREA);
        buf[6..8].copy_from_slice(&u16::MAX.to_le_bytes());
        buf[8..12].copy_from_slice(&self.seq.to_le_bytes());
        let crc = crc32fast::hash(&buf[..12]);
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Returns `None` for erased flash and for anything that is not an intact header.
    pub fn decode(buf: &[u8; AREA_HEADER_SIZE]) -> Option<Self> {
        if le_u32(buf, 0) != AREA_MAGIC || buf[4] != FORMAT_VERSION {
            return None;
        }
        if crc32fast::hash(&buf[..12]) != le_u32(buf, 12) {
            return None;
        }
        Some(Self {
            seq: le_u32(buf, 8),
            swept_from: if buf[5] == NO_AREA { None } else { Some(buf[5]) },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub flags: BitFlags<ObjectFlag>,
    pub id: u32,
    /// Payload length, header excluded.
    pub len: u16,
    pub crc: u32,
}

/// Why a header slot could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Unwritten flash; the log ends here.
    Erased,
    /// Not a header at all; nothing past this point can be located.
    BadMagic,
    /// Magic is intact but a field is out of range; `len` still gives the extent.
    Malformed { len: u16 },
}

impl ObjectHeader {
    pub fn size(&self) -> usize {
        OBJECT_HEADER_SIZE + self.len as usize
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(ObjectFlag::Tombstone)
    }

    pub fn decode(buf: &[u8; OBJECT_HEADER_SIZE]) -> core::result::Result<Self, HeaderError> {
        if is_erased(buf) {
            return Err(HeaderError::Erased);
        }
        if le_u32(buf, 0) != OBJECT_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let len = le_u16(buf, 4);
        let kind = ObjectKind::from_u8(buf[6]).ok_or(HeaderError::Malformed { len })?;
        let flags = BitFlags::<ObjectFlag>::from_bits(buf[7]).map_err(|_| HeaderError::Malformed { len })?;
        Ok(Self {
            kind,
            flags,
            id: le_u32(buf, 8),
            len,
            crc: le_u32(buf, 12),
        })
    }
}

/// Serializes a complete object record (header plus payload) with its CRC.
pub fn encode_object(kind: ObjectKind, flags: BitFlags<ObjectFlag>, id: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
    let mut buf = Vec::with_capacity(OBJECT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&OBJECT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.push(kind as u8);
    buf.push(flags.bits());
    buf.extend_from_slice(&id.to_le_bytes());
    let crc = object_crc(&buf[..12], payload);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn object_crc(header_prefix: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    hasher.update(payload);
    hasher.finalize()
}

/// Checks the CRC of a raw record as read back from flash.
pub fn verify_object(raw: &[u8]) -> bool {
    if raw.len() < OBJECT_HEADER_SIZE {
        return false;
    }
    object_crc(&raw[..12], &raw[OBJECT_HEADER_SIZE..]) == le_u32(raw, 12)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    pub parent: u32,
    /// Newest block of a file, `NO_BLOCK` for empty files and directories.
    pub newest_block: u32,
    pub kind: InodeKind,
    pub name: String,
}

impl DiskInode {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut buf = Vec::with_capacity(INODE_FIXED_SIZE + name.len());
        buf.extend_from_slice(&self.parent.to_le_bytes());
        buf.extend_from_slice(&self.newest_block.to_le_bytes());
        buf.push(self.kind as u8);
        buf.push(name.len() as u8);
        buf.extend_from_slice(&u16::MAX.to_le_bytes());
        buf.extend_from_slice(name);
        buf
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < INODE_FIXED_SIZE {
            return None;
        }
        let kind = InodeKind::from_u8(payload[8])?;
        let name_len = payload[9] as usize;
        if name_len > MAX_NAME_LEN || INODE_FIXED_SIZE + name_len != payload.len() {
            return None;
        }
        let name = core::str::from_utf8(&payload[INODE_FIXED_SIZE..]).ok()?;
        Some(Self {
            parent: le_u32(payload, 0),
            newest_block: le_u32(payload, 4),
            kind,
            name: String::from(name),
        })
    }
}

/// Fixed part of a block payload; the data bytes follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskBlock {
    pub inode: u32,
    pub prev: u32,
    pub data_len: u16,
}

impl DiskBlock {
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        debug_assert_eq!(data.len(), self.data_len as usize);
        let mut buf = Vec::with_capacity(BLOCK_FIXED_SIZE + data.len());
        buf.extend_from_slice(&self.inode.to_le_bytes());
        buf.extend_from_slice(&self.prev.to_le_bytes());
        buf.extend_from_slice(&self.data_len.to_le_bytes());
        buf.extend_from_slice(&u16::MAX.to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    /// Decodes the fixed part, checking it against the full payload length.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < BLOCK_FIXED_SIZE {
            return None;
        }
        let block = Self {
            inode: le_u32(payload, 0),
            prev: le_u32(payload, 4),
            data_len: le_u16(payload, 8),
        };
        if BLOCK_FIXED_SIZE + block.data_len as usize != payload.len() {
            return None;
        }
        Some(block)
    }
}
