use crate::{Error, Result};

pub const AREA_MAGIC: u32 = 0x4E46_4653; // "NFFS" in ASCII
pub const OBJECT_MAGIC: u32 = 0x4F42_4A31; // "OBJ1" in ASCII
pub const FORMAT_VERSION: u8 = 1;
pub const ERASED_BYTE: u8 = 0xFF;

pub const AREA_HEADER_SIZE: usize = 16;
pub const OBJECT_HEADER_SIZE: usize = 16;
pub const INODE_FIXED_SIZE: usize = 12; // parent, newest block, kind, name length, reserved
pub const BLOCK_FIXED_SIZE: usize = 12; // owner, previous block, data length, reserved

pub const MIN_AREAS: usize = 2; // One writable area plus the scratch area
pub const MAX_AREAS: usize = 64; // Bounded by the width of an inode's area footprint
pub const NO_AREA: u8 = 0xFF;

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

pub const ROOT_DIR_ID: u32 = 0;
pub const ID_NONE: u32 = 0xFFFF_FFFF;
pub const DIR_ID_MIN: u32 = 0;
pub const DIR_ID_MAX: u32 = 0x1000_0000;
pub const FILE_ID_MIN: u32 = 0x1000_0000;
pub const FILE_ID_MAX: u32 = 0x8000_0000;
pub const BLOCK_ID_MIN: u32 = 0x8000_0000;
pub const BLOCK_ID_MAX: u32 = 0xFFFF_FFFF;
pub const NO_BLOCK: u32 = 0; // Previous-id of the first block, newest-id of an empty file

pub const DEFAULT_INDEX_BUCKETS: usize = 256;
pub const DEFAULT_MAX_OBJECTS: usize = 1024;
pub const DEFAULT_BLOCK_MAX_DATA: usize = 2048;

/// Mount-time tunables. Fixed for the lifetime of a mounted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of hash buckets in the RAM index, must be a power of two.
    pub index_buckets: usize,
    /// Maximum number of live ids (inodes plus blocks) the RAM index holds.
    pub max_objects: usize,
    /// Largest data payload a single block record carries.
    pub block_max_data: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_buckets: DEFAULT_INDEX_BUCKETS,
            max_objects: DEFAULT_MAX_OBJECTS,
            block_max_data: DEFAULT_BLOCK_MAX_DATA,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.index_buckets == 0 || !self.index_buckets.is_power_of_two() {
            return Err(Error::ConfigError);
        }
        if self.max_objects == 0 || self.max_objects > u32::MAX as usize {
            return Err(Error::ConfigError);
        }
        if self.block_max_data == 0 || self.block_max_data + BLOCK_FIXED_SIZE > MAX_PAYLOAD_LEN {
            return Err(Error::ConfigError);
        }
        Ok(())
    }
}
