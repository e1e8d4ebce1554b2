//! A log-structured file system for raw NOR/NAND flash on small devices.
//!
//! Flash is split into erasable areas. Every change is appended to the
//! current area as a self-describing, CRC-protected object record; nothing is
//! rewritten in place. One area is always held back as scratch so a sweep can
//! compact live objects out of a full area before erasing it.
//!
//! Layers (from bottom to top):
//! 1. Flash device: driver for reads, programs and area erases.      | User implemented (hardware-specific)
//! 2. Areas: append cursors, sequence numbers, rotation.             | Fs implemented
//! 3. Object log: record codecs and the append-then-index writer.     | Fs implemented
//! 4. RAM index + inode tree: id to location, directory hierarchy.   | Fs implemented, rebuilt at every mount
//! 5. Detect/restore and sweep: mount-time recovery, compaction.     | Fs implemented
//! 6. FileSystem: path and file handle operations.                   | User wraps a lock around it if shared
//!
//! Flash is the only durable truth. Mounting scans every area, validates every
//! record and rebuilds the RAM state; anything that fails validation is
//! dropped along with whatever depends on it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod error;
mod flash;
mod structs;
mod area;
mod index;
mod inode;
mod directory;
mod path;
mod block;
mod writer;
mod detect;
mod sweep;
mod file;
mod fs;

pub use area::{Area, AreaSet, AreaState, FlashLoc};
pub use block::BlockRef;
pub use config::*;
pub use detect::{DetectState, Detector, LogEntry};
pub use directory::{validate_name, DirEntry};
pub use error::FsError as Error;
pub use error::Result;
pub use file::{File, OpenFlag};
pub use flash::{AreaDesc, FlashDevice};
pub use fs::*;
pub use index::{HashEntry, RamIndex};
pub use inode::{DirNode, FileNode, InodeEntry, InodeTree, Node, Tombstone};
pub use path::{resolve, split};
pub use structs::*;
pub use sweep::AreaStats;
