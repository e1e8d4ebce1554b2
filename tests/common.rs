//! Common utilities for tests

#![allow(unused)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use enumflags2::BitFlags;
use nffs::{AreaDesc, Config, Error, FileSystem, FlashDevice, OpenFlag};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr) => {
        println!("{}[test] {}{}", crate::common::ORANGE, $msg, crate::common::RESET)
    };
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

static LOGGER: Once = Once::new();

/// Routes the library's `log` output through env_logger, once per test binary.
pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// NOR flash in RAM. Programming can only clear bits, erasing sets every byte
/// of the range back to 0xFF. A program/erase budget simulates power loss:
/// once it runs out every further program or erase fails without touching
/// the array, until `heal` restores power.
pub struct RamFlash {
    inner: Mutex<Vec<u8>>,
    budget: Mutex<Option<usize>>,
    ops: AtomicUsize,
}

impl RamFlash {
    /// Creates flash of `size` bytes in the erased state.
    pub fn new(size: usize) -> Self {
        RamFlash {
            inner: Mutex::new(vec![0xFF; size]),
            budget: Mutex::new(None),
            ops: AtomicUsize::new(0),
        }
    }

    /// Flash holding `count` back to back areas of `area_size` bytes, and their layout.
    pub fn with_areas(count: usize, area_size: u32) -> (Arc<Self>, Vec<AreaDesc>) {
        let descs = (0..count as u32).map(|i| AreaDesc::new(i * area_size, area_size)).collect();
        (Arc::new(Self::new(count * area_size as usize)), descs)
    }

    /// Lets `n` more program/erase operations through, then cuts power.
    pub fn fail_after(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.budget.lock().unwrap() = None;
    }

    /// Program and erase operations that reached the array so far.
    pub fn ops(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    /// Overwrites raw bytes, bypassing NOR semantics, to simulate bit rot.
    pub fn corrupt(&self, addr: u32, bytes: &[u8]) {
        let mut data = self.inner.lock().unwrap();
        let start = addr as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }

    fn spend(&self) -> Result<(), Error> {
        let mut budget = self.budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => Err(Error::IoError),
            Some(n) => {
                *n -= 1;
                self.ops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => {
                self.ops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, Error> {
        let start = addr as usize;
        let end = start + len;
        if end > self.inner.lock().unwrap().len() {
            return Err(Error::IoError);
        }
        Ok(start..end)
    }
}

impl FlashDevice for RamFlash {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.inner.lock().unwrap()[range]);
        Ok(())
    }

    fn write(&self, addr: u32, buf: &[u8]) -> Result<(), Error> {
        let range = self.range(addr, buf.len())?;
        self.spend()?;
        let mut data = self.inner.lock().unwrap();
        for (dst, src) in data[range].iter_mut().zip(buf) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase(&self, addr: u32, len: u32) -> Result<(), Error> {
        let range = self.range(addr, len as usize)?;
        self.spend()?;
        self.inner.lock().unwrap()[range].fill(0xFF);
        Ok(())
    }
}

pub fn small_blocks(block_max_data: usize) -> Config {
    Config {
        block_max_data,
        ..Config::default()
    }
}

pub fn write_file(fs: &mut FileSystem<RamFlash>, path: &str, data: &[u8]) -> Result<(), Error> {
    let mut file = fs.open(path, OpenFlag::Write | OpenFlag::Truncate)?;
    fs.write(&mut file, data)?;
    fs.close(file)
}

pub fn append_file(fs: &mut FileSystem<RamFlash>, path: &str, data: &[u8]) -> Result<(), Error> {
    let mut file = fs.open(path, OpenFlag::Write | OpenFlag::Append)?;
    fs.write(&mut file, data)?;
    fs.close(file)
}

pub fn read_file(fs: &mut FileSystem<RamFlash>, path: &str) -> Result<Vec<u8>, Error> {
    let mut file = fs.open(path, BitFlags::from(OpenFlag::Read))?;
    let mut out = Vec::new();
    let mut buf = [0u8; 37];
    loop {
        let n = fs.read(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.close(file)?;
    Ok(out)
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
