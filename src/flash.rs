use crate::error::FsError;

/// A contiguous, independently erasable region of the flash part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaDesc {
    /// Absolute flash address of the first byte.
    pub offset: u32,
    pub length: u32,
}

impl AreaDesc {
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }
}

/// Raw flash driver. Erased bytes read back as 0xFF; writes only ever
/// program erased bytes, there is no read-modify-write.
pub trait FlashDevice: Send + Sync {
    /// Reads `buf.len()` bytes starting at absolute address `addr`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FsError>;

    /// Programs `buf` at absolute address `addr`.
    /// Each call either commits fully or fails; a torn write is caught by
    /// CRC validation above this layer.
    fn write(&self, addr: u32, buf: &[u8]) -> Result<(), FsError>;

    /// Erases `len` bytes starting at `addr`, which always describe one whole area.
    fn erase(&self, addr: u32, len: u32) -> Result<(), FsError>;
}
