use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Bad area layout or mount configuration.
    ConfigError,
    /// The flash driver reported a failure.
    IoError,
    /// A record failed its CRC or bounds checks.
    Corrupt,
    OutOfSpace,
    /// The RAM index is at capacity.
    NoMemory,
    NotFound,
    AlreadyExists,
    NameTooLong,
    InvalidFileName,
    InvalidPath,
    InvalidOffset,
    NotDirectory,
    NotFile,
    DirectoryNotEmpty,
    NotPermitted,
    /// No area carries a valid area header.
    FilesystemNotFormatted,
    /// An id space ran out; wraparound is not supported.
    IdExhausted,
}

impl FsError {
    /// POSIX-like status code for the file operation surface.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::ConfigError => 22,   // EINVAL
            FsError::IoError => 5,        // EIO
            FsError::Corrupt => 117,      // EUCLEAN
            FsError::OutOfSpace => 28,    // ENOSPC
            FsError::NoMemory => 12,      // ENOMEM
            FsError::NotFound => 2,       // ENOENT
            FsError::AlreadyExists => 17, // EEXIST
            FsError::NameTooLong => 36,   // ENAMETOOLONG
            FsError::InvalidFileName | FsError::InvalidPath | FsError::InvalidOffset => 22,
            FsError::NotDirectory => 20,      // ENOTDIR
            FsError::NotFile => 21,           // EISDIR
            FsError::DirectoryNotEmpty => 39, // ENOTEMPTY
            FsError::NotPermitted => 1,       // EPERM
            FsError::FilesystemNotFormatted => 19, // ENODEV
            FsError::IdExhausted => 28,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::ConfigError => "invalid area layout or configuration",
            FsError::IoError => "flash driver error",
            FsError::Corrupt => "corrupt object",
            FsError::OutOfSpace => "out of flash space",
            FsError::NoMemory => "ram index full",
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "file exists",
            FsError::NameTooLong => "file name too long",
            FsError::InvalidFileName => "invalid file name",
            FsError::InvalidPath => "invalid path",
            FsError::InvalidOffset => "offset out of range",
            FsError::NotDirectory => "not a directory",
            FsError::NotFile => "is a directory",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::NotPermitted => "operation not permitted by access mode",
            FsError::FilesystemNotFormatted => "no formatted file system found",
            FsError::IdExhausted => "object id space exhausted",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;
