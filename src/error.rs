use thiserror::Error;

/// Errors produced while decoding an NTFS volume.
///
/// Lookups surface these to the caller; iterators never fail wholesale —
/// a bad record is skipped (or replaced by a sentinel path component) and
/// iteration continues.
#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid boot sector: {0}")]
    BootInvalid(String),

    #[error("Fixup mismatch in record at offset {offset:#x}")]
    FixupMismatch { offset: u64 },

    #[error("Short read at offset {offset:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("End of file")]
    EndOfFile,

    #[error("Attribute not found")]
    AttributeNotFound,

    #[error("Stream not found")]
    StreamNotFound,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid compressed data: {0}")]
    InvalidCompressed(String),

    #[error("Directory loop detected at MFT entry {0}")]
    LoopDetected(u64),

    #[error("Directory too deep")]
    DirTooDeep,

    #[error("Parent MFT entry {entry} has sequence {actual}, need {required}")]
    InvalidParent {
        entry: u64,
        actual: u16,
        required: u16,
    },

    #[error("Name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Runlist overflow")]
    RunlistOverflow,

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, NtfsError>;
