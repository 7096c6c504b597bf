pub mod reader;
pub mod synthetic;

pub use reader::TraceReader;
pub use synthetic::SyntheticTrace;

use serde::{Deserialize, Serialize};

/// Kind of a traced memory access.
///
/// The numeric values match the last field of a textual trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
    PartialWrite = 2,
    Writeback = 3,
    ReadForWrite = 4,
    FakeRead = 5,
    Prefetch = 6,
    Clean = 7,
    AggressiveWriteback = 8,
}

impl TryFrom<u32> for AccessKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        match value {
            0 => Ok(AccessKind::Read),
            1 => Ok(AccessKind::Write),
            2 => Ok(AccessKind::PartialWrite),
            3 => Ok(AccessKind::Writeback),
            4 => Ok(AccessKind::ReadForWrite),
            5 => Ok(AccessKind::FakeRead),
            6 => Ok(AccessKind::Prefetch),
            7 => Ok(AccessKind::Clean),
            8 => Ok(AccessKind::AggressiveWriteback),
            other => Err(Error::UnknownAccessKind(other)),
        }
    }
}

/// A single memory reference read from a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReference {
    /// Instruction count at which the reference was recorded.
    pub icount: u64,
    /// Instruction pointer of the access.
    pub ip: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
    pub size: u32,
    pub kind: AccessKind,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed trace record `{line}`")]
    MalformedRecord { line: String },

    #[error("unknown access kind {0}")]
    UnknownAccessKind(u32),
}
