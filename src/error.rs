use thiserror::Error;

use crate::block::BlockKind;
use crate::Rref;

/// Closed error taxonomy for the store engine. Never matched on by string.
#[derive(Error, Debug)]
pub enum RavrfError {
    #[error("operation invoked on a closed store")]
    NotOpen,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("block at {rref} has kind {found:?}, expected {expected:?}")]
    KindMismatch {
        rref: Rref,
        expected: BlockKind,
        found: BlockKind,
    },

    #[error("checksum mismatch at {where_}")]
    BadChecksum { where_: String },

    #[error("bad header: {0}")]
    BadHeader(String),

    #[error("bad path: {0}")]
    BadPath(String),

    #[error("file not found")]
    NotFound,

    #[error("file already exists")]
    AlreadyExists,

    #[error("path is not a regular file")]
    NotAFile,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
}
