//! Fixed-layout head/end descriptors that frame every record in the file.

use crate::checksum::{fold_checksum, ChecksumItem};
use crate::error::RavrfError;
use crate::Rref;

/// Size in bytes of a head descriptor on disk.
pub const HEAD_SIZE: usize = 15;
/// Size in bytes of an end descriptor on disk.
pub const END_SIZE: usize = 5;
/// Size in bytes of the file header.
pub const HEADER_SIZE: u64 = 40;
/// Bytes of framing overhead (head + end) surrounding every record's payload.
pub const OVERHEAD: u32 = (HEAD_SIZE + END_SIZE) as u32;
/// Smallest `record_size` a record may have. A split only ever produces a
/// remainder larger than this (see `update_free_list` in the store engine).
pub const MIN_RECORD_SIZE: u32 = 0;

/// The kind tag stored in both the head and end descriptor of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Available = 0x41,
    Data = 0x44,
    Meta = 0x4D,
}

impl BlockKind {
    pub fn from_u8(b: u8) -> Result<Self, RavrfError> {
        match b {
            0x41 => Ok(BlockKind::Available),
            0x44 => Ok(BlockKind::Data),
            0x4D => Ok(BlockKind::Meta),
            other => Err(RavrfError::BadHeader(format!(
                "unrecognized block kind byte {other:#x}"
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The 15-byte descriptor preceding every record's payload.
///
/// `field_a`/`field_b` carry different meanings depending on `kind`: for
/// AVAILABLE they are `prev_free`/`next_free`; for DATA/META they are
/// `data_size`/`open_size`. Accessors below name them accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadDescriptor {
    pub kind: BlockKind,
    pub record_size: u32,
    pub field_a: u32,
    pub field_b: u32,
}

impl HeadDescriptor {
    pub fn new_available(record_size: u32, prev_free: Rref, next_free: Rref) -> Self {
        Self {
            kind: BlockKind::Available,
            record_size,
            field_a: prev_free,
            field_b: next_free,
        }
    }

    pub fn new_data(record_size: u32, data_size: u32, open_size: u32) -> Self {
        Self {
            kind: BlockKind::Data,
            record_size,
            field_a: data_size,
            field_b: open_size,
        }
    }

    pub fn new_meta(record_size: u32, data_size: u32, open_size: u32) -> Self {
        Self {
            kind: BlockKind::Meta,
            record_size,
            field_a: data_size,
            field_b: open_size,
        }
    }

    pub fn prev_free(&self) -> Rref {
        debug_assert_eq!(self.kind, BlockKind::Available);
        self.field_a
    }

    pub fn next_free(&self) -> Rref {
        debug_assert_eq!(self.kind, BlockKind::Available);
        self.field_b
    }

    pub fn data_size(&self) -> u32 {
        debug_assert_ne!(self.kind, BlockKind::Available);
        self.field_a
    }

    pub fn open_size(&self) -> u32 {
        debug_assert_ne!(self.kind, BlockKind::Available);
        self.field_b
    }

    fn checksum(&self) -> u16 {
        fold_checksum(&[
            ChecksumItem::Int(self.kind.as_u8() as u32),
            ChecksumItem::Int(self.record_size),
            ChecksumItem::Int(self.field_a),
            ChecksumItem::Int(self.field_b),
        ])
    }

    pub fn encode(&self) -> [u8; HEAD_SIZE] {
        let mut out = [0u8; HEAD_SIZE];
        out[0] = self.kind.as_u8();
        out[1..5].copy_from_slice(&self.record_size.to_be_bytes());
        out[5..9].copy_from_slice(&self.field_a.to_be_bytes());
        out[9..13].copy_from_slice(&self.field_b.to_be_bytes());
        out[13..15].copy_from_slice(&self.checksum().to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RavrfError> {
        if bytes.len() != HEAD_SIZE {
            return Err(RavrfError::ShortRead {
                expected: HEAD_SIZE,
                got: bytes.len(),
            });
        }
        let kind = BlockKind::from_u8(bytes[0])?;
        let record_size = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let field_a = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        let field_b = u32::from_be_bytes(bytes[9..13].try_into().unwrap());
        let checksum = u16::from_be_bytes(bytes[13..15].try_into().unwrap());

        let head = Self {
            kind,
            record_size,
            field_a,
            field_b,
        };
        if checksum != 0 {
            let expected = head.checksum();
            if checksum != expected {
                log::warn!(
                    "head descriptor checksum mismatch: stored={checksum:#06x}, computed={expected:#06x}"
                );
                return Err(RavrfError::BadChecksum {
                    where_: "head descriptor".to_string(),
                });
            }
        }
        Ok(head)
    }
}

/// The 5-byte descriptor terminating every record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndDescriptor {
    pub record_size: u32,
    pub kind: BlockKind,
}

impl EndDescriptor {
    pub fn new(record_size: u32, kind: BlockKind) -> Self {
        Self { record_size, kind }
    }

    pub fn encode(&self) -> [u8; END_SIZE] {
        let mut out = [0u8; END_SIZE];
        out[0..4].copy_from_slice(&self.record_size.to_be_bytes());
        out[4] = self.kind.as_u8();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RavrfError> {
        if bytes.len() != END_SIZE {
            return Err(RavrfError::ShortRead {
                expected: END_SIZE,
                got: bytes.len(),
            });
        }
        let record_size = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let kind = BlockKind::from_u8(bytes[4])?;
        Ok(Self { record_size, kind })
    }
}
