//! The fixed 40-byte file header: magic, version, the two free/meta roots, and
//! a reserved expansion area.

use crate::block::HEADER_SIZE;
use crate::checksum::{fold_checksum, ChecksumItem};
use crate::error::RavrfError;
use crate::Rref;

pub const MAGIC: &[u8; 9] = b"/~ravrf~/";
pub const CURRENT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    pub meta_root: Rref,
    pub free_root: Rref,
}

impl FileHeader {
    pub fn fresh() -> Self {
        Self {
            version: CURRENT_VERSION,
            meta_root: 0,
            free_root: 0,
        }
    }

    fn checksum(&self) -> u16 {
        fold_checksum(&[
            ChecksumItem::Int(self.version as u32),
            ChecksumItem::Int(self.meta_root),
            ChecksumItem::Int(self.free_root),
        ])
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..9].copy_from_slice(MAGIC);
        out[9] = self.version;
        out[10..14].copy_from_slice(&self.meta_root.to_be_bytes());
        out[14..18].copy_from_slice(&self.free_root.to_be_bytes());
        out[18..20].copy_from_slice(&self.checksum().to_be_bytes());
        // bytes 20..40 stay zero: reserved expansion area.
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RavrfError> {
        if bytes.len() != HEADER_SIZE as usize {
            return Err(RavrfError::BadHeader(format!(
                "expected {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if &bytes[0..9] != MAGIC {
            return Err(RavrfError::BadHeader("magic mismatch".to_string()));
        }
        let version = bytes[9];
        let meta_root = u32::from_be_bytes(bytes[10..14].try_into().unwrap());
        let free_root = u32::from_be_bytes(bytes[14..18].try_into().unwrap());
        let checksum = u16::from_be_bytes(bytes[18..20].try_into().unwrap());

        let header = Self {
            version,
            meta_root,
            free_root,
        };

        let all_zero = checksum == 0 && meta_root == 0 && free_root == 0;
        if !all_zero && checksum != header.checksum() {
            log::warn!(
                "file header checksum mismatch: stored={checksum:#06x}, computed={:#06x}",
                header.checksum()
            );
            return Err(RavrfError::BadHeader("checksum mismatch".to_string()));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_round_trips() {
        let h = FileHeader::fresh();
        let bytes = h.encode();
        let h2 = FileHeader::decode(&bytes).unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn non_trivial_header_round_trips() {
        let h = FileHeader {
            version: 1,
            meta_root: 40,
            free_root: 9001,
        };
        let bytes = h.encode();
        let h2 = FileHeader::decode(&bytes).unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = FileHeader::fresh().encode();
        bytes[0] = b'X';
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(RavrfError::BadHeader(_))
        ));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let bytes = [0u8; 10];
        assert!(FileHeader::decode(&bytes).is_err());
    }

    #[test]
    fn reserved_bytes_are_zeroed() {
        let bytes = FileHeader::fresh().encode();
        assert!(bytes[20..40].iter().all(|&b| b == 0));
    }

    #[test]
    fn tampered_checksum_on_nonzero_roots_is_rejected() {
        let h = FileHeader {
            version: 1,
            meta_root: 1,
            free_root: 0,
        };
        let mut bytes = h.encode();
        bytes[18] ^= 0xFF;
        assert!(FileHeader::decode(&bytes).is_err());
    }
}
