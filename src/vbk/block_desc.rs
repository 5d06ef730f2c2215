//! BlockDescriptor — строка датастора: контент-дайджест -> физическое
//! расположение, компрессия, размеры, keyset.
//!
//! Раскладка (0x3c, packed, LE): location u8, usageCnt u32, offset u64,
//! allocSize u32, dedup u8, digest 16, compType u8, unused u8, compSize u32,
//! srcSize u32, keysetID 16.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fmt;

use crate::consts::BLOCK_DESC_SIZE;
use crate::vbk::digest::Digest;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockLocation {
    Normal = 0,
    Sparse = 1,
    Reserved = 2,
    Archived = 3,
    BlockInBlob = 4,
    BlockInBlobReserved = 5,
}

impl BlockLocation {
    pub fn from_u8(v: u8) -> Option<BlockLocation> {
        Some(match v {
            0 => BlockLocation::Normal,
            1 => BlockLocation::Sparse,
            2 => BlockLocation::Reserved,
            3 => BlockLocation::Archived,
            4 => BlockLocation::BlockInBlob,
            5 => BlockLocation::BlockInBlobReserved,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompType {
    None,
    Rle,
    ZlibHi,
    ZlibLo,
    Lz4,
    Zstd3,
    Zstd9,
}

impl CompType {
    pub fn from_u8(v: u8) -> Option<CompType> {
        Some(match v {
            0xff => CompType::None,
            2 => CompType::Rle,
            3 => CompType::ZlibHi,
            4 => CompType::ZlibLo,
            7 => CompType::Lz4,
            8 => CompType::Zstd3,
            9 => CompType::Zstd9,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            CompType::None => 0xff,
            CompType::Rle => 2,
            CompType::ZlibHi => 3,
            CompType::ZlibLo => 4,
            CompType::Lz4 => 7,
            CompType::Zstd3 => 8,
            CompType::Zstd9 => 9,
        }
    }

    /// Имя в carved-CSV; zlib-варианты там не различаются.
    pub fn csv_name(self) -> &'static str {
        match self {
            CompType::Lz4 => "LZ4",
            CompType::ZlibHi | CompType::ZlibLo => "ZLIB",
            _ => "NONE",
        }
    }

    pub fn from_csv_name(s: &str) -> Option<CompType> {
        Some(match s {
            "LZ4" => CompType::Lz4,
            "ZLIB" => CompType::ZlibLo,
            "NONE" => CompType::None,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub location_raw: u8,
    pub usage_cnt: u32,
    pub offset: u64,
    pub alloc_size: u32,
    pub dedup: u8,
    pub digest: Digest,
    pub comp_type_raw: u8,
    pub unused: u8,
    pub comp_size: u32,
    pub src_size: u32,
    pub keyset_id: Digest,
}

impl Default for BlockDescriptor {
    fn default() -> Self {
        BlockDescriptor {
            location_raw: 0,
            usage_cnt: 0,
            offset: 0,
            alloc_size: 0,
            dedup: 0,
            digest: Digest::ZERO,
            comp_type_raw: 0,
            unused: 0,
            comp_size: 0,
            src_size: 0,
            keyset_id: Digest::ZERO,
        }
    }
}

impl BlockDescriptor {
    pub const SIZE: usize = BLOCK_DESC_SIZE;

    pub fn parse(buf: &[u8]) -> Option<BlockDescriptor> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(BlockDescriptor {
            location_raw: buf[0],
            usage_cnt: LittleEndian::read_u32(&buf[1..5]),
            offset: LittleEndian::read_u64(&buf[5..13]),
            alloc_size: LittleEndian::read_u32(&buf[13..17]),
            dedup: buf[17],
            digest: Digest::from_bytes(&buf[18..34]),
            comp_type_raw: buf[34],
            unused: buf[35],
            comp_size: LittleEndian::read_u32(&buf[36..40]),
            src_size: LittleEndian::read_u32(&buf[40..44]),
            keyset_id: Digest::from_bytes(&buf[44..60]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.location_raw;
        LittleEndian::write_u32(&mut buf[1..5], self.usage_cnt);
        LittleEndian::write_u64(&mut buf[5..13], self.offset);
        LittleEndian::write_u32(&mut buf[13..17], self.alloc_size);
        buf[17] = self.dedup;
        buf[18..34].copy_from_slice(&self.digest.to_bytes());
        buf[34] = self.comp_type_raw;
        buf[35] = self.unused;
        LittleEndian::write_u32(&mut buf[36..40], self.comp_size);
        LittleEndian::write_u32(&mut buf[40..44], self.src_size);
        buf[44..60].copy_from_slice(&self.keyset_id.to_bytes());
    }

    pub fn location(&self) -> Option<BlockLocation> {
        BlockLocation::from_u8(self.location_raw)
    }

    pub fn comp_type(&self) -> Option<CompType> {
        CompType::from_u8(self.comp_type_raw)
    }

    /// Запись целиком из нулей или из 0xff — пустой слот таблицы.
    pub fn empty_raw(buf: &[u8]) -> bool {
        buf[..Self::SIZE].iter().all(|&b| b == 0) || buf[..Self::SIZE].iter().all(|&b| b == 0xff)
    }

    pub fn valid(&self) -> bool {
        self.location() == Some(BlockLocation::BlockInBlob)
            && self.alloc_size != 0
            && self.alloc_size >= self.comp_size
            && ((!self.digest.is_zero()
                && self.comp_size != 0
                && self.src_size != 0
                && self.comp_type().is_some())
                || (self.digest.is_zero()
                    && self.comp_size == 0
                    && self.src_size == 0
                    && self.comp_type_raw == 0
                    && self.dedup == 0))
    }
}

impl fmt::Display for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<BlockDescriptor location={:x}, usageCnt={:x}, offset={:x}, allocSize={:x}, dedup={:x}, digest={}, compType={:x}, compSize={:x}, srcSize={:x}",
            self.location_raw,
            self.usage_cnt,
            self.offset,
            self.alloc_size,
            self.dedup,
            self.digest,
            self.comp_type_raw,
            self.comp_size,
            self.src_size
        )?;
        if !self.keyset_id.is_zero() {
            write!(f, " keysetID={}", self.keyset_id)?;
        }
        write!(f, ">")
    }
}

/// Карта датастора: дайджест -> дескриптор.
pub type BlockDescriptors = HashMap<Digest, BlockDescriptor>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::BLOCK_SIZE;

    pub fn sample_bd(digest: u128, offset: u64) -> BlockDescriptor {
        BlockDescriptor {
            location_raw: BlockLocation::BlockInBlob as u8,
            usage_cnt: 1,
            offset,
            alloc_size: 0x1000,
            dedup: 1,
            digest: Digest(digest),
            comp_type_raw: CompType::Lz4.to_u8(),
            unused: 0,
            comp_size: 0x900,
            src_size: BLOCK_SIZE as u32,
            keyset_id: Digest::ZERO,
        }
    }

    #[test]
    fn roundtrip() {
        let bd = sample_bd(0x77, 0x123456);
        let mut buf = [0u8; BlockDescriptor::SIZE];
        bd.write_to(&mut buf);
        let back = BlockDescriptor::parse(&buf).unwrap();
        assert_eq!(back, bd);
        assert!(back.valid());
        assert_eq!(back.comp_type(), Some(CompType::Lz4));
    }

    #[test]
    fn empty_detection() {
        assert!(BlockDescriptor::empty_raw(&[0u8; BlockDescriptor::SIZE]));
        assert!(BlockDescriptor::empty_raw(&[0xffu8; BlockDescriptor::SIZE]));
        let mut buf = [0u8; BlockDescriptor::SIZE];
        buf[5] = 1;
        assert!(!BlockDescriptor::empty_raw(&buf));
    }

    #[test]
    fn validity_rules() {
        // alloc < comp — мусор
        let mut bd = sample_bd(0x1, 0);
        bd.alloc_size = bd.comp_size - 1;
        assert!(!bd.valid());

        // location не block_in_blob
        let mut bd = sample_bd(0x1, 0);
        bd.location_raw = BlockLocation::Normal as u8;
        assert!(!bd.valid());

        // нулевой дайджест допустим только с полностью нулевыми размерами
        let mut bd = sample_bd(0, 0);
        bd.digest = Digest::ZERO;
        assert!(!bd.valid());
        bd.comp_size = 0;
        bd.src_size = 0;
        bd.comp_type_raw = 0;
        bd.dedup = 0;
        assert!(bd.valid());

        // неизвестный compType
        let mut bd = sample_bd(0x1, 0);
        bd.comp_type_raw = 0x55;
        assert!(!bd.valid());
    }

    #[test]
    fn comp_type_csv_names() {
        assert_eq!(CompType::Lz4.csv_name(), "LZ4");
        assert_eq!(CompType::ZlibHi.csv_name(), "ZLIB");
        assert_eq!(CompType::from_csv_name("ZLIB"), Some(CompType::ZlibLo));
        assert_eq!(CompType::from_csv_name("NONE"), Some(CompType::None));
        assert_eq!(CompType::from_csv_name("???"), None);
    }
}
