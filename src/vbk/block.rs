//! Поблочные дескрипторы логических файлов и заголовок LZ4-блока.
//!
//! SFibBlockDescriptorV7 (0x2e): size u32, type u8, digest 16, id u64,
//! flags u8, keyset_id 16.
//! SPatchBlockDescriptorV7 (0x35): size u32, type u8, digest 16, id i64,
//! block_idx i64, digest2 16. Абсолютное смещение цели = block_idx * BLOCK_SIZE.
//!
//! Оба вида складываются в общий VBlockDesc, который потребляет extract:
//! у fib-блока vib_offset всегда 0, у патч-блока это block_idx.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::{BLOCK_SIZE, FIB_BLOCK_DESC_SIZE, LZ_HDR_SIZE, LZ_START_MAGIC, PATCH_BLOCK_DESC_SIZE};
use crate::vbk::digest::Digest;

/// Унифицированный вид блока для extract-цикла.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VBlockDesc {
    pub size: u32,
    pub block_type: u8,
    pub digest: Digest,
    pub id: u64,
    /// Для инкрементов: индекс целевого блока (умножить на BLOCK_SIZE).
    pub vib_offset: u64,
    pub keyset_id: Digest,
}

impl VBlockDesc {
    pub fn is_sparse(&self) -> bool {
        *self == VBlockDesc::default()
    }

    pub fn is_empty(&self) -> bool {
        self.digest.is_empty_block()
    }

    pub fn is_patch(&self) -> bool {
        self.size == BLOCK_SIZE as u32 && self.vib_offset != 0
    }
}

impl fmt::Display for VBlockDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sparse() {
            return write!(f, "<VBlockDesc zero>");
        }
        write!(
            f,
            "<VBlockDesc size={:x}, type={:x}, hash={}, id={:x}, vib_offset={:x}>",
            self.size, self.block_type, self.digest, self.id, self.vib_offset
        )
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SFibBlockDescriptorV7 {
    pub size: u32,
    pub block_type: u8,
    pub digest: Digest,
    pub id: u64,
    pub flags: u8,
    pub keyset_id: Digest,
}

impl SFibBlockDescriptorV7 {
    pub const SIZE: usize = FIB_BLOCK_DESC_SIZE;

    pub fn parse(buf: &[u8]) -> Option<SFibBlockDescriptorV7> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(SFibBlockDescriptorV7 {
            size: LittleEndian::read_u32(&buf[0..4]),
            block_type: buf[4],
            digest: Digest::from_bytes(&buf[5..21]),
            id: LittleEndian::read_u64(&buf[0x15..0x1d]),
            flags: buf[0x1d],
            keyset_id: Digest::from_bytes(&buf[0x1e..0x2e]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.size);
        buf[4] = self.block_type;
        buf[5..21].copy_from_slice(&self.digest.to_bytes());
        LittleEndian::write_u64(&mut buf[0x15..0x1d], self.id);
        buf[0x1d] = self.flags;
        buf[0x1e..0x2e].copy_from_slice(&self.keyset_id.to_bytes());
    }

    pub fn valid(&self) -> bool {
        self.size > 0
            && self.size <= BLOCK_SIZE as u32
            && (self.block_type == 0 || self.block_type == 1)
            && !self.digest.is_zero()
    }

    /// Для deep-скана: меньше ложных срабатываний.
    pub fn valid_not_encrypted(&self) -> bool {
        self.valid() && self.keyset_id.is_zero()
    }

    pub fn to_vblock(&self) -> VBlockDesc {
        VBlockDesc {
            size: self.size,
            block_type: self.block_type,
            digest: self.digest,
            id: self.id,
            vib_offset: 0,
            keyset_id: self.keyset_id,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SPatchBlockDescriptorV7 {
    pub size: u32,
    pub block_type: u8,
    pub digest: Digest,
    pub id: i64,
    pub block_idx: i64,
    pub digest2: Digest,
}

impl SPatchBlockDescriptorV7 {
    pub const SIZE: usize = PATCH_BLOCK_DESC_SIZE;

    pub fn parse(buf: &[u8]) -> Option<SPatchBlockDescriptorV7> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(SPatchBlockDescriptorV7 {
            size: LittleEndian::read_u32(&buf[0..4]),
            block_type: buf[4],
            digest: Digest::from_bytes(&buf[5..21]),
            id: LittleEndian::read_i64(&buf[0x15..0x1d]),
            block_idx: LittleEndian::read_i64(&buf[0x1d..0x25]),
            digest2: Digest::from_bytes(&buf[0x25..0x35]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.size);
        buf[4] = self.block_type;
        buf[5..21].copy_from_slice(&self.digest.to_bytes());
        LittleEndian::write_i64(&mut buf[0x15..0x1d], self.id);
        LittleEndian::write_i64(&mut buf[0x1d..0x25], self.block_idx);
        buf[0x25..0x35].copy_from_slice(&self.digest2.to_bytes());
    }

    pub fn fib_offset(&self) -> u64 {
        self.block_idx as u64 * BLOCK_SIZE as u64
    }

    pub fn valid(&self) -> bool {
        self.size == BLOCK_SIZE as u32
            && self.block_type == 0
            && !self.digest.is_zero()
            && self.id >= 0
            && self.block_idx >= 0
            && self.digest2.is_zero()
    }

    pub fn to_vblock(&self) -> VBlockDesc {
        VBlockDesc {
            size: self.size,
            block_type: self.block_type,
            digest: self.digest,
            id: self.id as u64,
            vib_offset: self.block_idx as u64,
            keyset_id: Digest::ZERO,
        }
    }
}

/// Заголовок LZ4-блока в контейнере: magic, crc распакованных данных,
/// размер распакованных данных.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LzHdr {
    pub magic: u32,
    pub crc: u32,
    pub src_size: u32,
}

impl LzHdr {
    pub const SIZE: usize = LZ_HDR_SIZE;

    pub fn parse(buf: &[u8]) -> Option<LzHdr> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(LzHdr {
            magic: LittleEndian::read_u32(&buf[0..4]),
            crc: LittleEndian::read_u32(&buf[4..8]),
            src_size: LittleEndian::read_u32(&buf[8..12]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.crc);
        LittleEndian::write_u32(&mut buf[8..12], self.src_size);
    }

    pub fn valid(&self) -> bool {
        self.magic == LZ_START_MAGIC && self.src_size > 0 && self.src_size <= BLOCK_SIZE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::EMPTY_BLOCK_DIGEST;

    #[test]
    fn fib_roundtrip() {
        let d = SFibBlockDescriptorV7 {
            size: 0x4de0,
            block_type: 1,
            digest: Digest(0x1234_5678),
            id: 7,
            flags: 0,
            keyset_id: Digest::ZERO,
        };
        let mut buf = [0u8; SFibBlockDescriptorV7::SIZE];
        d.write_to(&mut buf);
        let back = SFibBlockDescriptorV7::parse(&buf).unwrap();
        assert!(back.valid());
        assert!(back.valid_not_encrypted());
        assert_eq!(back.digest, d.digest);
        assert_eq!(back.to_vblock().vib_offset, 0);
    }

    #[test]
    fn fib_validity_bounds() {
        let mut d = SFibBlockDescriptorV7 {
            size: BLOCK_SIZE as u32,
            block_type: 0,
            digest: Digest(1),
            id: 0,
            flags: 0,
            keyset_id: Digest(9),
        };
        assert!(d.valid());
        assert!(!d.valid_not_encrypted()); // keyset => не для deep-скана

        d.size = BLOCK_SIZE as u32 + 1;
        assert!(!d.valid());
        d.size = 1;
        d.block_type = 2;
        assert!(!d.valid());
        d.block_type = 0;
        d.digest = Digest::ZERO;
        assert!(!d.valid());
    }

    #[test]
    fn patch_roundtrip_and_offset() {
        let d = SPatchBlockDescriptorV7 {
            size: BLOCK_SIZE as u32,
            block_type: 0,
            digest: Digest(0xabcd),
            id: 3,
            block_idx: 0x11,
            digest2: Digest::ZERO,
        };
        let mut buf = [0u8; SPatchBlockDescriptorV7::SIZE];
        d.write_to(&mut buf);
        let back = SPatchBlockDescriptorV7::parse(&buf).unwrap();
        assert!(back.valid());
        assert_eq!(back.fib_offset(), 0x11 * BLOCK_SIZE as u64);

        let vb = back.to_vblock();
        assert!(vb.is_patch());
        assert_eq!(vb.vib_offset, 0x11);
    }

    #[test]
    fn patch_requires_full_block_and_zero_digest2() {
        let mut d = SPatchBlockDescriptorV7 {
            size: BLOCK_SIZE as u32,
            block_type: 0,
            digest: Digest(1),
            id: 0,
            block_idx: 0,
            digest2: Digest::ZERO,
        };
        assert!(d.valid());
        d.digest2 = Digest(5);
        assert!(!d.valid());
        d.digest2 = Digest::ZERO;
        d.size = 100;
        assert!(!d.valid());
    }

    #[test]
    fn sparse_and_empty_blocks() {
        let sparse = VBlockDesc::default();
        assert!(sparse.is_sparse());

        let empty = VBlockDesc {
            size: BLOCK_SIZE as u32,
            digest: Digest(EMPTY_BLOCK_DIGEST),
            ..VBlockDesc::default()
        };
        assert!(!empty.is_sparse());
        assert!(empty.is_empty());
    }

    #[test]
    fn lz_hdr_rules() {
        let hdr = LzHdr {
            magic: LZ_START_MAGIC,
            crc: 0x1111,
            src_size: 0x1000,
        };
        let mut buf = [0u8; LzHdr::SIZE];
        hdr.write_to(&mut buf);
        let back = LzHdr::parse(&buf).unwrap();
        assert!(back.valid());

        let bad = LzHdr {
            magic: 0x12345678,
            ..hdr
        };
        assert!(!bad.valid());
        let bad = LzHdr {
            src_size: BLOCK_SIZE as u32 + 1,
            ..hdr
        };
        assert!(!bad.valid());
    }
}
