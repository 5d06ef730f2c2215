//! SMetaTableDescriptor — 0x18-байтный дескриптор таблицы блоков файла.
//!
//! Три формы:
//!   sparse:  nBlocks==0, ppi==-1:-1, block_size==BLOCK_SIZE (ёмкость 0x440)
//!   last:    nBlocks==1, ppi валиден и не 0:0, block_size < BLOCK_SIZE
//!   regular: ppi валиден и не 0:0, block_size==BLOCK_SIZE, 0<nBlocks<=0x440

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::{BLOCK_SIZE, META_TABLE_DESC_SIZE};
use crate::vbk::ppi::PhysPageId;

/// Максимум блоков, адресуемых одним дескриптором.
pub const MAX_BLOCKS: usize = 0x440;
/// Ёмкость sparse-дескриптора в байтах.
pub const CAPACITY: u64 = (MAX_BLOCKS * BLOCK_SIZE) as u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SMetaTableDescriptor {
    pub ppi: PhysPageId,
    pub block_size: i64,
    pub n_blocks: i64,
}

impl SMetaTableDescriptor {
    pub const SIZE: usize = META_TABLE_DESC_SIZE;

    pub fn parse(buf: &[u8]) -> Option<SMetaTableDescriptor> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(SMetaTableDescriptor {
            ppi: PhysPageId::parse(&buf[0..8]),
            block_size: LittleEndian::read_i64(&buf[8..16]),
            n_blocks: LittleEndian::read_i64(&buf[16..24]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        self.ppi.write_to(&mut buf[0..8]);
        LittleEndian::write_i64(&mut buf[8..16], self.block_size);
        LittleEndian::write_i64(&mut buf[16..24], self.n_blocks);
    }

    pub fn sparse() -> SMetaTableDescriptor {
        SMetaTableDescriptor {
            ppi: PhysPageId::new(-1, -1),
            block_size: BLOCK_SIZE as i64,
            n_blocks: 0,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.n_blocks == 0 && self.ppi.empty() && self.block_size == BLOCK_SIZE as i64
    }

    pub fn empty(&self) -> bool {
        self.ppi.zero() && self.block_size == 0 && self.n_blocks == 0
    }

    /// Валидация подстроена под стандартный блок 1 MiB.
    pub fn valid(&self) -> bool {
        match self.n_blocks {
            0 => self.is_sparse(),
            1 => {
                self.ppi.valid()
                    && !self.ppi.zero()
                    && self.block_size > 0
                    && self.block_size < BLOCK_SIZE as i64
            }
            _ => {
                self.ppi.valid()
                    && !self.ppi.zero()
                    && self.block_size == BLOCK_SIZE as i64
                    && self.n_blocks > 0
                    && self.n_blocks <= MAX_BLOCKS as i64
            }
        }
    }

    /// Логический размер, который дескриптор вносит в файл.
    pub fn size(&self) -> u64 {
        if self.is_sparse() {
            CAPACITY
        } else {
            (self.block_size * self.n_blocks) as u64
        }
    }
}

impl fmt::Display for SMetaTableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SMetaTableDescriptor ppi={}, block_size={:x}, nBlocks={:x}>",
            self.ppi, self.block_size, self.n_blocks
        )
    }
}
