//! CSlot — дескриптор снапшота + массив BankInfo.
//!
//! Байтовая раскладка (packed, LE):
//!   0x00 crc u32
//!   0x04 has_snapshot u32
//!   0x08 SnapshotDescriptor (108 байт)
//!   0x74 max_banks u32
//!   0x78 allocated_banks u32
//!   0x7c BankInfo[max_banks], по 16 байт
//! Полный размер = 0x80 + 0x10*max_banks (фиксированная часть добита до 8).
//! CRC считается по байтам [4 .. size-4).

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::{BANK_INFO_SIZE, MAX_BANKS, SLOT_BANK_INFOS_OFF, SLOT_FIXED_SIZE};
use crate::util::vcrc32;
use crate::vbk::ppi::PhysPageId;

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct BankInfo {
    pub crc: u32,
    pub offset: i64,
    pub size: u32,
}

impl BankInfo {
    pub fn parse(buf: &[u8]) -> BankInfo {
        BankInfo {
            crc: LittleEndian::read_u32(&buf[0..4]),
            offset: LittleEndian::read_i64(&buf[4..12]),
            size: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.crc);
        LittleEndian::write_i64(&mut buf[4..12], self.offset);
        LittleEndian::write_u32(&mut buf[12..16], self.size);
    }
}

impl fmt::Display for BankInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<BankInfo crc={:08x}, offset={:12x}, size={:7x}>",
            self.crc, self.offset, self.size
        )
    }
}

/// Ключевые корни слота. f30/f38 не расшифрованы, но участвуют в CRC.
#[derive(Clone, Copy, Debug)]
pub struct ObjRefs {
    pub meta_root_dir_page: PhysPageId,
    pub children_num: u64,
    pub data_store_root_page: PhysPageId,
    pub blocks_count: u64,
    pub free_blocks_root: PhysPageId,
    pub dedup_root: PhysPageId,
    pub f30: PhysPageId,
    pub f38: PhysPageId,
    pub crypto_store_root_page: PhysPageId,
    pub archive_blob_store_page: PhysPageId,
}

impl Default for ObjRefs {
    fn default() -> Self {
        use crate::vbk::ppi::INVALID_PPI;
        ObjRefs {
            meta_root_dir_page: INVALID_PPI,
            children_num: 0,
            data_store_root_page: INVALID_PPI,
            blocks_count: 0,
            free_blocks_root: INVALID_PPI,
            dedup_root: INVALID_PPI,
            f30: INVALID_PPI,
            f38: INVALID_PPI,
            crypto_store_root_page: INVALID_PPI,
            archive_blob_store_page: INVALID_PPI,
        }
    }
}

impl ObjRefs {
    const SIZE: usize = 80;

    fn parse(buf: &[u8]) -> ObjRefs {
        ObjRefs {
            meta_root_dir_page: PhysPageId::parse(&buf[0..8]),
            children_num: LittleEndian::read_u64(&buf[8..16]),
            data_store_root_page: PhysPageId::parse(&buf[16..24]),
            blocks_count: LittleEndian::read_u64(&buf[24..32]),
            free_blocks_root: PhysPageId::parse(&buf[32..40]),
            dedup_root: PhysPageId::parse(&buf[40..48]),
            f30: PhysPageId::parse(&buf[48..56]),
            f38: PhysPageId::parse(&buf[56..64]),
            crypto_store_root_page: PhysPageId::parse(&buf[64..72]),
            archive_blob_store_page: PhysPageId::parse(&buf[72..80]),
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        self.meta_root_dir_page.write_to(&mut buf[0..8]);
        LittleEndian::write_u64(&mut buf[8..16], self.children_num);
        self.data_store_root_page.write_to(&mut buf[16..24]);
        LittleEndian::write_u64(&mut buf[24..32], self.blocks_count);
        self.free_blocks_root.write_to(&mut buf[32..40]);
        self.dedup_root.write_to(&mut buf[40..48]);
        self.f30.write_to(&mut buf[48..56]);
        self.f38.write_to(&mut buf[56..64]);
        self.crypto_store_root_page.write_to(&mut buf[64..72]);
        self.archive_blob_store_page.write_to(&mut buf[72..80]);
    }
}

impl fmt::Display for ObjRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjRefs ")?;
        if self.meta_root_dir_page.valid() {
            write!(f, "MetaRootDirPage={}, ", self.meta_root_dir_page)?;
        }
        write!(f, "children_num={:x}, ", self.children_num)?;
        if self.data_store_root_page.valid() {
            write!(f, "DataStoreRootPage={}, ", self.data_store_root_page)?;
        }
        write!(f, "BlocksCount={:x}", self.blocks_count)?;
        if self.dedup_root.valid() {
            write!(f, ", dedup_root={}", self.dedup_root)?;
        }
        if self.crypto_store_root_page.valid() {
            write!(f, ", CryptoStoreRootPage={}", self.crypto_store_root_page)?;
        }
        write!(f, ">")
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SnapshotDescriptor {
    pub version: u64,
    pub storage_eof: u64,
    pub n_banks: u32,
    pub obj_refs: ObjRefs,
    pub f64: u64,
}

impl SnapshotDescriptor {
    const SIZE: usize = 8 + 8 + 4 + ObjRefs::SIZE + 8;

    fn parse(buf: &[u8]) -> SnapshotDescriptor {
        SnapshotDescriptor {
            version: LittleEndian::read_u64(&buf[0..8]),
            storage_eof: LittleEndian::read_u64(&buf[8..16]),
            n_banks: LittleEndian::read_u32(&buf[16..20]),
            obj_refs: ObjRefs::parse(&buf[20..20 + ObjRefs::SIZE]),
            f64: LittleEndian::read_u64(&buf[100..108]),
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.version);
        LittleEndian::write_u64(&mut buf[8..16], self.storage_eof);
        LittleEndian::write_u32(&mut buf[16..20], self.n_banks);
        self.obj_refs.write_to(&mut buf[20..20 + ObjRefs::SIZE]);
        LittleEndian::write_u64(&mut buf[100..108], self.f64);
    }
}

impl Default for SnapshotDescriptor {
    fn default() -> Self {
        SnapshotDescriptor {
            version: 0,
            storage_eof: 0,
            n_banks: 0,
            obj_refs: ObjRefs::default(),
            f64: 0,
        }
    }
}

impl fmt::Display for SnapshotDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SnapshotDescriptor version={:x}, storage_eof={:x}, nBanks={:x}, objRefs={}>",
            self.version, self.storage_eof, self.n_banks, self.obj_refs
        )
    }
}

#[derive(Clone)]
pub struct CSlot {
    pub crc: u32,
    pub has_snapshot: u32,
    pub snapshot: SnapshotDescriptor,
    pub max_banks: u32,
    pub allocated_banks: u32,
    pub bank_infos: Vec<BankInfo>, // allocated_banks записей
}

impl CSlot {
    /// Минимум, который нужно прочитать, чтобы узнать size().
    pub const HEADER_SIZE: usize = SLOT_FIXED_SIZE;

    /// Парсит фиксированную часть; bank_infos заполняются позже,
    /// когда дочитан полный слот (`parse_bank_infos`).
    pub fn parse_header(buf: &[u8]) -> Option<CSlot> {
        if buf.len() < SLOT_FIXED_SIZE {
            return None;
        }
        Some(CSlot {
            crc: LittleEndian::read_u32(&buf[0..4]),
            has_snapshot: LittleEndian::read_u32(&buf[4..8]),
            snapshot: SnapshotDescriptor::parse(&buf[8..8 + SnapshotDescriptor::SIZE]),
            max_banks: LittleEndian::read_u32(&buf[0x74..0x78]),
            allocated_banks: LittleEndian::read_u32(&buf[0x78..0x7c]),
            bank_infos: Vec::new(),
        })
    }

    /// Парсит весь слот из полного буфера (>= size()).
    pub fn parse(buf: &[u8]) -> Option<CSlot> {
        let mut slot = Self::parse_header(buf)?;
        if !slot.valid_fast() || buf.len() < slot.size() {
            return None;
        }
        slot.parse_bank_infos(buf);
        Some(slot)
    }

    pub fn parse_bank_infos(&mut self, buf: &[u8]) {
        self.bank_infos.clear();
        for i in 0..self.allocated_banks as usize {
            let off = SLOT_BANK_INFOS_OFF + i * BANK_INFO_SIZE;
            if off + BANK_INFO_SIZE > buf.len() {
                break;
            }
            self.bank_infos
                .push(BankInfo::parse(&buf[off..off + BANK_INFO_SIZE]));
        }
    }

    pub fn size(&self) -> usize {
        SLOT_FIXED_SIZE + self.max_banks as usize * BANK_INFO_SIZE
    }

    pub fn valid_fast(&self) -> bool {
        self.crc != 0
            && self.has_snapshot == 1
            && self.max_banks > 0
            && self.max_banks <= MAX_BANKS
            && self.allocated_banks <= self.max_banks
    }

    /// CRC по полному образу слота: байты [4 .. size-4).
    pub fn valid_crc(&self, raw: &[u8]) -> bool {
        let size = self.size();
        if raw.len() < size {
            return false;
        }
        vcrc32(0, &raw[4..size - 4]) == self.crc
    }

    /// Сериализация полного слота (для синтеза slot-файла сканером)
    /// с пересчётом CRC. bank_infos с индексом >= allocated_banks — нули.
    pub fn write(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        LittleEndian::write_u32(&mut buf[4..8], self.has_snapshot);
        self.snapshot
            .write_to(&mut buf[8..8 + SnapshotDescriptor::SIZE]);
        LittleEndian::write_u32(&mut buf[0x74..0x78], self.max_banks);
        LittleEndian::write_u32(&mut buf[0x78..0x7c], self.allocated_banks);
        for (i, bi) in self.bank_infos.iter().enumerate() {
            let off = SLOT_BANK_INFOS_OFF + i * BANK_INFO_SIZE;
            bi.write_to(&mut buf[off..off + BANK_INFO_SIZE]);
        }
        let size = buf.len();
        let crc = vcrc32(0, &buf[4..size - 4]);
        LittleEndian::write_u32(&mut buf[0..4], crc);
        buf
    }
}

impl fmt::Display for CSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<CSlot crc={:08x}, has_snapshot={:x}, max_banks={:x}, allocated_banks={:x} size={:x}>",
            self.crc, self.has_snapshot, self.max_banks, self.allocated_banks, self.size()
        )
    }
}
