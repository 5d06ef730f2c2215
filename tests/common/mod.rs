//! Сборка синтетических контейнеров для интеграционных тестов:
//! заголовок + два зеркальных слота + банки + регион данных.

#![allow(dead_code)]

use std::io::Write as _;
use std::path::{Path, PathBuf};

use QuiverVBK::consts::{BLOCK_SIZE, LZ_START_MAGIC, MAX_DIGEST_TYPE_LEN, PAGE_SIZE};
use QuiverVBK::util::vcrc32;
use QuiverVBK::vbk::bank::{bank_crc, bank_new, bank_put_page};
use QuiverVBK::vbk::block_desc::{BlockLocation, CompType};
use QuiverVBK::vbk::page_stack::calc_idx;
use QuiverVBK::vbk::{
    md5_digest, BankInfo, BlockDescriptor, CSlot, Digest, FileHeader, LzHdr, ObjRefs, PhysPageId,
    SDirItemRec, SFibBlockDescriptorV7, SMetaTableDescriptor, SPatchBlockDescriptorV7,
    SnapshotDescriptor,
};

pub const BANK_PAGES: usize = 0x20;
pub const BANK_SIZE: usize = (BANK_PAGES + 2) * PAGE_SIZE;
pub const SLOT_REGION: usize = 0x80000; // slot_fmt 9

pub fn tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("qvbk-e2e-{}-{}", tag, nanos));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Страница-корень PageStack: next=-1:-1, self, полезные записи по
/// слотам calc_idx, остальное -1.
pub fn root_page(this: PhysPageId, payload: &[PhysPageId]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for off in (0..PAGE_SIZE).step_by(8) {
        PhysPageId::new(-1, -1).write_to(&mut page[off..off + 8]);
    }
    PhysPageId::new(-1, -1).write_to(&mut page[0..8]);
    this.write_to(&mut page[8..16]);
    for (i, ppi) in payload.iter().enumerate() {
        let slot = calc_idx(i);
        ppi.write_to(&mut page[slot * 8..slot * 8 + 8]);
    }
    page
}

pub fn dir_page(recs: &[SDirItemRec]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, rec) in recs.iter().enumerate() {
        page[i * SDirItemRec::SIZE..(i + 1) * SDirItemRec::SIZE].copy_from_slice(&rec.write());
    }
    page
}

pub fn meta_table_page(descs: &[SMetaTableDescriptor]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, d) in descs.iter().enumerate() {
        d.write_to(&mut page[i * SMetaTableDescriptor::SIZE..(i + 1) * SMetaTableDescriptor::SIZE]);
    }
    page
}

pub fn fib_page(recs: &[SFibBlockDescriptorV7]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, r) in recs.iter().enumerate() {
        r.write_to(
            &mut page[i * SFibBlockDescriptorV7::SIZE..(i + 1) * SFibBlockDescriptorV7::SIZE],
        );
    }
    page
}

pub fn patch_page(recs: &[SPatchBlockDescriptorV7]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, r) in recs.iter().enumerate() {
        r.write_to(
            &mut page[i * SPatchBlockDescriptorV7::SIZE..(i + 1) * SPatchBlockDescriptorV7::SIZE],
        );
    }
    page
}

pub fn bd_page(bds: &[BlockDescriptor]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, bd) in bds.iter().enumerate() {
        bd.write_to(&mut page[i * BlockDescriptor::SIZE..(i + 1) * BlockDescriptor::SIZE]);
    }
    page
}

pub struct Fixture {
    pub banks: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

impl Fixture {
    pub fn new(num_banks: usize) -> Fixture {
        Fixture {
            banks: (0..num_banks).map(|_| bank_new(BANK_PAGES)).collect(),
            data: Vec::new(),
        }
    }

    /// Смещение первого банка в файле контейнера.
    pub fn banks_base() -> u64 {
        (PAGE_SIZE + 2 * SLOT_REGION) as u64
    }

    /// Смещение региона данных (за последним банком).
    pub fn data_base(&self) -> u64 {
        Self::banks_base() + (self.banks.len() * BANK_SIZE) as u64
    }

    pub fn put_page(&mut self, bank: usize, page: usize, data: &[u8]) {
        bank_put_page(&mut self.banks[bank], page, data);
    }

    fn append_data(&mut self, raw: &[u8]) -> u64 {
        let offset = self.data_base() + self.data.len() as u64;
        self.data.extend_from_slice(raw);
        // блоки в контейнере выровнены на 16
        let pad = (16 - self.data.len() % 16) % 16;
        self.data.extend(std::iter::repeat(0u8).take(pad));
        offset
    }

    fn base_bd(digest: Digest, offset: u64) -> BlockDescriptor {
        BlockDescriptor {
            location_raw: BlockLocation::BlockInBlob as u8,
            usage_cnt: 1,
            offset,
            alloc_size: 0,
            dedup: 1,
            digest,
            comp_type_raw: 0,
            unused: 0,
            comp_size: 0,
            src_size: 0,
            keyset_id: Digest::ZERO,
        }
    }

    /// LZ4-блок: lz_hdr + сжатый поток; CRC в заголовке — vcrc32 плейнтекста.
    pub fn add_lz4_block(&mut self, plain: &[u8]) -> BlockDescriptor {
        let compressed = lz4_flex::block::compress(plain);
        let mut raw = vec![0u8; LzHdr::SIZE + compressed.len()];
        LzHdr {
            magic: LZ_START_MAGIC,
            crc: vcrc32(0, plain),
            src_size: plain.len() as u32,
        }
        .write_to(&mut raw);
        raw[LzHdr::SIZE..].copy_from_slice(&compressed);

        let offset = self.append_data(&raw);
        let mut bd = Self::base_bd(md5_digest(plain), offset);
        bd.comp_type_raw = CompType::Lz4.to_u8();
        bd.comp_size = raw.len() as u32;
        bd.alloc_size = raw.len() as u32;
        bd.src_size = plain.len() as u32;
        bd
    }

    pub fn add_zlib_block(&mut self, plain: &[u8]) -> BlockDescriptor {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(plain).unwrap();
        let compressed = enc.finish().unwrap();

        let offset = self.append_data(&compressed);
        let mut bd = Self::base_bd(md5_digest(plain), offset);
        bd.comp_type_raw = CompType::ZlibLo.to_u8();
        bd.comp_size = compressed.len() as u32;
        bd.alloc_size = compressed.len() as u32;
        bd.src_size = plain.len() as u32;
        bd
    }

    pub fn add_raw_block(&mut self, plain: &[u8]) -> BlockDescriptor {
        let offset = self.append_data(plain);
        let mut bd = Self::base_bd(md5_digest(plain), offset);
        bd.comp_type_raw = CompType::None.to_u8();
        bd.comp_size = plain.len() as u32;
        bd.alloc_size = plain.len() as u32;
        bd.src_size = plain.len() as u32;
        bd
    }

    pub fn add_zstd_block(&mut self, plain: &[u8]) -> BlockDescriptor {
        let compressed = zstd::stream::encode_all(plain, 3).unwrap();
        let offset = self.append_data(&compressed);
        let mut bd = Self::base_bd(md5_digest(plain), offset);
        bd.comp_type_raw = CompType::Zstd3.to_u8();
        bd.comp_size = compressed.len() as u32;
        bd.alloc_size = compressed.len() as u32;
        bd.src_size = plain.len() as u32;
        bd
    }

    fn build_slot(&self) -> CSlot {
        let bank_infos: Vec<BankInfo> = self
            .banks
            .iter()
            .enumerate()
            .map(|(i, bank)| BankInfo {
                crc: bank_crc(bank),
                offset: (Self::banks_base() + (i * BANK_SIZE) as u64) as i64,
                size: BANK_SIZE as u32,
            })
            .collect();

        CSlot {
            crc: 0,
            has_snapshot: 1,
            snapshot: SnapshotDescriptor {
                version: 0x18,
                storage_eof: self.data_base() + self.data.len() as u64,
                n_banks: self.banks.len() as u32,
                obj_refs: ObjRefs {
                    meta_root_dir_page: PhysPageId::new(0, 0),
                    children_num: 1,
                    data_store_root_page: PhysPageId::new(0, 1),
                    blocks_count: 0,
                    ..ObjRefs::default()
                },
                f64: 0,
            },
            max_banks: 0x7f00,
            allocated_banks: self.banks.len() as u32,
            bank_infos,
        }
    }

    fn file_header_bytes() -> Vec<u8> {
        let mut digest_type = vec![0u8; MAX_DIGEST_TYPE_LEN + 1];
        digest_type[..3].copy_from_slice(b"md5");
        let hdr = FileHeader {
            version: 0xd,
            inited: 1,
            digest_type_len: 3,
            digest_type,
            slot_fmt: 9,
            std_block_size: BLOCK_SIZE as u32,
            cluster_align: 9,
        };
        let mut page = vec![0u8; PAGE_SIZE];
        hdr.write_to(&mut page);
        page
    }

    /// Полный контейнер: header + slot0 + slot1 (зеркало) + банки + данные.
    pub fn write_container(&self, path: &Path) {
        let slot_bytes = self.build_slot().write();
        assert!(slot_bytes.len() <= SLOT_REGION);

        let mut image = Vec::with_capacity(self.data_base() as usize + self.data.len());
        image.extend_from_slice(&Self::file_header_bytes());
        for _ in 0..2 {
            let mut region = vec![0u8; SLOT_REGION];
            region[..slot_bytes.len()].copy_from_slice(&slot_bytes);
            image.extend_from_slice(&region);
        }
        for bank in &self.banks {
            image.extend_from_slice(bank);
        }
        image.extend_from_slice(&self.data);

        std::fs::write(path, &image).unwrap();
    }

    /// Образ без слотов: банки по своим смещениям, данные после.
    /// Используется сканером для синтеза слота.
    pub fn write_banks_only(&self, path: &Path) {
        let mut image = vec![0u8; Self::banks_base() as usize];
        for bank in &self.banks {
            image.extend_from_slice(bank);
        }
        image.extend_from_slice(&self.data);
        std::fs::write(path, &image).unwrap();
    }
}
