//! CMeta — кэш страниц метаданных.
//!
//! Владеет сырыми буферами банков (индекс в векторе == bank_id) и отдаёт
//! всё остальное как копии страниц или заимствованные срезы. Источники:
//!   - slot: заголовок CSlot + банки по BankInfo.offset;
//!   - bank: один банк от offset до конца файла;
//!   - legacy: поток банков c TOC-префиксом (упорядоченный) или
//!     bruteforce-раскладкой по вычисленному metadata-ID.
//! После загрузки, если слот указывает на криптохранилище, выполняется
//! цепочка keyset'ов и зашифрованные банки расшифровываются на месте.

pub mod blocks;
pub mod crypto_chain;
pub mod deep_scan;
pub mod dir;
pub mod slots;

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace, warn};
use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::consts::PAGE_SIZE;
use crate::crypto::KeysetStore;
use crate::io::Reader;
use crate::util::is_all_zero;
use crate::vbk::bank::{bank_valid_fast, bank_valid_slow, BankHeader};
use crate::vbk::block_desc::{BlockDescriptor, BlockDescriptors};
use crate::vbk::page_stack::PageStack;
use crate::vbk::ppi::PhysPageId;
use crate::vbk::slot::CSlot;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MetaSource {
    Auto,
    Toc,
    Bruteforce,
    Slot,
    Bank,
}

/// Параметры открытия контейнера метаданных.
#[derive(Clone)]
pub struct MetaOptions {
    pub offset: u64,
    pub source: MetaSource,
    pub password: String,
    pub ignore_errors: bool,
    pub dump_keysets: bool,
    pub dump_session_only: bool,
    /// Общий файл для дампов ключей при обработке нескольких входов.
    pub keysets_same_file: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
}

impl Default for MetaOptions {
    fn default() -> Self {
        MetaOptions {
            offset: 0,
            source: MetaSource::Auto,
            password: String::new(),
            ignore_errors: false,
            dump_keysets: false,
            dump_session_only: false,
            keysets_same_file: None,
            out_dir: None,
        }
    }
}

pub struct CMeta {
    banks: Vec<Vec<u8>>,
    source_path: PathBuf,
    ignore_errors: bool,
    deep_scan_enabled: bool,
    // -1 не определено, 0 старый формат, 1 новый
    new_version: Cell<i8>,
    keysets: KeysetStore,
}

impl CMeta {
    pub fn open(fname: &Path, opts: &MetaOptions) -> Result<CMeta> {
        let reader = Reader::open(fname)?;

        let mut source = opts.source;
        if source == MetaSource::Auto {
            source = match fname.extension().and_then(|e| e.to_str()) {
                Some("slot") => MetaSource::Slot,
                Some("bank") => MetaSource::Bank,
                _ => MetaSource::Auto, // legacy с автоопределением TOC/bruteforce
            };
        }

        let mut meta = CMeta {
            banks: Vec::new(),
            source_path: fname.to_path_buf(),
            ignore_errors: opts.ignore_errors,
            deep_scan_enabled: false,
            new_version: Cell::new(-1),
            keysets: KeysetStore::new(),
        };

        match source {
            MetaSource::Slot => meta.import_slot(&reader, opts)?,
            MetaSource::Bank => meta.import_bank(&reader, opts)?,
            _ => meta.import_legacy(&reader, opts.offset)?,
        }

        debug!("metadata loaded: {} bank slots", meta.banks.len());
        Ok(meta)
    }

    pub fn set_deep_scan(&mut self, enabled: bool) {
        self.deep_scan_enabled = enabled;
    }

    pub fn deep_scan_enabled(&self) -> bool {
        self.deep_scan_enabled
    }

    pub fn keysets(&self) -> &KeysetStore {
        &self.keysets
    }

    pub fn get_aes_cipher(&self, id: &crate::vbk::Digest) -> Option<&crate::crypto::Aes256Cbc> {
        self.keysets.cipher(id)
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    fn log_or_die(&self, msg: String) -> Result<()> {
        error!("{}", msg);
        if self.ignore_errors {
            Ok(())
        } else {
            Err(anyhow!(msg))
        }
    }

    // ------------------------- импорт -------------------------

    fn import_slot(&mut self, reader: &Reader, opts: &MetaOptions) -> Result<()> {
        debug!("metadata is from slot @ {:#x}", opts.offset);

        let mut hdr = vec![0u8; PAGE_SIZE];
        reader
            .read_exact_at(opts.offset, &mut hdr)
            .context("read slot page 0")?;
        let slot_hdr =
            CSlot::parse_header(&hdr).ok_or_else(|| anyhow!("slot header too short"))?;
        trace!("loading {}", slot_hdr);
        if slot_hdr.size() < PAGE_SIZE {
            return Err(anyhow!("invalid slot size: {:#x}", slot_hdr.size()));
        }

        let mut raw = vec![0u8; slot_hdr.size()];
        raw[..PAGE_SIZE].copy_from_slice(&hdr);
        reader
            .read_exact_at(opts.offset + PAGE_SIZE as u64, &mut raw[PAGE_SIZE..])
            .context("read slot page 1+")?;

        let mut slot = slot_hdr;
        let valid_fast = slot.valid_fast();
        let valid_crc = valid_fast && slot.valid_crc(&raw);
        debug!(
            "slot: {} valid_fast={} valid_crc={}",
            slot, valid_fast, valid_crc
        );
        if !valid_fast || !valid_crc {
            self.log_or_die(format!(
                "slot @ {:#x} failed validation (valid_fast={}, valid_crc={})",
                opts.offset, valid_fast, valid_crc
            ))?;
        }
        slot.parse_bank_infos(&raw);
        debug!("  {}", slot.snapshot);

        // в force-режиме allocated_banks может быть мусором
        let n_banks = (slot.allocated_banks.min(crate::consts::MAX_BANKS)) as usize;
        self.banks = vec![Vec::new(); n_banks];
        for (i, bi) in slot.bank_infos.iter().enumerate() {
            if i >= self.banks.len() {
                break;
            }
            if bi.size == 0 {
                continue;
            }
            let mut bank = vec![0u8; bi.size as usize];
            let nread = reader.read_at(bi.offset as u64, &mut bank)?;
            if nread != bi.size as usize {
                error!("failed to read bank #{}: {:x} != {:x}", i, nread, bi.size);
                continue;
            }
            self.banks[i] = bank;
        }

        // криптохранилище: загрузить keyset'ы и расшифровать банки
        let crypto_root = slot.snapshot.obj_refs.crypto_store_root_page;
        if crypto_root.valid() {
            info!(
                "slot indicates encrypted metadata (CryptoStoreRootPage={}) - attempting to load keysets",
                crypto_root
            );
            self.load_keysets(crypto_root.bank_id, opts, false)?;
            self.decrypt_banks();
        }

        for (i, bi) in slot.bank_infos.iter().enumerate() {
            if i >= self.banks.len() || bi.size == 0 {
                continue;
            }
            let bank = &self.banks[i];
            let valid_fast = bank_valid_fast(bank);
            let valid_slow = valid_fast && bank_valid_slow(bank, bi.size as usize);
            let hdr = BankHeader::parse(bank);
            debug!(
                "bank[{}]: size={:x} encrypted={} valid_fast={} valid_slow={}",
                i,
                hdr.map(|h| h.bank_size()).unwrap_or(0),
                hdr.map(|h| h.is_encrypted()).unwrap_or(false),
                valid_fast,
                valid_slow
            );
        }

        Ok(())
    }

    fn import_bank(&mut self, reader: &Reader, opts: &MetaOptions) -> Result<()> {
        debug!("metadata is from bank @ {:#x}", opts.offset);
        let bank_size = (reader.size() - opts.offset) as usize;
        let mut bank = vec![0u8; bank_size];
        reader.read_exact_at(opts.offset, &mut bank)?;

        let valid_fast = bank_valid_fast(&bank);
        let valid_slow = bank_valid_slow(&bank, bank_size);
        debug!(
            "bank[0]: {} bytes, valid_fast={} valid_slow={}",
            bank_size, valid_fast, valid_slow
        );

        let encrypted = BankHeader::parse(&bank)
            .map(|h| h.is_encrypted())
            .unwrap_or(false);
        self.banks.push(bank);

        if opts.dump_keysets && !encrypted {
            self.load_keysets(0, opts, true)?;
        }
        Ok(())
    }

    /// Legacy-контейнеры: нечётный размер — однобайтовый TOC-префикс и
    /// упорядоченный поток банков; чётный — каждый банк ложится по своему
    /// вычисленному metadata-ID.
    fn import_legacy(&mut self, reader: &Reader, offset: u64) -> Result<()> {
        let mut fs = reader.size() - offset;
        let mut pos = offset;
        let toc_mark = fs % 2 == 1;
        if toc_mark {
            pos += 1;
            fs -= 1;
        }
        debug!(
            "metadata is from {}",
            if toc_mark { "TOC" } else { "bruteforcing" }
        );

        let end = pos + fs;
        while pos + 2 <= end {
            let mut n_pages_buf = [0u8; 2];
            reader.read_exact_at(pos, &mut n_pages_buf)?;
            let n_pages = LittleEndian::read_u16(&n_pages_buf) as usize;
            let cur_bank_size = (n_pages + 2) * PAGE_SIZE;

            let mut bank = vec![0u8; cur_bank_size];
            let nread = reader.read_at(pos, &mut bank)?;
            bank.truncate(nread);
            pos += cur_bank_size as u64;

            if toc_mark {
                debug!(
                    "loading bank {:04x} size {:6x} @ {:8x}",
                    self.banks.len(),
                    cur_bank_size,
                    pos
                );
                self.banks.push(bank);
            } else {
                let pd = guess_meta_id(&bank);
                debug!("loading bank {:04x} size {:6x} @ {:8x}", pd, cur_bank_size, pos);
                if self.banks.len() <= pd {
                    self.banks.resize(pd + 1, Vec::new());
                }
                self.banks[pd] = bank;
            }
        }
        Ok(())
    }

    // ------------------------- доступ к страницам -------------------------

    /// Срез страницы без копирования.
    pub fn page_ref(&self, ppi: PhysPageId) -> Option<&[u8]> {
        if ppi.bank_id < 0 || ppi.page_id < 0 {
            return None;
        }
        let bank = self.banks.get(ppi.bank_id as usize)?;
        let off = (ppi.page_id as usize + 1) * PAGE_SIZE;
        if bank.len() <= off {
            return None;
        }
        bank.get(off..off + PAGE_SIZE)
    }

    /// Копия страницы: ровно PAGE_SIZE байт или отказ.
    pub fn get_page(&self, ppi: PhysPageId) -> Option<Vec<u8>> {
        let page = self.page_ref(ppi).map(|p| p.to_vec());
        match &page {
            Some(_) => trace!("get_page({}) => ok", ppi),
            None => trace!("get_page({}) => missing", ppi),
        }
        page
    }

    /// Читает дерево индексов от корня: первые 8 байт каждой страницы —
    /// ссылка next, у корневой дополнительно self-идентификатор по
    /// смещению 8. Цикл или битый self обрывают обход.
    pub fn get_page_stack(&self, root: PhysPageId) -> PageStack {
        trace!("get_page_stack({})", root);
        let mut stack = PageStack::new();
        let mut ppi = root;
        let mut visited: HashSet<PhysPageId> = HashSet::new();
        let mut first_page = true;

        while ppi.valid() {
            let Some(page) = self.page_ref(ppi) else {
                error!(
                    "get_page_stack({}): failed to get page {}, stack truncated!",
                    root, ppi
                );
                break;
            };
            if first_page {
                first_page = false;
                let self_ppi = PhysPageId::parse(&page[8..16]);
                if self_ppi != root {
                    error!(
                        "get_page_stack({}): first page is not the root page: {} != {}",
                        root, self_ppi, root
                    );
                    break;
                }
            } else if visited.contains(&ppi) {
                error!("get_page_stack({}): circular reference: {}", root, ppi);
                break;
            }
            visited.insert(ppi);

            stack.add_page(page);
            ppi = PhysPageId::parse(&page[0..8]);
        }

        stack.finalize()
    }

    /// Датастор: дайджест -> BlockDescriptor. Пустые слоты пропускаются,
    /// конфликтующие дубликаты логируются (последний валидный побеждает),
    /// невалидные записи в force-режиме всё же попадают в карту, если
    /// дайджест ещё не занят.
    pub fn read_datastore(&self, root: PhysPageId) -> Result<BlockDescriptors> {
        let stack = self.get_page_stack(root);
        if !stack.valid() {
            warn!("read_datastore({}): empty PageStack", root);
            return Ok(BlockDescriptors::new());
        }

        let mut bds = BlockDescriptors::with_capacity(stack.len() * (PAGE_SIZE / BlockDescriptor::SIZE));
        for ppi in &stack {
            let Some(page) = self.page_ref(*ppi) else {
                self.log_or_die(format!(
                    "read_datastore({}): failed to get page {}",
                    root, ppi
                ))?;
                continue;
            };
            for chunk in page.chunks_exact(BlockDescriptor::SIZE) {
                if BlockDescriptor::empty_raw(chunk) {
                    continue;
                }
                let Some(bd) = BlockDescriptor::parse(chunk) else {
                    continue;
                };
                if bd.valid() {
                    if bd.digest.is_zero() {
                        continue; // zero-digest блоки в карту не попадают
                    }
                    if let Some(old) = bds.get(&bd.digest) {
                        if *old != bd {
                            warn!("read_datastore({}): duplicate BD: old: {}", root, old);
                            warn!("read_datastore({}): duplicate BD: new: {}", root, bd);
                        }
                    }
                    bds.insert(bd.digest, bd);
                } else {
                    self.log_or_die(format!("read_datastore({}): invalid BD: {}", root, bd))?;
                    if !bd.digest.is_zero() && !bds.contains_key(&bd.digest) {
                        // попробуем использовать, но существующую запись не трогаем
                        bds.insert(bd.digest, bd);
                    }
                }
            }
        }
        Ok(bds)
    }

    /// Обход всех непустых страниц (bank_id, page_id).
    pub fn for_each_page(&self, mut cb: impl FnMut(PhysPageId, &[u8])) {
        for bank_id in 0..self.banks.len() {
            let bank = &self.banks[bank_id];
            if bank.len() < PAGE_SIZE {
                continue;
            }
            let n_pages = bank.len() / PAGE_SIZE - 1;
            for page_id in 0..n_pages {
                let off = (page_id + 1) * PAGE_SIZE;
                let Some(page) = bank.get(off..off + PAGE_SIZE) else {
                    break;
                };
                if is_all_zero(page) {
                    continue;
                }
                cb(PhysPageId::new(bank_id as i32, page_id as i32), page);
            }
        }
    }

    // ------------------------- версия формата -------------------------

    pub fn set_version(&self, new_version: bool) {
        self.new_version.set(if new_version { 1 } else { 0 });
    }

    pub fn is_new_version(&self) -> bool {
        if self.new_version.get() == -1 {
            self.detect_version();
        }
        self.new_version.get() == 1
    }

    /// Детект по странице (0,0): нулевой u64 по смещению 8 — новый формат.
    /// Сбой детекта трактуется как новый формат.
    fn detect_version(&self) {
        info!("fetching page[0] - root dir for version detection");
        let root = PhysPageId::new(0, 0);
        match self.page_ref(root) {
            Some(page) => {
                let marker = LittleEndian::read_u64(&page[8..16]);
                self.new_version.set(if marker == 0 { 1 } else { 0 });
                if marker == 0 {
                    debug!("new metadata format detected");
                }
            }
            None => {
                warn!("failed to fetch root dir from meta, assuming new format");
                self.new_version.set(1);
            }
        }
    }

    // ------------------------- тестовая сборка -------------------------

    /// Конструктор из готовых буферов банков (сканер и тесты).
    pub fn from_banks(banks: Vec<Vec<u8>>) -> CMeta {
        CMeta {
            banks,
            source_path: PathBuf::new(),
            ignore_errors: true,
            deep_scan_enabled: false,
            new_version: Cell::new(-1),
            keysets: KeysetStore::new(),
        }
    }
}

/// Metadata-ID банка в bruteforce-легаси: усреднение bank_id корневых
/// страниц, чей self.page_id совпадает с номером страницы.
fn guess_meta_id(bank: &[u8]) -> usize {
    if bank.len() < PAGE_SIZE * 2 {
        return 0;
    }
    let num_pages = bank.len() / PAGE_SIZE - 1;
    let mut sum: u64 = 0;
    let mut cnt: u64 = 0;
    for i in 0..num_pages {
        let off = (i + 1) * PAGE_SIZE;
        if off + 16 > bank.len() {
            break;
        }
        let mid = LittleEndian::read_u32(&bank[off + 8..off + 12]);
        let mpid = LittleEndian::read_u32(&bank[off + 12..off + 16]);
        if mid as usize == i && (mpid & 0xFFFF_F000) == 0 {
            cnt += 1;
            sum += mpid as u64;
        }
    }
    if cnt > 1 {
        (sum / cnt) as usize
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbk::bank::{bank_new, bank_put_page};

    fn root_page(this: PhysPageId, payload: &[PhysPageId]) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        for off in (0..PAGE_SIZE).step_by(8) {
            PhysPageId::new(-1, -1).write_to(&mut page[off..off + 8]);
        }
        PhysPageId::new(-1, -1).write_to(&mut page[0..8]);
        this.write_to(&mut page[8..16]);
        for (i, ppi) in payload.iter().enumerate() {
            let slot = crate::vbk::page_stack::calc_idx(i);
            ppi.write_to(&mut page[slot * 8..slot * 8 + 8]);
        }
        page
    }

    #[test]
    fn page_access_bounds() {
        let mut bank = bank_new(0x20);
        bank_put_page(&mut bank, 3, b"payload");
        let meta = CMeta::from_banks(vec![bank]);

        assert!(meta.get_page(PhysPageId::new(0, 3)).is_some());
        assert!(meta.get_page(PhysPageId::new(1, 0)).is_none()); // нет банка
        assert!(meta.get_page(PhysPageId::new(0, 0x1000)).is_none()); // за пределами
        assert!(meta.get_page(PhysPageId::new(-1, -1)).is_none());
    }

    #[test]
    fn page_stack_follows_and_checks_root() {
        let mut bank = bank_new(0x20);
        let root = PhysPageId::new(0, 0);
        bank_put_page(
            &mut bank,
            0,
            &root_page(root, &[PhysPageId::new(0, 5), PhysPageId::new(0, 6)]),
        );
        bank_put_page(&mut bank, 5, b"a");
        bank_put_page(&mut bank, 6, b"b");
        let meta = CMeta::from_banks(vec![bank]);

        let ps = meta.get_page_stack(root);
        assert!(ps.valid());
        let ids: Vec<_> = ps.iter().copied().collect();
        assert_eq!(ids, vec![PhysPageId::new(0, 5), PhysPageId::new(0, 6)]);

        // корень с чужим self-идентификатором отвергается
        let ps = meta.get_page_stack(PhysPageId::new(0, 5));
        assert!(!ps.valid());
    }

    #[test]
    fn page_stack_detects_cycle() {
        let mut bank = bank_new(0x20);
        let root = PhysPageId::new(0, 0);
        // корень ссылается сам на себя через next
        let mut page = root_page(root, &[PhysPageId::new(0, 5)]);
        root.write_to(&mut page[0..8]);
        bank_put_page(&mut bank, 0, &page);
        bank_put_page(&mut bank, 5, b"x");
        let meta = CMeta::from_banks(vec![bank]);

        // обход обрывается после первого витка, но собранное остаётся
        let ps = meta.get_page_stack(root);
        assert!(ps.valid());
        assert_eq!(ps.len(), 1);
    }

    #[test]
    fn for_each_page_skips_empty() {
        let mut bank = bank_new(0x20);
        bank_put_page(&mut bank, 2, b"data");
        let meta = CMeta::from_banks(vec![bank]);
        let mut seen = Vec::new();
        meta.for_each_page(|ppi, _| seen.push(ppi));
        assert_eq!(seen, vec![PhysPageId::new(0, 2)]);
    }

    #[test]
    fn version_detect_from_root_marker() {
        let mut bank = bank_new(0x20);
        let root = PhysPageId::new(0, 0);
        bank_put_page(&mut bank, 0, &root_page(root, &[]));
        let meta = CMeta::from_banks(vec![bank]);
        // self ppi (0,0) по смещению 8 — нулевой маркер
        assert!(meta.is_new_version());

        let meta = CMeta::from_banks(vec![]);
        assert!(meta.is_new_version()); // отказ детекта -> новый формат

        let mut bank = bank_new(0x20);
        let mut page = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u64(&mut page[8..16], 0x1234);
        bank_put_page(&mut bank, 0, &page);
        let meta = CMeta::from_banks(vec![bank]);
        assert!(!meta.is_new_version());
        meta.set_version(true);
        assert!(meta.is_new_version());
    }

    #[test]
    fn datastore_dedup_and_empties() {
        use crate::vbk::block_desc::{BlockDescriptor, BlockLocation, CompType};
        use crate::vbk::Digest;

        let mk_bd = |digest: u128, offset: u64| BlockDescriptor {
            location_raw: BlockLocation::BlockInBlob as u8,
            usage_cnt: 1,
            offset,
            alloc_size: 0x1000,
            dedup: 1,
            digest: Digest(digest),
            comp_type_raw: CompType::Lz4.to_u8(),
            unused: 0,
            comp_size: 0x800,
            src_size: 0x100000,
            keyset_id: Digest::ZERO,
        };

        // страница датастора: два дескриптора, дубль, пустые слоты
        let mut ds_page = vec![0u8; PAGE_SIZE];
        mk_bd(0xa1, 0x1000).write_to(&mut ds_page[0..0x3c]);
        mk_bd(0xb2, 0x2000).write_to(&mut ds_page[0x3c..0x78]);
        mk_bd(0xa1, 0x1000).write_to(&mut ds_page[0x78..0xb4]); // идентичный дубль
        for b in ds_page[0xb4..0xf0].iter_mut() {
            *b = 0xff; // пустой слот из 0xff
        }

        let mut bank = bank_new(0x20);
        let ds_root = PhysPageId::new(0, 1);
        bank_put_page(&mut bank, 1, &root_page(ds_root, &[PhysPageId::new(0, 2)]));
        bank_put_page(&mut bank, 2, &ds_page);
        let meta = CMeta::from_banks(vec![bank]);

        let bds = meta.read_datastore(ds_root).unwrap();
        assert_eq!(bds.len(), 2);
        assert_eq!(bds[&Digest(0xa1)].offset, 0x1000);
        assert_eq!(bds[&Digest(0xb2)].offset, 0x2000);
    }

    #[test]
    fn guess_meta_id_averages_roots() {
        // банк с двумя корневыми страницами, обе говорят bank_id=3
        let mut bank = bank_new(0x20);
        let mut p0 = vec![0u8; PAGE_SIZE];
        PhysPageId::new(3, 0).write_to(&mut p0[8..16]);
        let mut p1 = vec![0u8; PAGE_SIZE];
        PhysPageId::new(3, 1).write_to(&mut p1[8..16]);
        bank_put_page(&mut bank, 0, &p0);
        bank_put_page(&mut bank, 1, &p1);
        assert_eq!(guess_meta_id(&bank), 3);

        // одиночный корень не считается
        let mut bank = bank_new(0x20);
        bank_put_page(&mut bank, 0, &p0);
        assert_eq!(guess_meta_id(&bank), 0);
    }
}
