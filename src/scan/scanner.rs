//! Сканер: последовательный проход по контейнеру с поиском слотов, банков
//! и (опционально) блоков данных по сигнатурам, без априорных смещений.
//!
//! Каждая 4К-выровненная позиция буфера проверяется предикатами по
//! порядку: слот (valid_fast + CRC), банк (valid_fast, CRC, при наличии
//! дампа ключей — попытка расшифровки + valid_slow), блоки данных
//! (LZ4 / zlib / чистый XML-summary, в т.ч. зашифрованные). Найденное
//! уходит в CSV; при полном отсутствии слотов собирается синтетический
//! слот из банков с угаданными идентификаторами.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Once;

use crate::bitmap::BitFileMappedArray;
use crate::consts::{BLOCK_SIZE, PAGE_SIZE};
use crate::crypto::{Aes256Cbc, KeysetStore};
use crate::io::{Reader, Writer};
use crate::progress::Progress;
use crate::util::{get_out_pathname, is_all_zero, vcrc32};
use crate::vbk::bank::{bank_clear_encryption, bank_crc, bank_page_is_free, bank_valid_fast, bank_valid_slow, BankHeader};
use crate::vbk::block::LzHdr;
use crate::vbk::digest::{md5_digest, Digest};
use crate::vbk::ppi::PhysPageId;
use crate::vbk::slot::{BankInfo, CSlot, ObjRefs, SnapshotDescriptor};

use super::dblbuf;
use super::lz4part;

const BITMAP_BLOCK_SIZE: u64 = PAGE_SIZE as u64;
const SUMMARY_HEAD: &[u8] = b"<OibSummary>";
const SUMMARY_TAIL: &[u8] = b"</OibSummary>";

static WARN_BANK_2ND_READ: Once = Once::new();
static WARN_SLOT_2ND_READ: Once = Once::new();
static WARN_LZ_2ND_READ: Once = Once::new();
static WARN_ZLIB_2ND_READ: Once = Once::new();
static WARN_XML_OPEN: Once = Once::new();

#[derive(Clone, Default)]
pub struct ScanOptions {
    pub start: u64,
    pub find_blocks: bool,
    pub carve_mode: bool,
    pub keysets_dump: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub force: bool,
}

struct SlotBankInfo {
    idx: u32,
    info: BankInfo,
    found: bool,
}

#[derive(Default)]
struct SlotInfo {
    crc_map: HashMap<u32, usize>,    // bank crc -> индекс в sbis
    offset_map: HashMap<u64, usize>, // bank offset -> индекс в sbis
}

pub struct Scanner {
    fname: PathBuf,
    opts: ScanOptions,

    checked_offsets: HashSet<u64>,
    slots_map: HashMap<u64, SlotInfo>,
    sbis: Vec<SlotBankInfo>,
    bank_usagecnt: HashMap<u64, i64>,
    seen_bank_ids: HashSet<u64>,
    seen_slot_fingerprints: HashMap<u64, u64>,

    // инференс bank_id при сканировании без слота
    failed_guess: bool,
    is_encrypted: bool,
    current_bank_id: u32,
    seen_bank_crcs: HashSet<u32>,
    bank_id_to_bank: BTreeMap<u32, BankInfo>,
    bank_crc_to_bank_id: HashMap<u32, u32>,

    keysets: KeysetStore,
    good_blocks_csv: Option<File>,
    bad_blocks_csv: Option<File>,
    bitmap: Option<BitFileMappedArray>,
    progress: Progress,
}

fn calc_bank_uid(crc: u32, size: u32) -> u64 {
    ((crc as u64) << 32) | size as u64
}

fn gen_bank_fname(uid: u64) -> String {
    format!("_{:08x}_{:08x}.bank", (uid >> 32) as u32, uid as u32)
}

fn calc_slot_fingerprint(slot: &CSlot) -> u64 {
    let mut h = 1469598103934665603u64;
    for bi in &slot.bank_infos {
        h ^= bi.crc as u64;
        h = h.wrapping_mul(1099511628211);
        h ^= bi.size as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

impl Scanner {
    pub fn new(fname: &Path, opts: ScanOptions) -> Result<Scanner> {
        let size = Reader::get_size(fname)?;
        Ok(Scanner {
            fname: fname.to_path_buf(),
            progress: Progress::new(size, opts.start),
            opts,
            checked_offsets: HashSet::new(),
            slots_map: HashMap::new(),
            sbis: Vec::new(),
            bank_usagecnt: HashMap::new(),
            seen_bank_ids: HashSet::new(),
            seen_slot_fingerprints: HashMap::new(),
            failed_guess: false,
            is_encrypted: false,
            current_bank_id: 0,
            seen_bank_crcs: HashSet::new(),
            bank_id_to_bank: BTreeMap::new(),
            bank_crc_to_bank_id: HashMap::new(),
            keysets: KeysetStore::new(),
            good_blocks_csv: None,
            bad_blocks_csv: None,
            bitmap: None,
        })
    }

    pub fn scan(&mut self) -> Result<()> {
        let reader = Reader::open(&self.fname)?;
        self.start(&reader)?;

        let start = self.opts.start;
        let force = self.opts.force;
        let result = dblbuf::scan(&reader, start, force, |buf, offset| {
            self.progress.update(offset);
            self.process_buf(&reader, buf, offset)
        });
        self.progress.finish();
        result?;

        self.finish(&reader)
    }

    fn start(&mut self, reader: &Reader) -> Result<()> {
        if let Some(dump) = self.opts.keysets_dump.clone() {
            match KeysetStore::load(&dump) {
                Ok(store) => {
                    info!(
                        "loaded {} keyset{} from {}",
                        store.len(),
                        if store.len() == 1 { "" } else { "s" },
                        dump.display()
                    );
                    self.keysets = store;
                }
                Err(e) => warn!("failed to load keysets from {}: {}", dump.display(), e),
            }
        }

        if self.opts.find_blocks {
            let out_fname = self.out_pathname("carved_blocks.csv")?;
            info!(
                "carving data blocks to {}{}",
                out_fname.display(),
                if self.opts.start == 0 { "" } else { " [append]" }
            );
            let open_csv = |p: &Path| -> Result<File> {
                std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(self.opts.start == 0)
                    .append(self.opts.start != 0)
                    .open(p)
                    .with_context(|| format!("open output file {}", p.display()))
            };
            self.good_blocks_csv = Some(open_csv(&out_fname)?);
            self.bad_blocks_csv = Some(open_csv(&self.out_pathname("bad_blocks.csv")?)?);
            if reader.size() >= BITMAP_BLOCK_SIZE {
                self.bitmap = Some(BitFileMappedArray::open(
                    &self.out_pathname("carved_blocks.map")?,
                    reader.size() / BITMAP_BLOCK_SIZE,
                )?);
            }
        }
        Ok(())
    }

    fn out_pathname(&self, name: &str) -> Result<PathBuf> {
        get_out_pathname(&self.fname, name, self.opts.out_dir.as_deref())
    }

    fn set_bitmap(&mut self, offset: u64, size: u64) {
        if let Some(bm) = &mut self.bitmap {
            let start = offset / BITMAP_BLOCK_SIZE;
            let end = (offset + size - 1) / BITMAP_BLOCK_SIZE + 1;
            let end = end.min(bm.size_bits());
            if start < end {
                let _ = bm.set_range(start, end);
            }
        }
    }

    fn process_buf(&mut self, reader: &Reader, buf: &[u8], file_offset: u64) -> Result<()> {
        if buf.len() < PAGE_SIZE {
            warn!(
                "{:x}: buf size {} is smaller than PAGE_SIZE, skipping scan",
                file_offset,
                buf.len()
            );
            return Ok(());
        }
        let mut pos = 0usize;
        while pos + PAGE_SIZE <= buf.len() {
            if !self.checked_offsets.contains(&(file_offset + pos as u64)) {
                self.check_slot(reader, buf, file_offset, pos)?;
                self.check_bank(reader, buf, file_offset, pos)?;
                if self.opts.find_blocks && !self.check_data(reader, buf, file_offset, pos)? {
                    // пустые страницы помечаем занятыми: второй раз их
                    // сканировать незачем
                    if is_all_zero(&buf[pos..pos + PAGE_SIZE]) {
                        self.set_bitmap(file_offset + pos as u64, PAGE_SIZE as u64);
                    }
                }
            }
            pos += PAGE_SIZE;
        }
        Ok(())
    }

    // ------------------------- слоты -------------------------

    fn check_slot(
        &mut self,
        reader: &Reader,
        buf: &[u8],
        file_offset: u64,
        pos: usize,
    ) -> Result<()> {
        let slot_offset = file_offset + pos as u64;
        let Some(hdr) = CSlot::parse_header(&buf[pos..pos + PAGE_SIZE]) else {
            return Ok(());
        };
        if !hdr.valid_fast() {
            return Ok(());
        }

        // дочитать слот целиком, если он не влез в буфер
        let mut tmp = Vec::new();
        let raw: &[u8] = if hdr.size() + pos >= buf.len() {
            tmp.resize(hdr.size(), 0);
            reader.read_at(slot_offset, &mut tmp)?;
            if CSlot::parse_header(&tmp).map(|s| s.valid_fast()) != Some(true) {
                WARN_SLOT_2ND_READ.call_once(|| {
                    warn!("{:x}: invalid slot on 2nd read, but was valid on 1st", slot_offset);
                });
                return Ok(());
            }
            &tmp
        } else {
            &buf[pos..pos + hdr.size()]
        };

        let Some(slot) = CSlot::parse(raw) else {
            return Ok(());
        };
        if !slot.valid_crc(raw) {
            return Ok(());
        }

        let fingerprint = calc_slot_fingerprint(&slot);
        if let Some(prev) = self.seen_slot_fingerprints.get(&fingerprint) {
            info!(
                "skipping duplicate slot at {:012x} (identical to {:012x})",
                slot_offset, prev
            );
            self.checked_offsets.insert(slot_offset);
            return Ok(());
        }
        self.seen_slot_fingerprints.insert(fingerprint, slot_offset);
        self.checked_offsets.insert(slot_offset);
        self.progress.found("slots");

        info!("found slot at {:12x}, {:7x} bytes", slot_offset, slot.size());
        info!("  {}", slot);
        info!("  {}", slot.snapshot);
        for (i, bi) in slot.bank_infos.iter().enumerate() {
            info!("  bank {:02x}: {}", i, bi);
        }
        self.save_file(reader, &format!("{:012x}.slot", slot_offset), slot_offset, slot.size() as u64)?;
        self.set_bitmap(slot_offset, slot.size() as u64);

        // запомнить слот и сразу проверить его банки по смещениям
        let slot_info_idx = self.sbis.len();
        let mut slot_info = SlotInfo::default();
        for (i, bi) in slot.bank_infos.iter().enumerate() {
            slot_info.crc_map.insert(bi.crc, slot_info_idx + i);
            slot_info.offset_map.insert(bi.offset as u64, slot_info_idx + i);
            self.sbis.push(SlotBankInfo {
                idx: i as u32,
                info: *bi,
                found: false,
            });
        }
        self.slots_map.insert(slot_offset, slot_info);

        for bi in &slot.bank_infos.clone() {
            let mut bank_buf = vec![0u8; bi.size as usize];
            let nread = reader.read_at(bi.offset as u64, &mut bank_buf)?;
            if nread != bi.size as usize || !bank_valid_fast(&bank_buf) {
                continue;
            }
            let crc = bank_crc(&bank_buf);
            let size = BankHeader::parse(&bank_buf).map(|h| h.bank_size()).unwrap_or(0) as u32;
            if crc != bi.crc {
                continue;
            }
            let uid = calc_bank_uid(crc, size);
            if self.seen_bank_ids.contains(&uid) {
                debug!(
                    "skipping duplicate/mirror bank (via slot) at {:012x}, crc {:08x}, size {:7x}",
                    bi.offset, crc, size
                );
                self.checked_offsets.insert(bi.offset as u64);
                continue;
            }
            self.seen_bank_ids.insert(uid);
            let tail = self.process_bank(reader, &bank_buf, crc, bi.offset as u64)?;
            info!(
                "found bank at {:12x}, crc {:08x}, size {:7x} {}",
                bi.offset, crc, size, tail
            );
            self.save_bank(reader, &BankInfo { crc, offset: bi.offset, size })?;
            self.checked_offsets.insert(bi.offset as u64);
        }

        Ok(())
    }

    // ------------------------- банки -------------------------

    fn check_bank(
        &mut self,
        reader: &Reader,
        buf: &[u8],
        file_offset: u64,
        pos: usize,
    ) -> Result<()> {
        let bank_offset = file_offset + pos as u64;
        if !bank_valid_fast(&buf[pos..pos + PAGE_SIZE.min(buf.len() - pos)]) {
            return Ok(());
        }
        let Some(hdr) = BankHeader::parse(&buf[pos..]) else {
            return Ok(());
        };

        // дочитать банк целиком при необходимости
        let mut tmp = Vec::new();
        let raw: &[u8] = if hdr.bank_size() + pos >= buf.len() {
            tmp.resize(hdr.bank_size(), 0);
            reader.read_at(bank_offset, &mut tmp)?;
            if !bank_valid_fast(&tmp) {
                // видели на битых ZFS-массивах: валиден в буфере, бит при перечитывании
                WARN_BANK_2ND_READ.call_once(|| {
                    warn!("{:x}: invalid bank on 2nd read, but was valid on 1st", bank_offset);
                });
                return Ok(());
            }
            &tmp
        } else {
            &buf[pos..pos + hdr.bank_size()]
        };

        if hdr.is_encrypted() {
            self.is_encrypted = true;
        }

        // попытка расшифровки для инференса id (нужен только без слотов)
        let mut decrypted_raw: Vec<u8> = Vec::new();
        let mut decrypted = false;
        if hdr.is_encrypted()
            && !self.keysets.is_empty()
            && self.slots_map.is_empty()
            && !self.opts.carve_mode
        {
            if let Some(cipher) = self.keysets.cipher(&hdr.keyset_id) {
                decrypted_raw = raw.to_vec();
                let encr_size = hdr.encr_size as usize;
                let mut data = decrypted_raw[PAGE_SIZE..PAGE_SIZE + encr_size].to_vec();
                match cipher.decrypt(&mut data, true) {
                    Ok(()) => {
                        decrypted_raw[PAGE_SIZE..PAGE_SIZE + data.len()].copy_from_slice(&data);
                        decrypted_raw[PAGE_SIZE + data.len()..PAGE_SIZE + encr_size].fill(0);
                        bank_clear_encryption(&mut decrypted_raw);
                        decrypted = true;
                    }
                    Err(e) => {
                        // прошёл valid_fast, но не расшифровался: скорее
                        // всего валидный банк с повреждениями
                        warn!(
                            "failed to decrypt bank @ {:12x} keyset {}: {}",
                            bank_offset, hdr.keyset_id, e
                        );
                        self.current_bank_id += 1;
                        return Ok(());
                    }
                }
            } else {
                warn!(
                    "no keyset found for bank @ {:12x} keyset {}",
                    bank_offset, hdr.keyset_id
                );
            }
        }

        let bank_for_guess: &[u8] = if decrypted { &decrypted_raw } else { raw };
        if decrypted {
            if !bank_valid_fast(bank_for_guess)
                || !bank_valid_slow(bank_for_guess, bank_for_guess.len())
            {
                return Ok(());
            }
        } else if !bank_valid_slow(raw, raw.len()) {
            return Ok(());
        }

        self.progress.found("banks");

        let crc = bank_crc(raw);
        let size = hdr.bank_size() as u32;
        let uid = calc_bank_uid(crc, size);
        if self.seen_bank_ids.contains(&uid) {
            debug!(
                "skipping duplicate/mirror bank at {:012x}, crc {:08x}, size {:7x}",
                bank_offset, crc, size
            );
            self.checked_offsets.insert(bank_offset);
            return Ok(());
        }
        self.seen_bank_ids.insert(uid);

        if !self.opts.carve_mode
            && self.slots_map.is_empty()
            && (!hdr.is_encrypted() || decrypted)
            && !self.failed_guess
        {
            if self.seen_bank_crcs.contains(&crc) {
                info!(
                    "found bank[{:02x}] mirror at {:12x}, crc {:08x}, size {:7x}",
                    self.bank_crc_to_bank_id.get(&crc).copied().unwrap_or(0),
                    bank_offset,
                    crc,
                    size
                );
            } else {
                let inferred = self.guess_bank_id(bank_for_guess, crc);
                if inferred < self.current_bank_id {
                    warn!(
                        "inferred bank id {:02x} is less than current {:02x}, giving up on inference",
                        inferred, self.current_bank_id
                    );
                    self.failed_guess = true;
                } else {
                    self.current_bank_id = inferred + 1;
                    self.seen_bank_crcs.insert(crc);
                    info!(
                        "found bank[{:02x}] at {:12x}, crc {:08x}, size {:7x}",
                        inferred, bank_offset, crc, size
                    );
                    self.bank_id_to_bank.insert(
                        inferred,
                        BankInfo {
                            crc,
                            offset: bank_offset as i64,
                            size,
                        },
                    );
                    self.bank_crc_to_bank_id.insert(crc, inferred);
                }
            }
        } else {
            let tail = self.process_bank(reader, raw, crc, bank_offset)?;
            info!(
                "found bank at {:12x}, crc {:08x}, size {:7x} {}",
                bank_offset, crc, size, tail
            );
        }

        self.save_bank(
            reader,
            &BankInfo {
                crc,
                offset: bank_offset as i64,
                size,
            },
        )?;
        self.checked_offsets.insert(bank_offset);
        Ok(())
    }

    /// Инференс bank_id без слота:
    /// 1) самый частый next.bank_id среди занятых страниц (частота >= 2);
    /// 2) среднее self.bank_id корневых страниц (корней >= 2);
    /// 3) монотонный счётчик.
    fn guess_bank_id(&self, bank: &[u8], bank_crc: u32) -> u32 {
        let Some(hdr) = BankHeader::parse(bank) else {
            return self.current_bank_id;
        };

        let mut freq: HashMap<u32, u32> = HashMap::new();
        for page_id in 0..hdr.n_pages as usize {
            if bank_page_is_free(bank, page_id) {
                continue;
            }
            let off = (page_id + 1) * PAGE_SIZE;
            let Some(page) = bank.get(off..off + 16) else {
                break;
            };
            let next = PhysPageId::parse(&page[0..8]);
            if next.bank_id >= 0 && next.bank_id < 0x7f00 && next.page_id >= 0 && next.page_id < 0x1000
            {
                *freq.entry(next.bank_id as u32).or_insert(0) += 1;
            }
        }
        let best = freq.iter().max_by_key(|(_, f)| **f);
        if let Some((&bid, &f)) = best {
            if f > 1 {
                debug!(
                    "bank[{:02x}] crc {:08x} inferred via next.bank_id frequency ({})",
                    bid, bank_crc, f
                );
                return bid;
            }
        }

        let mut sum: u64 = 0;
        let mut valid_roots: u32 = 0;
        for page_id in 0..hdr.n_pages as usize {
            if bank_page_is_free(bank, page_id) {
                continue;
            }
            let off = (page_id + 1) * PAGE_SIZE;
            let Some(page) = bank.get(off..off + 16) else {
                break;
            };
            let this = PhysPageId::parse(&page[8..16]);
            if this.page_id == page_id as i32 && this.bank_id >= 0 && this.bank_id < 0x7f00 {
                sum += this.bank_id as u64;
                valid_roots += 1;
            }
        }
        if valid_roots > 1 {
            let avg = (sum / valid_roots as u64) as u32;
            debug!(
                "bank[{:02x}] crc {:08x} inferred via self.bank_id average ({} roots)",
                avg, bank_crc, valid_roots
            );
            return avg;
        }

        debug!(
            "bank[{:02x}] crc {:08x} inferred via sequential fallback",
            self.current_bank_id, bank_crc
        );
        self.current_bank_id
    }

    /// Привязка банка к найденным слотам: обновляет их .slot-файлы,
    /// возвращает строку-аннотацию для лога.
    fn process_bank(
        &mut self,
        reader: &Reader,
        bank: &[u8],
        bank_crc: u32,
        bank_offset: u64,
    ) -> Result<String> {
        let mut s = String::new();
        if BankHeader::parse(bank).map(|h| h.is_encrypted()).unwrap_or(false) {
            s.push_str("[encrypted]");
        }

        let mut nfound = 0usize;
        // первый проход — точные совпадения (offset + crc), второй —
        // зеркала по одному из полей
        struct Update {
            slot_offset: u64,
            dst_offset: u64,
            size: u64,
            sbi_idx: usize,
            exact: bool,
            bump_usage: bool,
        }
        let mut updates: Vec<Update> = Vec::new();
        for exact in [true, false] {
            for (slot_offset, slot_map) in &self.slots_map {
                if let Some(&sbi_idx) = slot_map.crc_map.get(&bank_crc) {
                    let sbi = &self.sbis[sbi_idx];
                    if exact {
                        if sbi.info.offset as u64 == bank_offset {
                            s.push_str(&format!("[bank {:2x} of slot {:012x}]", sbi.idx, slot_offset));
                            nfound += 1;
                            updates.push(Update {
                                slot_offset: *slot_offset,
                                dst_offset: sbi.info.offset as u64,
                                size: sbi.info.size as u64,
                                sbi_idx,
                                exact: true,
                                bump_usage: true,
                            });
                        }
                    } else if !sbi.found && sbi.info.offset as u64 != bank_offset {
                        if nfound < 2 {
                            s.push_str(&format!("[bank {:2x} of slot {:012x}]", sbi.idx, slot_offset));
                        }
                        nfound += 1;
                        updates.push(Update {
                            slot_offset: *slot_offset,
                            dst_offset: sbi.info.offset as u64,
                            size: sbi.info.size as u64,
                            sbi_idx,
                            exact: false,
                            bump_usage: true,
                        });
                    }
                } else if let Some(&sbi_idx) = slot_map.offset_map.get(&bank_offset) {
                    let sbi = &self.sbis[sbi_idx];
                    if !exact && !sbi.found && sbi.info.crc != bank_crc {
                        if nfound < 2 {
                            s.push_str(&format!("[bank {:2x} of slot {:012x}]", sbi.idx, slot_offset));
                        }
                        nfound += 1;
                        updates.push(Update {
                            slot_offset: *slot_offset,
                            dst_offset: sbi.info.offset as u64,
                            size: sbi.info.size as u64,
                            sbi_idx,
                            exact: false,
                            // чужой crc на том же месте: не факт, что это тот банк
                            bump_usage: false,
                        });
                    }
                }
            }
        }

        for u in updates {
            self.update_file(reader, u.slot_offset, ".slot", u.dst_offset, bank_offset, u.size)?;
            if u.exact {
                self.sbis[u.sbi_idx].found = true;
                self.checked_offsets.insert(self.sbis[u.sbi_idx].info.offset as u64);
            }
            if u.bump_usage {
                let uid = calc_bank_uid(self.sbis[u.sbi_idx].info.crc, self.sbis[u.sbi_idx].info.size);
                *self.bank_usagecnt.entry(uid).or_insert(0) += 1;
            }
        }
        if nfound > 2 {
            s.push_str(&format!(" and {} more", nfound - 2));
        }
        Ok(s)
    }

    // ------------------------- блоки данных -------------------------

    fn check_data(
        &mut self,
        reader: &Reader,
        buf: &[u8],
        file_offset: u64,
        pos: usize,
    ) -> Result<bool> {
        if self.check_data_lz4(reader, buf, file_offset, pos, None)? {
            return Ok(true);
        }
        if self.check_data_zlib(reader, buf, file_offset, pos)? {
            return Ok(true);
        }
        if self.check_data_xml(reader, buf, file_offset, pos, None)? {
            return Ok(true);
        }

        // перебор загруженных keyset'ов: расшифровать первые 16 байт и
        // посмотреть, не появился ли знакомый заголовок. zlib сюда
        // сознательно не входит — слишком много ложных срабатываний.
        if !self.keysets.is_empty() {
            let ids: Vec<Digest> = self.keysets.ids().copied().collect();
            for id in ids {
                let mut head = [0u8; 16];
                head.copy_from_slice(&buf[pos..pos + 16]);
                {
                    let Some(cipher) = self.keysets.cipher(&id) else {
                        continue;
                    };
                    if cipher.decrypt_in_place(&mut head).is_err() {
                        continue;
                    }
                }

                if LzHdr::parse(&head).map(|h| h.valid()).unwrap_or(false)
                    && self.check_data_lz4(reader, buf, file_offset, pos, Some(id))?
                {
                    return Ok(true);
                }
                if head.starts_with(SUMMARY_HEAD)
                    && self.check_data_xml(reader, buf, file_offset, pos, Some(id))?
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn add_good_block(
        &mut self,
        offset: u64,
        comp_size: usize,
        raw_size: usize,
        digest: Digest,
        crc: u32,
        comp_type: &str,
        keyset_id: Option<Digest>,
    ) -> Result<()> {
        let mut line = format!(
            "{:012x};{:06x};{:06x};{};{:08x}",
            offset, comp_size, raw_size, digest, crc
        );
        if !comp_type.is_empty() {
            line.push_str(&format!(";{}", comp_type));
        }
        if let Some(id) = keyset_id {
            line.push_str(&format!(";{}", id));
        }
        line.push('\n');
        if let Some(f) = &mut self.good_blocks_csv {
            f.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    fn check_data_lz4(
        &mut self,
        reader: &Reader,
        buf: &[u8],
        file_offset: u64,
        pos: usize,
        keyset_id: Option<Digest>,
    ) -> Result<bool> {
        let data_offset = file_offset + pos as u64;
        let cipher: Option<&Aes256Cbc> = match &keyset_id {
            Some(id) => self.keysets.cipher(id),
            None => None,
        };

        let parse_hdr = |bytes: &[u8]| -> Option<LzHdr> {
            if let Some(c) = cipher {
                let mut head = [0u8; 16];
                head.copy_from_slice(bytes.get(..16)?);
                c.decrypt_in_place(&mut head).ok()?;
                LzHdr::parse(&head)
            } else {
                LzHdr::parse(bytes)
            }
        };

        let Some(hdr) = parse_hdr(&buf[pos..]) else {
            return Ok(false);
        };
        if !hdr.valid() {
            return Ok(false);
        }

        let mut max_comp_size = lz4part::compress_bound(hdr.src_size as usize) + LzHdr::SIZE;
        if cipher.is_some() {
            max_comp_size = (max_comp_size + 15) & !15;
        }

        // собрать (и при необходимости расшифровать) окно со сжатыми данными
        let mut window = vec![0u8; max_comp_size];
        if max_comp_size + pos >= buf.len() {
            let nread = reader.read_at(data_offset, &mut window)?;
            window.truncate(if cipher.is_some() { nread & !15 } else { nread });
        } else {
            window.copy_from_slice(&buf[pos..pos + max_comp_size]);
        }
        if let Some(c) = cipher {
            if window.len() < 16 {
                return Ok(false);
            }
            c.decrypt_in_place(&mut window)?;
        }
        let Some(hdr2) = LzHdr::parse(&window) else {
            return Ok(false);
        };
        if !hdr2.valid() {
            WARN_LZ_2ND_READ.call_once(|| {
                warn!("{:x}: invalid lz_hdr on 2nd read, but was valid on 1st", data_offset);
            });
            return Ok(false);
        }

        match lz4part::decompress_partial(&window[LzHdr::SIZE..], hdr2.src_size as usize) {
            Ok((out, consumed)) if out.len() == hdr2.src_size as usize => {
                let crc = vcrc32(0, &out);
                if crc == hdr2.crc {
                    self.progress.found("lz4 blocks");
                    self.add_good_block(
                        data_offset,
                        consumed,
                        out.len(),
                        md5_digest(&out),
                        hdr2.crc,
                        "LZ4",
                        keyset_id,
                    )?;
                    self.set_bitmap(data_offset, (consumed + LzHdr::SIZE) as u64);
                    Ok(true)
                } else {
                    // валидный LZ4 с битым CRC: конец «по-настоящему
                    // валидных» данных не определить, в bad-лист не пишем
                    Ok(false)
                }
            }
            Ok((out, consumed)) => {
                self.progress.found("bad blocks");
                let line = format!(
                    "{:012x};{:06x};{:06x};{:06x}\n",
                    data_offset,
                    hdr2.src_size,
                    consumed,
                    out.len() as u32
                );
                if let Some(f) = &mut self.bad_blocks_csv {
                    f.write_all(line.as_bytes())?;
                }
                Ok(false)
            }
            Err(_) => {
                self.progress.found("bad blocks");
                let line = format!(
                    "{:012x};{:06x};{:06x};{:06x}\n",
                    data_offset, hdr2.src_size, 0, u32::MAX
                );
                if let Some(f) = &mut self.bad_blocks_csv {
                    f.write_all(line.as_bytes())?;
                }
                Ok(false)
            }
        }
    }

    /// Базовая проверка zlib-заголовка: deflate, окно <= 32К, без
    /// preset-словаря, контрольная сумма заголовка кратна 31.
    fn is_zlib_header(data: &[u8]) -> bool {
        let b0 = data[0] as u32;
        let b1 = data[1] as u32;
        (b0 & 0x0f) == 0x08 && (b0 * 256 + b1) % 31 == 0 && ((b0 >> 4) & 0x0f) <= 7 && (b1 & 0x20) == 0
    }

    fn try_inflate(data: &[u8]) -> Option<(usize, Vec<u8>)> {
        let mut out = vec![0u8; BLOCK_SIZE];
        let mut inflater = flate2::Decompress::new(true);
        match inflater.decompress(data, &mut out, flate2::FlushDecompress::Finish) {
            Ok(flate2::Status::StreamEnd) => {
                let total_out = inflater.total_out() as usize;
                if total_out == 0 || total_out > BLOCK_SIZE {
                    return None;
                }
                out.truncate(total_out);
                Some((inflater.total_in() as usize, out))
            }
            _ => None,
        }
    }

    fn check_data_zlib(
        &mut self,
        reader: &Reader,
        buf: &[u8],
        file_offset: u64,
        pos: usize,
    ) -> Result<bool> {
        let data_offset = file_offset + pos as u64;
        if !Self::is_zlib_header(&buf[pos..pos + 2]) {
            return Ok(false);
        }

        // compSize у zlib-блоков бывает больше и srcSize, и BLOCK_SIZE
        let max_comp_size = BLOCK_SIZE + 0x200;
        let mut tmp = Vec::new();
        let data: &[u8] = if max_comp_size + pos >= buf.len() {
            tmp.resize(max_comp_size, 0);
            let nread = reader.read_at(data_offset, &mut tmp)?;
            tmp.truncate(nread);
            if tmp.len() < 2 || !Self::is_zlib_header(&tmp) {
                WARN_ZLIB_2ND_READ.call_once(|| {
                    warn!("{:x}: invalid zlib hdr on 2nd read, but was valid on 1st", data_offset);
                });
                return Ok(false);
            }
            &tmp
        } else {
            &buf[pos..pos + max_comp_size]
        };

        if let Some((comp_size, out)) = Self::try_inflate(data) {
            self.progress.found("zlib blocks");
            self.add_good_block(data_offset, comp_size, out.len(), md5_digest(&out), 0, "ZLIB", None)?;
            self.set_bitmap(data_offset, comp_size as u64);
            return Ok(true);
        }
        Ok(false)
    }

    fn check_data_xml(
        &mut self,
        reader: &Reader,
        buf: &[u8],
        file_offset: u64,
        pos: usize,
        keyset_id: Option<Digest>,
    ) -> Result<bool> {
        let data_offset = file_offset + pos as u64;
        let cipher: Option<&Aes256Cbc> = match &keyset_id {
            Some(id) => self.keysets.cipher(id),
            None => None,
        };

        let mut tmp = Vec::new();
        let data: &[u8] = if let Some(c) = cipher {
            // под расшифровку читаем окно с запасом
            let remaining = reader.size().saturating_sub(data_offset);
            let read_size = (5 * 1024 * 1024).min(remaining) as usize & !15;
            if read_size < SUMMARY_HEAD.len() {
                return Ok(false);
            }
            tmp.resize(read_size, 0);
            reader.read_exact_at(data_offset, &mut tmp)?;
            c.decrypt_in_place(&mut tmp)?;
            &tmp
        } else {
            &buf[pos..]
        };

        if data.len() < SUMMARY_HEAD.len() || !data.starts_with(SUMMARY_HEAD) {
            return Ok(false);
        }

        let is_valid_xml_char = |c: u8| c >= 0x20 || c == 9 || c == 10 || c == 13;
        let tail_pos = data
            .windows(SUMMARY_TAIL.len())
            .skip(SUMMARY_HEAD.len())
            .position(|w| w == SUMMARY_TAIL)
            .map(|p| p + SUMMARY_HEAD.len());

        match tail_pos {
            None => {
                if data.iter().all(|&c| is_valid_xml_char(c)) {
                    WARN_XML_OPEN.call_once(|| {
                        warn!(
                            "{:x}: found summary.xml without closing tag, TODO: read further",
                            data_offset
                        );
                    });
                }
                Ok(false)
            }
            Some(tail) => {
                if !data[..tail].iter().all(|&c| is_valid_xml_char(c)) {
                    return Ok(false);
                }
                let size = tail + SUMMARY_TAIL.len();
                let crc = vcrc32(0, &data[..size]);
                self.progress.found("raw blocks");
                self.add_good_block(
                    data_offset,
                    size,
                    size,
                    md5_digest(&data[..size]),
                    crc,
                    "NONE",
                    keyset_id,
                )?;
                self.set_bitmap(data_offset, size as u64);
                Ok(true)
            }
        }
    }

    // ------------------------- финал -------------------------

    fn finish(&mut self, reader: &Reader) -> Result<()> {
        if !self.opts.carve_mode
            && self.slots_map.is_empty()
            && self.is_encrypted
            && self.bank_id_to_bank.len() <= 1
        {
            warn!("encrypted banks detected and no bank was decrypted - skipping synthetic slot reconstruction");
        }

        if !self.opts.carve_mode
            && self.slots_map.is_empty()
            && self.bank_id_to_bank.len() > 1
            && !self.failed_guess
        {
            self.reconstruct_slot(reader)?;
        }

        // подчистить bank-файлы, пристроенные к слотам
        for (&uid, &cnt) in &self.bank_usagecnt {
            if cnt > 0 {
                let fname = gen_bank_fname(uid);
                debug!("removing bank {} with usage count {}", fname, cnt);
                if let Ok(path) = self.out_pathname(&fname) {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        Ok(())
    }

    /// Собирает синтетический слот из банков с угаданными id: типовые
    /// ObjRefs, банки конкатенируются после заголовка слота.
    fn reconstruct_slot(&mut self, reader: &Reader) -> Result<()> {
        info!(
            "no slots found, creating synthetic slot from {} inferred banks",
            self.bank_id_to_bank.len()
        );

        let max_banks: u32 = 0x7f00;
        let allocated_banks = self.bank_id_to_bank.keys().max().map(|&id| id + 1).unwrap_or(0);

        let mut slot = CSlot {
            crc: 0,
            has_snapshot: 1,
            snapshot: SnapshotDescriptor {
                version: 0x18,
                storage_eof: 0,
                n_banks: allocated_banks,
                obj_refs: ObjRefs {
                    meta_root_dir_page: PhysPageId::new(0, 0),
                    children_num: 1,
                    data_store_root_page: PhysPageId::new(1, 0),
                    blocks_count: 0x1bf6,
                    free_blocks_root: PhysPageId::new(2, 0),
                    dedup_root: PhysPageId::new(1, 1),
                    crypto_store_root_page: if self.is_encrypted {
                        PhysPageId::new(2, 1)
                    } else {
                        PhysPageId::new(-1, -1)
                    },
                    ..ObjRefs::default()
                },
                f64: 0,
            },
            max_banks,
            allocated_banks,
            bank_infos: vec![BankInfo::default(); allocated_banks as usize],
        };

        let slot_size = slot.size() as u64;
        let mut current_offset = slot_size;
        let mut storage_eof = 0u64;
        for (&bank_id, bi) in &self.bank_id_to_bank {
            slot.bank_infos[bank_id as usize] = BankInfo {
                crc: bi.crc,
                offset: current_offset as i64,
                size: bi.size,
            };
            current_offset += bi.size as u64;
            storage_eof = storage_eof.max(current_offset);
        }
        slot.snapshot.storage_eof = storage_eof;

        let slot_buf = slot.write(); // CRC пересчитан внутри

        let slot_path = self.out_pathname("reconstructed_slot.slot")?;
        info!("writing slot header to {}", slot_path.display());
        {
            let mut w = Writer::create(&slot_path, true)?;
            w.write(&slot_buf)?;
        }

        info!("adding {} banks into the slot", allocated_banks);
        let mut w = Writer::create(&slot_path, false)?;
        for (&bank_id, bi) in &self.bank_id_to_bank {
            let dst = slot.bank_infos[bank_id as usize];
            debug!(
                "adding bank {:02x}: slot offset {:x}, size {:x}",
                bank_id, dst.offset, dst.size
            );
            let mut bank_buf = vec![0u8; bi.size as usize];
            reader.read_exact_at(bi.offset as u64, &mut bank_buf)?;
            w.write_at(dst.offset as u64, &bank_buf)?;
        }
        w.sync()?;

        info!("slot created successfully at {}", slot_path.display());
        Ok(())
    }

    fn save_bank(&mut self, reader: &Reader, bi: &BankInfo) -> Result<()> {
        let uid = calc_bank_uid(bi.crc, bi.size);
        self.save_file(reader, &gen_bank_fname(uid), bi.offset as u64, bi.size as u64)?;
        self.bank_usagecnt.entry(uid).or_insert(0);
        self.set_bitmap(bi.offset as u64, bi.size as u64);
        Ok(())
    }

    /// reader[start..start+size] -> out-файл fname.
    fn save_file(&self, reader: &Reader, fname: &str, start: u64, size: u64) -> Result<()> {
        let out_fname = self.out_pathname(fname)?;
        let mut w = Writer::create(&out_fname, true)?;
        copy_region(reader, start, size, &mut w)
    }

    /// reader[start..start+size] -> "<fname_ofs><ext>" @ dst_offset.
    fn update_file(
        &self,
        reader: &Reader,
        fname_ofs: u64,
        ext: &str,
        dst_offset: u64,
        start: u64,
        size: u64,
    ) -> Result<()> {
        let out_fname = self.out_pathname(&format!("{:012x}{}", fname_ofs, ext))?;
        let mut w = Writer::create(&out_fname, false)?;
        w.seek(dst_offset)?;
        copy_region(reader, start, size, &mut w)
    }
}

fn copy_region(reader: &Reader, start: u64, size: u64, w: &mut Writer) -> Result<()> {
    let mut buf = vec![0u8; dblbuf::SCAN_BUF_SIZE];
    let mut pos = start;
    let mut remain = size;
    while remain > 0 {
        let chunk = (buf.len() as u64).min(remain) as usize;
        let nread = reader.read_at(pos, &mut buf[..chunk])?;
        if nread == 0 {
            warn!("copy_region({:#x}, {:#x}): unexpected EOF at {:#x}", start, size, pos);
            break;
        }
        w.write(&buf[..nread])?;
        pos += nread as u64;
        remain -= nread as u64;
    }
    Ok(())
}
