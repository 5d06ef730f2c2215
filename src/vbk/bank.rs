//! CBank — непрерывный спан из (nPages+2) страниц: заголовочная страница,
//! затем страницы данных.
//!
//! Заголовочная страница (ровно PAGE_SIZE):
//!   0x000 nPages u16
//!   0x002 encr_mode u8
//!   0x003 f3 u8
//!   0x004 free_pages[0x400]  (0 = занято, 1 = свободно)
//!   0x404 zeroes[0x800]
//!   0xc04 keyset_id (16)
//!   0xc14 encr_size u32
//!   0xc18 fc18[8] u32
//!   0xc38 unused[0x3c8]
//!
//! Банк не копируется в структуру — все проверки и доступ к страницам
//! работают поверх сырого буфера, который владеет CMeta.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{DEDUP_REC_SIZE, MAX_PAGES, MIN_PAGES, PAGE_SIZE};
use crate::util::{is_all_zero, vcrc32};
use crate::vbk::digest::Digest;
use crate::vbk::keyset::SKeySetRec;
use crate::vbk::ppi::PhysPageId;

const FREE_PAGES_OFF: usize = 0x4;
const ZEROES_OFF: usize = 0x404;
const KEYSET_ID_OFF: usize = 0xc04;
const ENCR_SIZE_OFF: usize = 0xc14;

/// Лёгкий разобранный заголовок банка.
#[derive(Clone, Copy, Debug)]
pub struct BankHeader {
    pub n_pages: u16,
    pub encr_mode: u8,
    pub keyset_id: Digest,
    pub encr_size: u32,
}

impl BankHeader {
    pub fn parse(raw: &[u8]) -> Option<BankHeader> {
        if raw.len() < PAGE_SIZE {
            return None;
        }
        Some(BankHeader {
            n_pages: LittleEndian::read_u16(&raw[0..2]),
            encr_mode: raw[2],
            keyset_id: Digest::from_bytes(&raw[KEYSET_ID_OFF..KEYSET_ID_OFF + 16]),
            encr_size: LittleEndian::read_u32(&raw[ENCR_SIZE_OFF..ENCR_SIZE_OFF + 4]),
        })
    }

    pub fn bank_size(&self) -> usize {
        (self.n_pages as usize + 2) * PAGE_SIZE
    }

    pub fn valid_encr_config(&self) -> bool {
        (self.keyset_id.is_zero() && self.encr_size == 0)
            || (!self.keyset_id.is_zero()
                && self.encr_size > 0
                && self.encr_size as usize <= self.bank_size() - PAGE_SIZE)
    }

    pub fn is_encrypted(&self) -> bool {
        self.valid_encr_config() && self.encr_size > 0
    }
}

/// Быстрая валидация: только заголовочная страница.
pub fn bank_valid_fast(raw: &[u8]) -> bool {
    let Some(hdr) = BankHeader::parse(raw) else {
        return false;
    };
    (MIN_PAGES..=MAX_PAGES).contains(&(hdr.n_pages as usize))
        && free_pages_valid(raw)
        && is_all_zero(&raw[ZEROES_OFF..ZEROES_OFF + MAX_PAGES * 2])
        && hdr.valid_encr_config()
}

/// Таблица занятости: каждый маркер 0/1, и есть хотя бы одна занятая страница.
fn free_pages_valid(raw: &[u8]) -> bool {
    let table = &raw[FREE_PAGES_OFF..FREE_PAGES_OFF + MAX_PAGES];
    let mut was_occupied = false;
    for &m in table {
        match m {
            0 => was_occupied = true,
            1 => {}
            _ => return false,
        }
    }
    was_occupied
}

pub fn bank_page_is_free(raw: &[u8], page_id: usize) -> bool {
    raw.get(FREE_PAGES_OFF + page_id).copied().unwrap_or(1) != 0
}

/// Страница данных page_id (первая страница банка — заголовок).
pub fn bank_page(raw: &[u8], page_id: usize) -> Option<&[u8]> {
    let off = (page_id + 1) * PAGE_SIZE;
    raw.get(off..off + PAGE_SIZE)
}

/// CRC банка: vcrc32 по всем (nPages+2) страницам.
pub fn bank_crc(raw: &[u8]) -> u32 {
    let size = BankHeader::parse(raw).map(|h| h.bank_size()).unwrap_or(0);
    vcrc32(0, &raw[..size.min(raw.len())])
}

/// Начало PageStack-таблицы: next == -1:-1 и self.page_id == page_id.
pub fn page_is_metavec2_start(page: &[u8], page_id: usize) -> bool {
    if page.len() < 16 {
        return false;
    }
    let next = PhysPageId::parse(&page[0..8]);
    let this = PhysPageId::parse(&page[8..16]);
    next.empty() && this.page_id == page_id as i32
}

/// Индекс дедупликации: u32-счётчик и строго возрастающие хэши записей
/// с пустыми ppi.
pub fn page_is_dedup_idx(page: &[u8]) -> bool {
    if page.len() < PAGE_SIZE {
        return false;
    }
    let n_records = LittleEndian::read_u32(&page[0..4]) as usize;
    if !(10..=(PAGE_SIZE - 4) / DEDUP_REC_SIZE).contains(&n_records) {
        return false;
    }
    for i in 0..n_records - 1 {
        let rec = &page[4 + i * DEDUP_REC_SIZE..4 + (i + 1) * DEDUP_REC_SIZE];
        let next = &page[4 + (i + 1) * DEDUP_REC_SIZE..4 + (i + 2) * DEDUP_REC_SIZE];
        let rec_ppi = PhysPageId::parse(&rec[0..8]);
        if !rec_ppi.empty() || rec[8..24] >= next[8..24] {
            return false;
        }
    }
    true
}

/// Медленная валидация: нужно как минимум две занятых страницы, похожих на
/// известные структуры, либо дедуп-индекс на странице 0. Для зашифрованных
/// банков проверить нечего.
pub fn bank_valid_slow(raw: &[u8], data_size: usize) -> bool {
    let Some(hdr) = BankHeader::parse(raw) else {
        return false;
    };
    if hdr.is_encrypted() {
        return true;
    }

    let mut n_ok = 0;
    for page_id in 0..hdr.n_pages as usize {
        if (page_id + 1) * PAGE_SIZE >= data_size {
            return false;
        }
        if bank_page_is_free(raw, page_id) {
            continue;
        }
        let Some(page) = bank_page(raw, page_id) else {
            return false;
        };
        if page_id == 0 && page_is_dedup_idx(page) {
            return true;
        }
        if page_is_metavec2_start(page, page_id)
            || SKeySetRec::parse(page).map(|r| r.valid()).unwrap_or(false)
        {
            n_ok += 1;
            if n_ok >= 2 {
                return true;
            }
        }
    }

    false
}

/// Затирает крипто-поля после расшифровки банка на месте.
pub fn bank_clear_encryption(raw: &mut [u8]) {
    raw[KEYSET_ID_OFF..KEYSET_ID_OFF + 16].fill(0);
    LittleEndian::write_u32(&mut raw[ENCR_SIZE_OFF..ENCR_SIZE_OFF + 4], 0);
}

/// Проставляет крипто-поля (синтез тестовых контейнеров).
pub fn bank_set_encryption(raw: &mut [u8], keyset_id: Digest, encr_size: u32) {
    raw[KEYSET_ID_OFF..KEYSET_ID_OFF + 16].copy_from_slice(&keyset_id.to_bytes());
    LittleEndian::write_u32(&mut raw[ENCR_SIZE_OFF..ENCR_SIZE_OFF + 4], encr_size);
}

/// Собирает пустой банк: заголовок с nPages, все страницы свободны.
/// Страницы помечаются занятыми по мере заполнения (`builder`-хелпер
/// для тестов и синтеза).
pub fn bank_new(n_pages: usize) -> Vec<u8> {
    assert!((MIN_PAGES..=MAX_PAGES).contains(&n_pages));
    let mut raw = vec![0u8; (n_pages + 2) * PAGE_SIZE];
    LittleEndian::write_u16(&mut raw[0..2], n_pages as u16);
    for m in raw[FREE_PAGES_OFF..FREE_PAGES_OFF + MAX_PAGES].iter_mut() {
        *m = 1;
    }
    raw
}

/// Кладёт данные страницы page_id и помечает её занятой.
pub fn bank_put_page(raw: &mut [u8], page_id: usize, data: &[u8]) {
    assert!(data.len() <= PAGE_SIZE);
    raw[FREE_PAGES_OFF + page_id] = 0;
    let off = (page_id + 1) * PAGE_SIZE;
    raw[off..off + data.len()].copy_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_root_page(this: PhysPageId) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        PhysPageId::new(-1, -1).write_to(&mut page[0..8]);
        this.write_to(&mut page[8..16]);
        // хвост таблицы — invalid
        for off in (16..PAGE_SIZE).step_by(8) {
            PhysPageId::new(-1, -1).write_to(&mut page[off..off + 8]);
        }
        page
    }

    #[test]
    fn fresh_bank_is_fast_invalid_until_used() {
        // нет ни одной занятой страницы
        let raw = bank_new(0x20);
        assert!(!bank_valid_fast(&raw));
    }

    #[test]
    fn fast_and_slow_validation() {
        let mut raw = bank_new(0x20);
        bank_put_page(&mut raw, 0, &stack_root_page(PhysPageId::new(0, 0)));
        bank_put_page(&mut raw, 1, &stack_root_page(PhysPageId::new(0, 1)));
        assert!(bank_valid_fast(&raw));
        let len = raw.len();
        assert!(bank_valid_slow(&raw, len));
    }

    #[test]
    fn slow_needs_two_known_pages() {
        let mut raw = bank_new(0x20);
        bank_put_page(&mut raw, 0, &stack_root_page(PhysPageId::new(0, 0)));
        let len = raw.len();
        assert!(bank_valid_fast(&raw));
        assert!(!bank_valid_slow(&raw, len));
    }

    #[test]
    fn bad_free_marker_fails_fast() {
        let mut raw = bank_new(0x20);
        bank_put_page(&mut raw, 0, &stack_root_page(PhysPageId::new(0, 0)));
        raw[FREE_PAGES_OFF + 5] = 2;
        assert!(!bank_valid_fast(&raw));
    }

    #[test]
    fn nonzero_zeroes_fail_fast() {
        let mut raw = bank_new(0x20);
        bank_put_page(&mut raw, 0, &stack_root_page(PhysPageId::new(0, 0)));
        raw[ZEROES_OFF + 100] = 1;
        assert!(!bank_valid_fast(&raw));
    }

    #[test]
    fn encryption_config_rules() {
        let mut raw = bank_new(0x20);
        bank_put_page(&mut raw, 0, &stack_root_page(PhysPageId::new(0, 0)));

        // encr_size без keyset'а — неконсистентно
        LittleEndian::write_u32(&mut raw[ENCR_SIZE_OFF..ENCR_SIZE_OFF + 4], 0x1000);
        assert!(!bank_valid_fast(&raw));

        bank_set_encryption(&mut raw, Digest(0x42), 0x1000);
        assert!(bank_valid_fast(&raw));
        let hdr = BankHeader::parse(&raw).unwrap();
        assert!(hdr.is_encrypted());
        // зашифрованный банк через valid_slow проходит без вопросов
        let len = raw.len();
        assert!(bank_valid_slow(&raw, len));

        bank_clear_encryption(&mut raw);
        let hdr = BankHeader::parse(&raw).unwrap();
        assert!(!hdr.is_encrypted());
    }

    #[test]
    fn crc_covers_whole_bank() {
        let mut raw = bank_new(0x20);
        bank_put_page(&mut raw, 0, &stack_root_page(PhysPageId::new(0, 0)));
        let crc0 = bank_crc(&raw);
        let len = raw.len();
        raw[len - 1] ^= 1;
        assert_ne!(crc0, bank_crc(&raw));
    }

    #[test]
    fn dedup_idx_detection() {
        let mut page = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u32(&mut page[0..4], 12);
        for i in 0..12usize {
            let off = 4 + i * DEDUP_REC_SIZE;
            PhysPageId::new(-1, -1).write_to(&mut page[off..off + 8]);
            page[off + 8] = i as u8; // возрастающие хэши
        }
        assert!(page_is_dedup_idx(&page));

        // нарушить сортировку
        page[4 + 8] = 0xff;
        assert!(!page_is_dedup_idx(&page));
    }
}
