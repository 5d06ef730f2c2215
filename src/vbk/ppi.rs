//! PhysPageId — координата страницы (bank_id, page_id).
//!
//! В файле лежит как пара LE i32, причём page_id ПЕРВЫМ, bank_id вторым.
//! Строковый вид — "bank:page" в hex: "%04x:%04x". Сентинел (-1,-1) — пусто.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::{MAX_BANKS, MAX_PAGES};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysPageId {
    pub bank_id: i32,
    pub page_id: i32,
}

pub const INVALID_PPI: PhysPageId = PhysPageId {
    bank_id: -1,
    page_id: -1,
};

/// Корень датастора по умолчанию (bank 0, page 1).
pub const DEFAULT_DATASTORE_PPI: PhysPageId = PhysPageId {
    bank_id: 0,
    page_id: 1,
};

impl PhysPageId {
    pub const SIZE: usize = 8;

    pub fn new(bank_id: i32, page_id: i32) -> Self {
        Self { bank_id, page_id }
    }

    /// Читает 8 байт: page_id, затем bank_id.
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            page_id: LittleEndian::read_i32(&buf[0..4]),
            bank_id: LittleEndian::read_i32(&buf[4..8]),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..4], self.page_id);
        LittleEndian::write_i32(&mut buf[4..8], self.bank_id);
    }

    /// Парсит строковый вид "bank:page" (hex, без 0x).
    pub fn parse_str(s: &str) -> Option<Self> {
        let (bank, page) = s.split_once(':')?;
        let bank_id = u32::from_str_radix(bank.trim(), 16).ok()? as i32;
        let page_id = u32::from_str_radix(page.trim(), 16).ok()? as i32;
        Some(Self { bank_id, page_id })
    }

    pub fn empty(&self) -> bool {
        self.bank_id == -1 && self.page_id == -1
    }

    pub fn zero(&self) -> bool {
        self.bank_id == 0 && self.page_id == 0
    }

    pub fn valid(&self) -> bool {
        self.bank_id > -1
            && self.bank_id <= MAX_BANKS as i32
            && self.page_id > -1
            && self.page_id <= MAX_PAGES as i32
    }

    pub fn valid_or_empty(&self) -> bool {
        self.valid() || self.empty()
    }
}

impl Default for PhysPageId {
    fn default() -> Self {
        INVALID_PPI
    }
}

impl fmt::Display for PhysPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty() {
            write!(f, "-1:-1")
        } else {
            write!(f, "{:04x}:{:04x}", self.bank_id, self.page_id)
        }
    }
}

impl fmt::Debug for PhysPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
