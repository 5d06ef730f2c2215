//! PageStack — дерево индексных страниц, дающее упорядоченный список
//! PhysPageId полезных страниц.
//!
//! Цепочка индексных страниц читается по next-ссылке в первых 8 байтах
//! каждой страницы; все страницы целиком складываются в плоский массив
//! таблиц (по 512 записей на страницу). Позиция полезной записи i
//! вычисляется арифметикой fan-out'а (calc_idx), после чего хвост из
//! невалидных записей отрезается.

use std::fmt;

use crate::consts::PAGE_SIZE;
use crate::vbk::ppi::PhysPageId;

pub const PPIS_PER_PAGE: usize = PAGE_SIZE / PhysPageId::SIZE; // 512

#[derive(Default)]
pub struct PageStack {
    page_tables: Vec<PhysPageId>,
    page_ids: Vec<PhysPageId>,
    finalized: bool,
}

/// Позиция записи page_idx в линеаризованном массиве таблиц.
/// Логика дословно повторяет get_page_ppi из агента.
pub fn calc_idx(page_idx: usize) -> usize {
    let mut table_num = 1usize;
    while page_idx + 1 > 510 * table_num {
        table_num *= 4;
    }
    let req_table = table_num + page_idx;
    let table_idx = req_table / 511;
    let table_ofs = req_table % 511;
    512 * table_idx + table_ofs + 1
}

impl PageStack {
    pub fn new() -> PageStack {
        PageStack::default()
    }

    pub fn valid(&self) -> bool {
        self.finalized && !self.page_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        debug_assert!(self.finalized);
        self.page_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.valid()
    }

    /// Добавляет индексную страницу (ровно PAGE_SIZE) в массив таблиц.
    pub fn add_page(&mut self, page: &[u8]) {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        debug_assert!(!self.finalized);
        for chunk in page.chunks_exact(PhysPageId::SIZE) {
            self.page_tables.push(PhysPageId::parse(chunk));
        }
    }

    /// Раскладывает таблицы в список полезных страниц и отрезает
    /// невалидный хвост.
    pub fn finalize(mut self) -> PageStack {
        debug_assert!(!self.finalized);
        self.page_ids = vec![PhysPageId::default(); self.page_tables.len()];
        let mut i = 0usize;
        while i < self.page_tables.len() {
            let idx = calc_idx(i);
            if idx < self.page_tables.len() {
                self.page_ids[i] = self.page_tables[idx];
            }
            i += 1;
        }
        while i > 0 && !self.page_ids[i - 1].valid() {
            i -= 1;
        }
        self.page_ids.truncate(i);
        self.finalized = true;
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PhysPageId> {
        debug_assert!(self.finalized);
        self.page_ids.iter()
    }
}

impl<'a> IntoIterator for &'a PageStack {
    type Item = &'a PhysPageId;
    type IntoIter = std::slice::Iter<'a, PhysPageId>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for PageStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tag, vec) = if self.finalized {
            ("", &self.page_ids)
        } else {
            ("[RAW]", &self.page_tables)
        };
        write!(f, "PageStack{}[{}]{{", tag, vec.len())?;
        if vec.len() < 10 {
            for (i, ppi) in vec.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", ppi)?;
            }
        } else {
            write!(
                f,
                "{}, {}, {}, ... , {}, {}, {}",
                vec[0],
                vec[1],
                vec[2],
                vec[vec.len() - 3],
                vec[vec.len() - 2],
                vec[vec.len() - 1]
            )?;
        }
        write!(f, "}}")
    }
}
