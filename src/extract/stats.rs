//! Постраничная статистика extract/test: счётчики результатов по блокам,
//! табличный вывод и json-строка.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::units::bytes2human;
use crate::vbk::dir_item::{FileType, VFile};
use crate::vbk::ppi::PhysPageId;

pub struct FileTestInfo {
    pub name: String,
    pub pathname: String,
    pub md_fname: PathBuf,
    pub ppi: PhysPageId,
    pub size: i64,
    pub total_blocks: u64,
    pub file_type: FileType,

    pub sparse_blocks: u64,
    pub n_ok: u64,
    /// метаданные блока отсутствуют целиком
    pub n_miss_md: u64,
    /// хэш известен, но блока нет ни в датасторе, ни во внешней таблице
    pub n_miss_ht: u64,
    pub n_err_decomp: u64,
    pub n_err_crc: u64,
    pub n_read_err: u64,
}

impl FileTestInfo {
    pub fn new(vfi: &VFile, pathname: &str, md_fname: &std::path::Path) -> FileTestInfo {
        FileTestInfo {
            name: vfi.name.clone(),
            pathname: pathname.to_string(),
            md_fname: md_fname.to_path_buf(),
            ppi: vfi.attribs.ppi,
            size: vfi.attribs.filesize,
            total_blocks: vfi.attribs.n_blocks.max(0) as u64,
            file_type: vfi.file_type,
            sparse_blocks: 0,
            n_ok: 0,
            n_miss_md: 0,
            n_miss_ht: 0,
            n_err_decomp: 0,
            n_err_crc: 0,
            n_read_err: 0,
        }
    }

    pub fn header() -> String {
        format!(
            "{:>9} {:>9} {:>9} {:>7} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {:9}  {}",
            "TotalBLK",
            "sparse",
            "OK_BLK",
            "OK%",
            "missMD",
            "missHT",
            "errRead",
            "eDecomp",
            "errCRC",
            "size",
            "id",
            "name"
        )
    }

    pub fn has_errors(&self) -> bool {
        self.n_miss_md != 0
            || self.n_miss_ht != 0
            || self.n_err_decomp != 0
            || self.n_err_crc != 0
            || self.n_read_err != 0
    }

    /// 100% зарезервированы за «вообще ничего не сломалось»: при любых
    /// ошибках результат прижимается к 99.99.
    pub fn percent(&self) -> f64 {
        let total = self.total_blocks.saturating_sub(self.sparse_blocks);
        let mut perc = if total == 0 {
            0.0
        } else {
            100.0 * self.n_ok as f64 / total as f64
        };
        if perc >= 100.0 && self.has_errors() {
            perc = 99.99;
        }
        perc
    }

    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct Row<'a> {
            id: String,
            pathname: &'a str,
            size: i64,
            #[serde(rename = "type")]
            file_type: &'static str,
            total_blocks: u64,
            sparse_blocks: u64,
            #[serde(rename = "nOK")]
            n_ok: u64,
            percent: f64,
            #[serde(rename = "nMissMD")]
            n_miss_md: u64,
            #[serde(rename = "nMissHT")]
            n_miss_ht: u64,
            #[serde(rename = "nErrDecomp")]
            n_err_decomp: u64,
            #[serde(rename = "nErrCRC")]
            n_err_crc: u64,
            #[serde(rename = "nReadErr")]
            n_read_err: u64,
            md_fname: String,
        }

        let row = Row {
            id: self.ppi.to_string(),
            pathname: &self.pathname,
            size: self.size,
            file_type: self.file_type.as_str(),
            total_blocks: self.total_blocks,
            sparse_blocks: self.sparse_blocks,
            n_ok: self.n_ok,
            percent: self.percent(),
            n_miss_md: self.n_miss_md,
            n_miss_ht: self.n_miss_ht,
            n_err_decomp: self.n_err_decomp,
            n_err_crc: self.n_err_crc,
            n_read_err: self.n_read_err,
            md_fname: self.md_fname.to_string_lossy().into_owned(),
        };
        serde_json::to_string(&row).unwrap_or_else(|_| "{}".to_string())
    }
}

impl fmt::Display for FileTestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:9} {:9} {:9} {:7.2} {:8} {:8} {:8} {:8} {:8} {:>8}  {}  {}",
            self.total_blocks,
            self.sparse_blocks,
            self.n_ok,
            self.percent(),
            self.n_miss_md,
            self.n_miss_ht,
            self.n_read_err,
            self.n_err_decomp,
            self.n_err_crc,
            bytes2human(self.size.max(0) as u64),
            self.ppi,
            self.name
        )
    }
}
