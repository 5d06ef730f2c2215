//! SDirItemRec — запись каталога (0xc0 байт) и логический файл VFile.
//!
//! Раскладка (packed, LE):
//!   0x00 type i32
//!   0x04 name_len u32
//!   0x08 name[0x80]
//!   0x88 props_loc ppi
//!   0x90 f90 i32
//!   0x94 union по типу:
//!     dir:      children_loc ppi @0x94, children_num i64 @0x9c
//!     fib/inc:  update_in_progress u16 @0x94, f96 u8, flags u8,
//!               blocks_loc ppi @0x98, nBlocks u64 @0xa0, fib_size u64 @0xa8;
//!               inc добавляет inc_size u64 @0xb0 и versions_loc @0xb8
//!
//! VFileAttribs агент копирует одним куском с типо-зависимого смещения
//! (0x88 для каталога, 0x8c для int-fib/increment) — здесь это явный парс
//! в варианты.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::DIR_ITEM_SIZE;
use crate::vbk::ppi::{PhysPageId, INVALID_PPI};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FileType {
    Subfolder = 1,
    ExtFib = 2,
    IntFib = 3,
    Patch = 4,
    Increment = 5,
}

impl FileType {
    pub fn from_i32(v: i32) -> Option<FileType> {
        Some(match v {
            1 => FileType::Subfolder,
            2 => FileType::ExtFib,
            3 => FileType::IntFib,
            4 => FileType::Patch,
            5 => FileType::Increment,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Subfolder => "Dir",
            FileType::ExtFib => "ExtFib",
            FileType::IntFib => "IntFib",
            FileType::Patch => "Patch",
            FileType::Increment => "Inc",
        }
    }

    pub fn is_diff(&self) -> bool {
        matches!(self, FileType::Patch | FileType::Increment)
    }
}

/// Типо-зависимая часть записи, разобранная в варианты.
#[derive(Clone, Debug)]
pub enum DirPayload {
    Directory {
        children_loc: PhysPageId,
        children_num: i64,
    },
    Fib {
        blocks_loc: PhysPageId,
        n_blocks: u64,
        fib_size: u64,
    },
    Increment {
        blocks_loc: PhysPageId,
        n_blocks: u64,
        fib_size: u64,
        inc_size: u64,
        versions_loc: PhysPageId,
    },
}

#[derive(Clone)]
pub struct SDirItemRec {
    pub file_type: FileType,
    pub name: String,
    pub props_loc: PhysPageId,
    pub payload: DirPayload,
}

fn name_valid(buf: &[u8]) -> bool {
    let name_len = LittleEndian::read_u32(&buf[4..8]) as usize;
    if name_len == 0 || name_len > 0x80 {
        return false;
    }
    buf[8..8 + name_len].iter().all(|&b| (0x20..0x7f).contains(&b))
}

impl SDirItemRec {
    pub const SIZE: usize = DIR_ITEM_SIZE;

    /// Возвращает запись только если она проходит все предикаты из §3:
    /// известный тип, печатное имя, валидный typed-payload, ссылки в
    /// пределах max_banks (0 = не проверять).
    pub fn parse(buf: &[u8], max_banks: i32) -> Option<SDirItemRec> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let file_type = FileType::from_i32(LittleEndian::read_i32(&buf[0..4]))?;
        if !name_valid(buf) {
            return None;
        }
        let name_len = LittleEndian::read_u32(&buf[4..8]) as usize;
        let name = String::from_utf8_lossy(&buf[8..8 + name_len]).into_owned();

        let props_loc = PhysPageId::parse(&buf[0x88..0x90]);
        if !props_loc.valid_or_empty() {
            return None;
        }
        if max_banks != 0 && !props_loc.empty() && props_loc.bank_id >= max_banks {
            return None;
        }

        let base_valid = |blocks_loc: PhysPageId, n_blocks: u64, fib_size: u64| -> bool {
            let mut ok = n_blocks > 0 && n_blocks <= fib_size && fib_size > 0 && blocks_loc.valid();
            if max_banks != 0 {
                ok = ok && blocks_loc.bank_id < max_banks;
            }
            ok
        };

        let payload = match file_type {
            FileType::Subfolder => {
                let children_loc = PhysPageId::parse(&buf[0x94..0x9c]);
                let children_num = LittleEndian::read_i64(&buf[0x9c..0xa4]);
                let mut ok = children_loc.valid() && children_num > 0;
                if max_banks != 0 {
                    ok = ok && children_loc.bank_id < max_banks;
                }
                if !ok {
                    return None;
                }
                DirPayload::Directory {
                    children_loc,
                    children_num,
                }
            }
            FileType::IntFib => {
                let blocks_loc = PhysPageId::parse(&buf[0x98..0xa0]);
                let n_blocks = LittleEndian::read_u64(&buf[0xa0..0xa8]);
                let fib_size = LittleEndian::read_u64(&buf[0xa8..0xb0]);
                if !base_valid(blocks_loc, n_blocks, fib_size) {
                    return None;
                }
                DirPayload::Fib {
                    blocks_loc,
                    n_blocks,
                    fib_size,
                }
            }
            FileType::ExtFib | FileType::Patch => {
                // точную валидацию для этих типов агент не делает
                DirPayload::Fib {
                    blocks_loc: PhysPageId::parse(&buf[0x98..0xa0]),
                    n_blocks: LittleEndian::read_u64(&buf[0xa0..0xa8]),
                    fib_size: LittleEndian::read_u64(&buf[0xa8..0xb0]),
                }
            }
            FileType::Increment => DirPayload::Increment {
                blocks_loc: PhysPageId::parse(&buf[0x98..0xa0]),
                n_blocks: LittleEndian::read_u64(&buf[0xa0..0xa8]),
                fib_size: LittleEndian::read_u64(&buf[0xa8..0xb0]),
                inc_size: LittleEndian::read_u64(&buf[0xb0..0xb8]),
                versions_loc: PhysPageId::parse(&buf[0xb8..0xc0]),
            },
        };

        Some(SDirItemRec {
            file_type,
            name,
            props_loc,
            payload,
        })
    }

    /// Имя без валидации записи — для диагностики обрезанных каталогов.
    pub fn peek_name(buf: &[u8]) -> Option<String> {
        if buf.len() < Self::SIZE || !name_valid(buf) {
            return None;
        }
        let name_len = LittleEndian::read_u32(&buf[4..8]) as usize;
        Some(String::from_utf8_lossy(&buf[8..8 + name_len]).into_owned())
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Subfolder
    }

    /// Сериализация для тестовых контейнеров.
    pub fn write(&self) -> [u8; DIR_ITEM_SIZE] {
        let mut buf = [0u8; DIR_ITEM_SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.file_type as i32);
        LittleEndian::write_u32(&mut buf[4..8], self.name.len() as u32);
        buf[8..8 + self.name.len()].copy_from_slice(self.name.as_bytes());
        self.props_loc.write_to(&mut buf[0x88..0x90]);
        match &self.payload {
            DirPayload::Directory {
                children_loc,
                children_num,
            } => {
                children_loc.write_to(&mut buf[0x94..0x9c]);
                LittleEndian::write_i64(&mut buf[0x9c..0xa4], *children_num);
            }
            DirPayload::Fib {
                blocks_loc,
                n_blocks,
                fib_size,
            } => {
                blocks_loc.write_to(&mut buf[0x98..0xa0]);
                LittleEndian::write_u64(&mut buf[0xa0..0xa8], *n_blocks);
                LittleEndian::write_u64(&mut buf[0xa8..0xb0], *fib_size);
            }
            DirPayload::Increment {
                blocks_loc,
                n_blocks,
                fib_size,
                inc_size,
                versions_loc,
            } => {
                blocks_loc.write_to(&mut buf[0x98..0xa0]);
                LittleEndian::write_u64(&mut buf[0xa0..0xa8], *n_blocks);
                LittleEndian::write_u64(&mut buf[0xa8..0xb0], *fib_size);
                LittleEndian::write_u64(&mut buf[0xb0..0xb8], *inc_size);
                versions_loc.write_to(&mut buf[0xb8..0xc0]);
            }
        }
        buf
    }
}

impl fmt::Display for SDirItemRec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SDirItemRec type={} name=\"{}\" {:?}>",
            self.file_type.as_str(),
            self.name,
            self.payload
        )
    }
}

/// Атрибуты логического файла, скопированные из записи каталога.
#[derive(Clone, Copy, Debug)]
pub struct VFileAttribs {
    pub ppi: PhysPageId,
    pub n_blocks: i64,
    pub filesize: i64,
    pub vib_updsize: i64,
}

impl Default for VFileAttribs {
    fn default() -> Self {
        VFileAttribs {
            ppi: INVALID_PPI,
            n_blocks: 0,
            filesize: 0,
            vib_updsize: 0,
        }
    }
}

/// Логический файл, который видят extract/test.
#[derive(Clone, Debug)]
pub struct VFile {
    pub file_type: FileType,
    pub name: String,
    pub attribs: VFileAttribs,
}

impl VFile {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Subfolder
    }

    pub fn is_diff(&self) -> bool {
        self.file_type.is_diff()
    }

    pub fn type_str(&self) -> &'static str {
        self.file_type.as_str()
    }

    /// Проекция записи каталога в VFile; ExtFib/Patch агент не загружает.
    pub fn load(rec: &SDirItemRec) -> Option<VFile> {
        let attribs = match &rec.payload {
            DirPayload::Directory {
                children_loc,
                children_num,
            } => VFileAttribs {
                ppi: *children_loc,
                n_blocks: *children_num,
                filesize: -1,
                vib_updsize: 0,
            },
            DirPayload::Fib {
                blocks_loc,
                n_blocks,
                fib_size,
            } if rec.file_type == FileType::IntFib => VFileAttribs {
                ppi: *blocks_loc,
                n_blocks: *n_blocks as i64,
                filesize: *fib_size as i64,
                vib_updsize: 0,
            },
            DirPayload::Increment {
                blocks_loc,
                n_blocks,
                fib_size,
                inc_size,
                ..
            } => VFileAttribs {
                ppi: *blocks_loc,
                n_blocks: *n_blocks as i64,
                filesize: *fib_size as i64,
                vib_updsize: *inc_size as i64,
            },
            _ => return None,
        };

        Some(VFile {
            file_type: rec.file_type,
            name: rec.name.clone(),
            attribs,
        })
    }
}
