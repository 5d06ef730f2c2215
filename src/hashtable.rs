//! Внешняя хэш-таблица нарезанных блоков (чистый carving-режим):
//! дайджест -> (устройство, смещение, размеры, компрессия, keyset).
//!
//! Источник — CSV сканера (по одному на устройство):
//!   offset;comp_size;orig_size;md5;crc[;comp_type[;keyset_id]]
//! После загрузки записи сортируются по дайджесту и дедуплицируются
//! (первая побеждает), затем сохраняются в бинарный кэш "HASH_TBL",
//! который в следующие разы подхватывается через mmap. Поиск — бинарный.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::consts::HASH_ENTRY_SIZE;
use crate::io::Writer;
use crate::vbk::block_desc::CompType;
use crate::vbk::digest::Digest;

pub const CACHE_MAGIC: u64 = 0x4c42_545f_4853_4148; // "HASH_TBL"
pub const CACHE_VERSION: u32 = 9;
const CACHE_HDR_SIZE: usize = 32;

/// Одна запись, 56 байт: offset u64, hash 16, keyset_id 16, comp_size u32,
/// orig_size u32, comp_type u8, device_index u8, padding 6.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HashEntry {
    pub offset: u64,
    pub hash: Digest,
    pub keyset_id: Digest,
    pub comp_size: u32,
    pub orig_size: u32,
    pub comp_type_raw: u8,
    pub device_index: u8,
}

impl HashEntry {
    pub const SIZE: usize = HASH_ENTRY_SIZE;

    pub fn parse(buf: &[u8]) -> HashEntry {
        HashEntry {
            offset: LittleEndian::read_u64(&buf[0..8]),
            hash: Digest::from_bytes(&buf[8..24]),
            keyset_id: Digest::from_bytes(&buf[24..40]),
            comp_size: LittleEndian::read_u32(&buf[40..44]),
            orig_size: LittleEndian::read_u32(&buf[44..48]),
            comp_type_raw: buf[48],
            device_index: buf[49],
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..Self::SIZE].fill(0);
        LittleEndian::write_u64(&mut buf[0..8], self.offset);
        buf[8..24].copy_from_slice(&self.hash.to_bytes());
        buf[24..40].copy_from_slice(&self.keyset_id.to_bytes());
        LittleEndian::write_u32(&mut buf[40..44], self.comp_size);
        LittleEndian::write_u32(&mut buf[44..48], self.orig_size);
        buf[48] = self.comp_type_raw;
        buf[49] = self.device_index;
    }

    pub fn comp_type(&self) -> CompType {
        CompType::from_u8(self.comp_type_raw).unwrap_or(CompType::Lz4)
    }
}

enum Backing {
    Owned(Vec<HashEntry>),
    Mapped { mmap: Mmap, count: usize },
}

#[derive(Default)]
pub struct HashTable {
    backing: Option<Backing>,
}

impl HashTable {
    pub fn new() -> HashTable {
        HashTable::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.backing.is_some()
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Some(Backing::Owned(v)) => v.len(),
            Some(Backing::Mapped { count, .. }) => *count,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn owned_mut(&mut self) -> &mut Vec<HashEntry> {
        if !matches!(self.backing, Some(Backing::Owned(_))) {
            self.backing = Some(Backing::Owned(Vec::new()));
        }
        match self.backing.as_mut() {
            Some(Backing::Owned(v)) => v,
            _ => unreachable!(),
        }
    }

    /// Загружает CSV одного устройства. Формы строк:
    /// 5 колонок — legacy LZ4; 6 — с comp_type (или, для совсем старых
    /// дампов, с keyset_id на её месте); 7 — comp_type + keyset_id.
    pub fn load_from_text_file(&mut self, fname: &Path, device_index: u8) -> Result<usize> {
        let f = File::open(fname).with_context(|| format!("open {}", fname.display()))?;
        let reader = BufReader::new(f);
        let entries = self.owned_mut();
        let before = entries.len();

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split(';').collect();
            if tokens.len() < 5 {
                continue;
            }

            let mut entry = HashEntry {
                offset: u64::from_str_radix(tokens[0].trim(), 16)
                    .map_err(|e| anyhow!("bad offset {:?}: {}", tokens[0], e))?,
                comp_size: u32::from_str_radix(tokens[1].trim(), 16)
                    .map_err(|e| anyhow!("bad comp_size {:?}: {}", tokens[1], e))?,
                orig_size: u32::from_str_radix(tokens[2].trim(), 16)
                    .map_err(|e| anyhow!("bad orig_size {:?}: {}", tokens[2], e))?,
                hash: Digest::parse(tokens[3].trim())
                    .ok_or_else(|| anyhow!("bad digest {:?}", tokens[3]))?,
                keyset_id: Digest::ZERO,
                comp_type_raw: CompType::Lz4.to_u8(),
                device_index,
            };
            // tokens[4] — CRC, в таблице не хранится

            if tokens.len() >= 7 {
                entry.comp_type_raw = CompType::from_csv_name(tokens[5])
                    .ok_or_else(|| anyhow!("bad comp_type {:?}", tokens[5]))?
                    .to_u8();
                entry.keyset_id = Digest::parse(tokens[6].trim())
                    .ok_or_else(|| anyhow!("bad keyset_id {:?}", tokens[6]))?;
            } else if tokens.len() == 6 {
                match CompType::from_csv_name(tokens[5]) {
                    Some(ct) => entry.comp_type_raw = ct.to_u8(),
                    None => {
                        // legacy: шестая колонка — keyset_id
                        entry.keyset_id = Digest::parse(tokens[5].trim())
                            .ok_or_else(|| anyhow!("bad keyset_id {:?}", tokens[5]))?;
                    }
                }
            }

            entries.push(entry);
        }

        Ok(entries.len() - before)
    }

    /// Сортировка по дайджесту + дедупликация (первая запись побеждает).
    pub fn sort_entries(&mut self) -> Result<()> {
        let entries = self.owned_mut();
        if entries.is_empty() {
            return Err(anyhow!("no hash table entries to sort"));
        }
        entries.sort_by_key(|e| e.hash);
        entries.dedup_by_key(|e| e.hash);
        Ok(())
    }

    /// Бинарный кэш: заголовок + записи подряд.
    pub fn save_to_cache(&self, fname: &Path, num_devices: u64) -> Result<()> {
        let Some(Backing::Owned(entries)) = &self.backing else {
            return Err(anyhow!("nothing to save"));
        };

        let mut w = Writer::create(fname, true)?;
        let mut hdr = [0u8; CACHE_HDR_SIZE];
        LittleEndian::write_u64(&mut hdr[0..8], CACHE_MAGIC);
        LittleEndian::write_u32(&mut hdr[8..12], CACHE_VERSION);
        LittleEndian::write_u32(&mut hdr[12..16], HashEntry::SIZE as u32);
        LittleEndian::write_u64(&mut hdr[16..24], entries.len() as u64);
        LittleEndian::write_u64(&mut hdr[24..32], num_devices);
        w.write(&hdr)?;

        let mut buf = vec![0u8; entries.len() * HashEntry::SIZE];
        for (i, e) in entries.iter().enumerate() {
            e.write_to(&mut buf[i * HashEntry::SIZE..(i + 1) * HashEntry::SIZE]);
        }
        w.write(&buf)?;
        w.sync()?;
        Ok(())
    }

    /// Загрузка кэша через mmap; количество устройств обязано совпасть.
    pub fn load_from_cache(&mut self, fname: &Path, num_devices: u64) -> Result<()> {
        let f = File::open(fname).with_context(|| format!("open cache {}", fname.display()))?;
        let mmap = unsafe { Mmap::map(&f) }.context("mmap hash table cache")?;
        if mmap.len() < CACHE_HDR_SIZE {
            return Err(anyhow!("hash table cache is too short"));
        }

        let magic = LittleEndian::read_u64(&mmap[0..8]);
        let version = LittleEndian::read_u32(&mmap[8..12]);
        let entry_size = LittleEndian::read_u32(&mmap[12..16]);
        let num_entries = LittleEndian::read_u64(&mmap[16..24]) as usize;
        let devices = LittleEndian::read_u64(&mmap[24..32]);

        if magic != CACHE_MAGIC
            || version != CACHE_VERSION
            || entry_size as usize != HashEntry::SIZE
            || devices != num_devices
        {
            return Err(anyhow!("invalid hash table cache header"));
        }
        if mmap.len() < CACHE_HDR_SIZE + num_entries * HashEntry::SIZE {
            return Err(anyhow!(
                "hash table cache is truncated: {} entries declared",
                num_entries
            ));
        }

        self.backing = Some(Backing::Mapped {
            mmap,
            count: num_entries,
        });
        Ok(())
    }

    fn entry_at(&self, idx: usize) -> HashEntry {
        match &self.backing {
            Some(Backing::Owned(v)) => v[idx],
            Some(Backing::Mapped { mmap, count }) => {
                debug_assert!(idx < *count);
                let off = CACHE_HDR_SIZE + idx * HashEntry::SIZE;
                HashEntry::parse(&mmap[off..off + HashEntry::SIZE])
            }
            None => unreachable!(),
        }
    }

    /// Бинарный поиск по дайджесту.
    pub fn find_hash(&self, needle: &Digest) -> Option<HashEntry> {
        if self.backing.is_none() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.entry_at(mid).hash < *needle {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.len() {
            let e = self.entry_at(lo);
            if e.hash == *needle {
                return Some(e);
            }
        }
        None
    }

    /// Полный цикл загрузки: валидный кэш или CSV-файлы с последующим
    /// сохранением кэша. Кэш инвалидируется, если любой CSV новее.
    pub fn load(&mut self, csv_fnames: &[&Path], cache_fname: &Path) -> Result<()> {
        let num_devices = csv_fnames.len() as u64;

        let mut use_cache = cache_fname.exists();
        if use_cache {
            let cache_mtime = std::fs::metadata(cache_fname)?.modified()?;
            for csv in csv_fnames {
                if let Ok(meta) = std::fs::metadata(csv) {
                    if meta.modified()? > cache_mtime {
                        info!(
                            "exHT: {} is newer than {}, ignoring cache",
                            csv.display(),
                            cache_fname.display()
                        );
                        use_cache = false;
                        break;
                    }
                }
            }
        }

        if use_cache {
            match self.load_from_cache(cache_fname, num_devices) {
                Ok(()) => {
                    info!("exHT: loaded {} entries from {}", self.len(), cache_fname.display());
                    return Ok(());
                }
                Err(e) => warn!("exHT: cache rejected: {}", e),
            }
        }

        for (i, csv) in csv_fnames.iter().enumerate() {
            info!("exHT: loading {} ...", csv.display());
            let n = self.load_from_text_file(csv, i as u8)?;
            info!("exHT: loaded {} entries from {}", n, csv.display());
        }
        self.sort_entries()?;
        info!("exHT: total {} unique entries", self.len());
        self.save_to_cache(cache_fname, num_devices)?;
        info!("exHT: {} saved successfully", cache_fname.display());
        Ok(())
    }
}
