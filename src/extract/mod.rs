//! Extract/test: обход блоков логического файла, материализация
//! (чтение -> расшифровка -> декомпрессия -> проверка) и запись в
//! разреженный файл либо только подсчёт статистики.
//!
//! Ошибки уровня блока никогда не роняют файл: они считаются в
//! FileTestInfo, цикл идёт дальше. Единственное фатальное исключение —
//! RLE-компрессия, которой в природе не встречается.

pub mod stats;

use anyhow::{anyhow, Result};
use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;

use crate::consts::{BLOCK_SIZE, PAGE_SIZE};
use crate::hashtable::HashTable;
use crate::io::{Reader, Writer};
use crate::lru_set::LruSet;
use crate::meta::CMeta;
use crate::units::{bytes2human, bytes2human_full};
use crate::util::{get_out_pathname, is_glob, sanitize_fname, simple_glob_match, vcrc32};
use crate::vbk::block::{LzHdr, VBlockDesc};
use crate::vbk::block_desc::{BlockDescriptor, BlockDescriptors, BlockLocation, CompType};
use crate::vbk::digest::{md5_digest, Digest};
use crate::vbk::dir_item::VFile;
use crate::vbk::ppi::{PhysPageId, DEFAULT_DATASTORE_PPI, INVALID_PPI};

pub use stats::FileTestInfo;

const BLOCK_CACHE_CAPACITY: usize = 0x10000;

/// Параметры сессии extract/test.
pub struct ExtractOptions {
    pub md_fname: PathBuf,
    pub out_dir: Option<PathBuf>,
    pub json_fname: Option<PathBuf>,
    /// Фильтр: имя, полный путь или glob; пустая строка — все файлы.
    pub xname: String,
    /// Фильтр по PPI (сильнее xname).
    pub needle_ppi: PhysPageId,
    pub test_only: bool,
    /// Не читать данные, только проверять наличие в хэш-таблице.
    pub no_read: bool,
    pub resume: bool,
    /// База контейнера (например, начало раздела на физическом диске).
    pub vbk_offset: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            md_fname: PathBuf::new(),
            out_dir: None,
            json_fname: None,
            xname: String::new(),
            needle_ppi: INVALID_PPI,
            test_only: false,
            no_read: false,
            resume: false,
            vbk_offset: 0,
        }
    }
}

pub struct ExtractContext<'a> {
    meta: &'a CMeta,
    vbkf: Option<Reader>,
    ex_ht: &'a HashTable,
    device_files: Vec<Reader>,
    opts: ExtractOptions,

    bds: BlockDescriptors,
    used_bds: HashSet<Digest>,
    cache: LruSet<Digest>,
    /// Хоть один файл прошёл фильтр.
    pub found: bool,
}

impl<'a> ExtractContext<'a> {
    pub fn new(
        meta: &'a CMeta,
        vbkf: Option<Reader>,
        ex_ht: &'a HashTable,
        device_files: Vec<Reader>,
        opts: ExtractOptions,
    ) -> Result<ExtractContext<'a>> {
        let bds = meta.read_datastore(DEFAULT_DATASTORE_PPI)?;
        if bds.is_empty() {
            warn!("loaded 0 BlockDescriptors from HT");
        } else {
            info!("loaded {} BlockDescriptors from HT", bds.len());
        }

        Ok(ExtractContext {
            meta,
            vbkf,
            ex_ht,
            device_files,
            opts,
            bds,
            used_bds: HashSet::new(),
            cache: LruSet::new(BLOCK_CACHE_CAPACITY),
            found: false,
        })
    }

    fn have_vbk(&self) -> bool {
        self.vbkf.is_some()
    }

    fn matches_filter(&self, pathname: &str, vfi: &VFile) -> bool {
        if self.opts.needle_ppi.valid() {
            return vfi.attribs.ppi == self.opts.needle_ppi;
        }
        if self.opts.xname.is_empty() {
            return true;
        }
        if is_glob(&self.opts.xname) {
            return simple_glob_match(&self.opts.xname, pathname);
        }
        if self.opts.xname.contains('/') {
            return pathname == self.opts.xname;
        }
        let short = pathname.rsplit('/').next().unwrap_or(pathname);
        short == self.opts.xname
    }

    /// Обработка одного логического файла; ошибки уровня блока
    /// аккумулируются в статистике.
    pub fn process_file(&mut self, pathname: &str, vfi: &VFile) -> Result<()> {
        if vfi.is_dir() || !self.matches_filter(pathname, vfi) {
            return Ok(());
        }
        self.found = true;

        let mut fti = FileTestInfo::new(vfi, pathname, &self.opts.md_fname);

        let out_fname = if self.opts.test_only {
            None
        } else {
            Some(get_out_pathname(
                &self.opts.md_fname,
                &sanitize_fname(pathname),
                self.opts.out_dir.as_deref(),
            )?)
        };

        info!(
            "{} {} = {} blocks, {}",
            if self.opts.test_only { "Testing" } else { "Extracting" },
            vfi.name,
            vfi.attribs.n_blocks,
            bytes2human_full(vfi.attribs.filesize.max(0) as u64, " bytes", 1)
        );

        let mut should_truncate = !vfi.is_diff();
        let mut blocks_to_skip = 0usize;

        if self.opts.resume {
            if let Some(out_fname) = &out_fname {
                if out_fname.exists() {
                    let existing_size = std::fs::metadata(out_fname)?.len();
                    let existing_blocks = (existing_size / BLOCK_SIZE as u64) as usize;
                    blocks_to_skip = existing_blocks.saturating_sub(2);
                    if blocks_to_skip > 0 {
                        should_truncate = false;
                    }
                    info!(
                        "resuming extraction: skipping {} blocks, overwriting last 2 for alignment",
                        blocks_to_skip
                    );

                    // засеять счётчики по уже выгруженной части
                    let prev = self.meta.get_file_blocks(vfi);
                    let skipped_sparse = prev
                        .iter()
                        .take(blocks_to_skip)
                        .filter(|b| b.is_empty() || b.is_sparse())
                        .count();
                    fti.n_ok = (blocks_to_skip - skipped_sparse) as u64;
                    fti.sparse_blocks = skipped_sparse as u64;
                }
            }
        }

        let mut writer = match &out_fname {
            Some(out_fname) => {
                if vfi.is_diff() && !out_fname.exists() {
                    warn!(
                        "{} type is \"{}\" but base file doesn't exist",
                        vfi.name,
                        vfi.type_str()
                    );
                }
                let mut w = Writer::create(out_fname, should_truncate)?;
                if blocks_to_skip > 0 {
                    w.seek(blocks_to_skip as u64 * BLOCK_SIZE as u64)?;
                }
                Some(w)
            }
            None => None,
        };

        let blocks = self.meta.get_file_blocks(vfi);
        if blocks.len() > fti.total_blocks as usize {
            warn!(
                "collected blocks {:x} > declared nBlocks {:x}",
                blocks.len(),
                fti.total_blocks
            );
        } else {
            fti.n_miss_md = fti.total_blocks - blocks.len() as u64;
        }

        let mut remaining: i64 = vfi.attribs.filesize;
        let mut actual_written: u64 = 0;
        // кэш последнего чтения: подряд идущие одинаковые блоки не перечитываются
        let mut read_buf: Vec<u8> = Vec::new();
        let mut prev_pos: u64 = 0;
        let mut prev_device: u8 = u8::MAX;

        for (i, blk) in blocks.iter().enumerate() {
            if i < blocks_to_skip {
                continue;
            }
            trace!("block #{:06x}: {}", i, blk);

            let skip_size = self.process_block(
                i,
                blk,
                vfi,
                &mut fti,
                writer.as_mut(),
                &mut remaining,
                &mut actual_written,
                &mut read_buf,
                &mut prev_pos,
                &mut prev_device,
            )?;

            if skip_size > 0 {
                if let Some(w) = writer.as_mut() {
                    // seek вместо записи нулей: выходной файл разреженный
                    w.seek_cur(skip_size as i64)?;
                }
                remaining -= skip_size as i64;
            }
        }

        println!("{}", FileTestInfo::header());
        println!("{}", fti);

        if remaining > 0 && !vfi.is_diff() {
            warn!("remaining size {:x} > 0", remaining);
        }

        if let Some(w) = writer.as_mut() {
            w.extend_to_cursor()?;
            let tell = w.tell()?;
            if tell == actual_written {
                info!(
                    "saved {} to \"{}\"",
                    bytes2human_full(actual_written, " bytes", 1),
                    w.fname().display()
                );
            } else {
                info!(
                    "saved apparent {}, actual {} to \"{}\"",
                    bytes2human_full(tell, " bytes", 1),
                    bytes2human_full(actual_written, " bytes", 1),
                    w.fname().display()
                );
            }
        }

        if let Some(json_fname) = &self.opts.json_fname {
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(json_fname)?;
            writeln!(f, "{}", fti.to_json())?;
        }

        Ok(())
    }

    /// Возвращает размер, на который нужно продвинуть writer seek'ом
    /// (0 — блок записан или учтён иначе).
    #[allow(clippy::too_many_arguments)]
    fn process_block(
        &mut self,
        i: usize,
        blk: &VBlockDesc,
        vfi: &VFile,
        fti: &mut FileTestInfo,
        mut writer: Option<&mut Writer>,
        remaining: &mut i64,
        actual_written: &mut u64,
        read_buf: &mut Vec<u8>,
        prev_pos: &mut u64,
        prev_device: &mut u8,
    ) -> Result<usize> {
        // разреженный блок: ни поиска, ни чтения
        if blk.is_empty() {
            fti.sparse_blocks += 1;
            return Ok(BLOCK_SIZE);
        }

        // дескриптор: датастор либо минимальный каркас под запись exHT
        let blk_desc = match self.bds.get(&blk.digest) {
            Some(bd) => {
                self.used_bds.insert(blk.digest);
                *bd
            }
            None if self.ex_ht.is_loaded() => {
                debug!("block #{:x} not found in BDs, using exHT: {}", i, blk);
                BlockDescriptor {
                    location_raw: BlockLocation::BlockInBlob as u8,
                    digest: blk.digest,
                    comp_type_raw: CompType::None.to_u8(),
                    src_size: BLOCK_SIZE as u32,
                    ..BlockDescriptor::default()
                }
            }
            None => {
                warn!("block #{:x} not found in HT: {}", i, blk);
                fti.n_miss_ht += 1;
                return Ok(BLOCK_SIZE);
            }
        };

        if let Some(w) = writer.as_mut() {
            if vfi.is_diff() && blk.is_patch() {
                // патч-блок ложится по своему абсолютному смещению
                w.seek(blk.vib_offset * BLOCK_SIZE as u64)?;
            }
        }

        // эффективные поля могут быть переопределены строкой exHT
        let mut pos = blk_desc.offset;
        let mut cur_device: u8 = u8::MAX;
        let mut comp_type = blk_desc.comp_type();
        let mut alloc_size = blk_desc.alloc_size as usize;
        let mut comp_size = blk_desc.comp_size as usize;
        let mut keyset_id = blk_desc.keyset_id;

        if self.ex_ht.is_loaded() {
            let Some(row) = self.ex_ht.find_hash(&blk_desc.digest) else {
                warn!("exHT: {} not found", blk_desc);
                fti.n_miss_ht += 1;
                return Ok(BLOCK_SIZE);
            };
            pos = row.offset;
            comp_type = Some(row.comp_type());
            alloc_size = row.comp_size as usize
                + if row.comp_type() == CompType::Lz4 {
                    LzHdr::SIZE
                } else {
                    0
                };
            if !row.keyset_id.is_zero() {
                alloc_size = alloc_size + 0x10 - (alloc_size % 0x10);
            }
            comp_size = alloc_size;
            keyset_id = row.keyset_id;
            cur_device = row.device_index;
        }

        // test-only: блок с уже доказанным дайджестом не перечитываем
        if (self.opts.test_only && self.cache.contains(&blk.digest))
            || (!self.have_vbk() && self.device_files.is_empty())
        {
            fti.n_ok += 1;
            return Ok(BLOCK_SIZE);
        }
        if self.opts.no_read && !self.device_files.is_empty() {
            fti.n_ok += 1;
            return Ok(BLOCK_SIZE);
        }

        let reader: &Reader = if self.have_vbk() {
            self.vbkf.as_ref().expect("have_vbk")
        } else {
            self.device_files
                .get(cur_device as usize)
                .ok_or_else(|| anyhow!("device index {} out of range", cur_device))?
        };

        // повтор той же (позиции, размера, устройства) — читать не нужно
        if *prev_pos == 0
            || pos != *prev_pos
            || alloc_size != read_buf.len()
            || (!self.have_vbk() && !self.device_files.is_empty() && *prev_device != cur_device)
        {
            read_buf.resize(alloc_size, 0);
            let nread = match reader.read_at(self.opts.vbk_offset + pos, read_buf) {
                Ok(n) => n,
                Err(e) => {
                    error!("read error at {:012x}: {}", self.opts.vbk_offset + pos, e);
                    fti.n_read_err += 1;
                    *prev_pos = 0;
                    return Ok(BLOCK_SIZE);
                }
            };
            if nread != alloc_size {
                error!(
                    "read error at {:012x}: nread={:x}, want={:x}",
                    self.opts.vbk_offset + pos,
                    nread,
                    alloc_size
                );
                fti.n_read_err += 1;
                *prev_pos = 0;
                return Ok(BLOCK_SIZE);
            }

            if !keyset_id.is_zero() {
                read_buf.truncate(comp_size);
                let Some(cipher) = self.meta.get_aes_cipher(&keyset_id) else {
                    warn!("block #{:x}: missing keyset {}", i, keyset_id);
                    fti.n_miss_ht += 1;
                    *prev_pos = 0;
                    return Ok(BLOCK_SIZE);
                };
                if let Err(e) = cipher.decrypt(read_buf, true) {
                    warn!("block #{:x}: decrypt failed: {}", i, e);
                    fti.n_err_decomp += 1;
                    *prev_pos = 0;
                    return Ok(BLOCK_SIZE);
                }
            }
            *prev_pos = pos;
            *prev_device = cur_device;
        }

        let comp_type = match comp_type {
            Some(ct) => ct,
            None => {
                error!("unknown compression mode {:02x}", blk_desc.comp_type_raw);
                return Ok(BLOCK_SIZE);
            }
        };

        match comp_type {
            CompType::None => {
                let to_write = clamp_write(read_buf.len(), *remaining);
                if let Some(w) = writer.as_mut() {
                    w.write(&read_buf[..to_write])?;
                }
                *actual_written += to_write as u64;
                *remaining -= to_write as i64;
                fti.n_ok += 1;
                self.cache.insert(blk_desc.digest);
                Ok(0)
            }

            CompType::Lz4 => {
                let Some(hdr) = LzHdr::parse(read_buf) else {
                    warn!("{:08x}: LZ4 header is truncated", pos);
                    fti.n_err_decomp += 1;
                    return Ok(BLOCK_SIZE);
                };
                if !hdr.valid() {
                    warn!("{:08x}: LZ4 magic mismatch", pos);
                    fti.n_err_decomp += 1;
                    return Ok(BLOCK_SIZE);
                }

                let comp_len = if !keyset_id.is_zero() {
                    read_buf.len().saturating_sub(LzHdr::SIZE)
                } else {
                    comp_size.saturating_sub(LzHdr::SIZE)
                };
                let comp_len = comp_len.min(read_buf.len() - LzHdr::SIZE);

                match lz4_flex::block::decompress(
                    &read_buf[LzHdr::SIZE..LzHdr::SIZE + comp_len],
                    hdr.src_size as usize,
                ) {
                    Ok(out) if out.len() == hdr.src_size as usize => {
                        let to_write = clamp_write(out.len(), *remaining);
                        if let Some(w) = writer.as_mut() {
                            w.write(&out[..to_write])?;
                        }
                        *actual_written += to_write as u64;
                        *remaining -= to_write as i64;

                        let crc = vcrc32(0, &out);
                        if crc != hdr.crc {
                            error!(
                                "invalid CRC: expected {:08x}, actual {:08x} - {}",
                                hdr.crc, crc, blk_desc
                            );
                            fti.n_err_crc += 1;
                        } else {
                            fti.n_ok += 1;
                            self.cache.insert(blk_desc.digest);
                        }
                        Ok(0)
                    }
                    Ok(out) => {
                        error!(
                            "LZ4 size mismatch: {:x} != {:x} - {}",
                            out.len(),
                            hdr.src_size,
                            blk_desc
                        );
                        fti.n_err_decomp += 1;
                        Ok(BLOCK_SIZE)
                    }
                    Err(e) => {
                        error!("LZ4 failure: {} - {}", e, blk_desc);
                        fti.n_err_decomp += 1;
                        Ok(BLOCK_SIZE)
                    }
                }
            }

            CompType::ZlibHi | CompType::ZlibLo => {
                let output_cap = (blk_desc.src_size as usize).min(BLOCK_SIZE).max(1);
                let mut out = vec![0u8; output_cap];
                let mut inflater = flate2::Decompress::new(true);
                match inflater.decompress(read_buf, &mut out, flate2::FlushDecompress::Finish) {
                    Ok(flate2::Status::StreamEnd) => {
                        let n = inflater.total_out() as usize;
                        out.truncate(n);
                        if md5_digest(&out) == blk_desc.digest {
                            let to_write = clamp_write(out.len(), *remaining);
                            if let Some(w) = writer.as_mut() {
                                w.write(&out[..to_write])?;
                            }
                            *actual_written += to_write as u64;
                            *remaining -= to_write as i64;
                            fti.n_ok += 1;
                            self.cache.insert(blk_desc.digest);
                            Ok(0)
                        } else {
                            warn!("zlib inflate succeeded, but md5 mismatch: {}", blk_desc);
                            fti.n_err_decomp += 1;
                            Ok(BLOCK_SIZE)
                        }
                    }
                    other => {
                        warn!("zlib inflate failed ({:?}): {}", other, blk_desc);
                        fti.n_err_decomp += 1;
                        Ok(BLOCK_SIZE)
                    }
                }
            }

            CompType::Zstd3 | CompType::Zstd9 => {
                let output_cap = if blk_desc.src_size != 0 {
                    (blk_desc.src_size as usize).min(BLOCK_SIZE)
                } else {
                    BLOCK_SIZE
                };
                match zstd_decompress_frame(read_buf, output_cap) {
                    Ok(out) => {
                        if md5_digest(&out) == blk_desc.digest {
                            let to_write = clamp_write(out.len(), *remaining);
                            if let Some(w) = writer.as_mut() {
                                w.write(&out[..to_write])?;
                            }
                            *actual_written += to_write as u64;
                            *remaining -= to_write as i64;
                            fti.n_ok += 1;
                            self.cache.insert(blk_desc.digest);
                            Ok(0)
                        } else {
                            warn!("zstd decompress succeeded, but md5 mismatch: {}", blk_desc);
                            fti.n_err_decomp += 1;
                            Ok(BLOCK_SIZE)
                        }
                    }
                    Err(e) => {
                        warn!("zstd decompress failed: {} - {}", e, blk_desc);
                        fti.n_err_decomp += 1;
                        Ok(BLOCK_SIZE)
                    }
                }
            }

            CompType::Rle => Err(anyhow!("RLE decompression not implemented")),
        }
    }

    /// Суммарный срез по использованным дескрипторам: неиспользованные
    /// байты датастора означают потерянные записи каталога.
    pub fn report_unused(&self) {
        if self.bds.len() != self.used_bds.len() {
            let unused = self.bds.len() - self.used_bds.len();
            info!("used {} of {} BDs, unused: {}", self.used_bds.len(), self.bds.len(), unused);
            if self.opts.xname.is_empty() && !self.opts.needle_ppi.valid() {
                warn!(
                    "{} of data is not claimed, some dir entries might be missing. try --deep option",
                    bytes2human((unused * BLOCK_SIZE) as u64)
                );
            }
        }
    }
}

fn clamp_write(len: usize, remaining: i64) -> usize {
    if remaining > 0 && (remaining as u64) < len as u64 {
        remaining as usize
    } else {
        len
    }
}

/// Один zstd-фрейм, хвостовой мусор за фреймом игнорируется.
fn zstd_decompress_frame(input: &[u8], output_cap: usize) -> Result<Vec<u8>> {
    use std::io::Read as _;
    let decoder = zstd::stream::read::Decoder::new(input)?.single_frame();
    let mut out = Vec::with_capacity(output_cap.min(PAGE_SIZE));
    decoder
        .take(output_cap as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| anyhow!("zstd: {}", e))?;
    if out.len() > output_cap {
        return Err(anyhow!("zstd output exceeds {:#x}", output_cap));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_write_respects_remaining() {
        assert_eq!(clamp_write(100, 1000), 100);
        assert_eq!(clamp_write(100, 40), 40);
        assert_eq!(clamp_write(100, 0), 100); // remaining уже исчерпан — пишем как есть
        assert_eq!(clamp_write(100, -5), 100);
    }

    #[test]
    fn zstd_frame_roundtrip() {
        let data = vec![7u8; 0x2000];
        let mut compressed = zstd::stream::encode_all(&data[..], 3).unwrap();
        compressed.extend_from_slice(b"trailing-garbage");
        let out = zstd_decompress_frame(&compressed, 0x2000).unwrap();
        assert_eq!(out, data);

        // переполнение лимита — ошибка
        assert!(zstd_decompress_frame(&compressed, 0x1000).is_err());
    }
}
