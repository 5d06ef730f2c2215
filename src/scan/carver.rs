//! Плоский карвер: побайтовый проход по образу в поисках LZ4-блоков и
//! сигнатур пустого блока.
//!
//! В отличие от сканера, не предполагает ни 4К-выравнивания, ни живых
//! структур контейнера — только сигнатуры. Результаты: "<base>.csv"
//! со строками offset;comp_size;orig_size;md5;crc и "<base>-meta.csv"
//! со строками "M;offset" для каждого вхождения EMPTY_BLOCK_DIGEST.

use anyhow::{Context, Result};
use log::info;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::consts::{BLOCK_SIZE, EMPTY_BLOCK_DIGEST, LZ_HDR_SIZE};
use crate::io::Reader;
use crate::progress::Progress;
use crate::util::vcrc32;
use crate::vbk::block::LzHdr;
use crate::vbk::digest::{md5_digest, Digest};

use super::lz4part;

const CARVER_CHUNK: usize = 8 * 1024 * 1024;

pub struct Carver {
    fname: PathBuf,
    start_offset: u64,
    find_data_blocks: bool,
    find_empty_blocks: bool,
    out_csv: File,
    out_meta_csv: File,
    n_data_blocks: u64,
    n_empty_blocks: u64,
}

impl Carver {
    pub fn new(
        fname: &Path,
        start_offset: u64,
        out_base: &Path,
        find_data_blocks: bool,
        find_empty_blocks: bool,
    ) -> Result<Carver> {
        let meta_path = {
            let base = out_base.to_string_lossy();
            let stem = base.rsplit_once('.').map(|(s, _)| s.to_string()).unwrap_or_else(|| base.into_owned());
            PathBuf::from(format!("{}-meta.csv", stem))
        };

        Ok(Carver {
            fname: fname.to_path_buf(),
            start_offset,
            find_data_blocks,
            find_empty_blocks,
            out_csv: File::create(out_base)
                .with_context(|| format!("create {}", out_base.display()))?,
            out_meta_csv: File::create(&meta_path)
                .with_context(|| format!("create {}", meta_path.display()))?,
            n_data_blocks: 0,
            n_empty_blocks: 0,
        })
    }

    pub fn data_blocks_found(&self) -> u64 {
        self.n_data_blocks
    }

    pub fn empty_blocks_found(&self) -> u64 {
        self.n_empty_blocks
    }

    pub fn process(&mut self) -> Result<()> {
        let reader = Reader::open(&self.fname)?;
        let mut progress = Progress::new(reader.size(), self.start_offset);

        // перекрытие, чтобы ловить сигнатуры на границе чанков
        let overlap = lz4part::compress_bound(BLOCK_SIZE) + LZ_HDR_SIZE;
        let mut buf = vec![0u8; CARVER_CHUNK + overlap];

        let mut pos = self.start_offset;
        while pos < reader.size() {
            let nread = reader.read_at(pos, &mut buf)?;
            if nread == 0 {
                break;
            }
            let usable = nread.min(CARVER_CHUNK);

            let mut i = 0usize;
            while i < usable {
                if self.find_data_blocks {
                    if let Some(hdr) = LzHdr::parse(&buf[i..]) {
                        if hdr.valid() {
                            self.try_lz4_block(&buf[i..nread], pos + i as u64, &hdr)?;
                        }
                    }
                }
                if self.find_empty_blocks && i + 16 <= nread {
                    let d = Digest::from_bytes(&buf[i..i + 16]);
                    if d.0 == EMPTY_BLOCK_DIGEST {
                        writeln!(self.out_meta_csv, "M;{:012x}", pos + i as u64)?;
                        self.n_empty_blocks += 1;
                        progress.found("empty");
                    }
                }
                i += 1;
            }

            pos += usable as u64;
            progress.update(pos);
        }

        progress.finish();
        self.out_csv.flush()?;
        self.out_meta_csv.flush()?;
        info!(
            "carver: {} data block{}, {} empty-digest sighting{}",
            self.n_data_blocks,
            if self.n_data_blocks == 1 { "" } else { "s" },
            self.n_empty_blocks,
            if self.n_empty_blocks == 1 { "" } else { "s" }
        );
        Ok(())
    }

    fn try_lz4_block(&mut self, window: &[u8], offset: u64, hdr: &LzHdr) -> Result<()> {
        if window.len() <= LZ_HDR_SIZE {
            return Ok(());
        }
        let Ok((out, consumed)) =
            lz4part::decompress_partial(&window[LZ_HDR_SIZE..], hdr.src_size as usize)
        else {
            return Ok(());
        };
        if out.len() != hdr.src_size as usize {
            return Ok(());
        }
        if vcrc32(0, &out) != hdr.crc {
            return Ok(());
        }

        writeln!(
            self.out_csv,
            "{:012x};{:06x};{:06x};{};{:08x}",
            offset,
            consumed,
            out.len(),
            md5_digest(&out),
            hdr.crc
        )?;
        self.n_data_blocks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn tmp_path(tag: &str, ext: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("qvbk-carver-{}-{}.{}", tag, nanos, ext))
    }

    #[test]
    fn carves_lz4_and_empty_digests() {
        use crate::consts::LZ_START_MAGIC;

        // образ: мусор, LZ4-блок на невыровненном смещении, сигнатура
        // пустого блока, ещё мусор
        let payload: Vec<u8> = (0..4000u32).flat_map(|i| (i % 100).to_le_bytes()).collect();
        let compressed = lz4_flex::block::compress(&payload);

        let mut image = vec![0x11u8; 777];
        let block_offset = image.len() as u64;
        let mut hdr_buf = [0u8; LZ_HDR_SIZE];
        LzHdr {
            magic: LZ_START_MAGIC,
            crc: vcrc32(0, &payload),
            src_size: payload.len() as u32,
        }
        .write_to(&mut hdr_buf);
        image.extend_from_slice(&hdr_buf);
        image.extend_from_slice(&compressed);
        image.extend_from_slice(&[0x22u8; 333]);
        let empty_offset = image.len() as u64;
        image.extend_from_slice(&Digest(EMPTY_BLOCK_DIGEST).to_bytes());
        image.extend_from_slice(&[0x33u8; 100]);

        let img_path = tmp_path("img", "bin");
        std::fs::File::create(&img_path).unwrap().write_all(&image).unwrap();
        let csv_path = tmp_path("out", "csv");

        let mut carver = Carver::new(&img_path, 0, &csv_path, true, true).unwrap();
        carver.process().unwrap();
        assert_eq!(carver.data_blocks_found(), 1);
        assert_eq!(carver.empty_blocks_found(), 1);

        let csv = std::fs::read_to_string(&csv_path).unwrap();
        let line = csv.lines().next().unwrap();
        let fields: Vec<&str> = line.split(';').collect();
        assert_eq!(u64::from_str_radix(fields[0], 16).unwrap(), block_offset);
        assert_eq!(usize::from_str_radix(fields[1], 16).unwrap(), compressed.len());
        assert_eq!(usize::from_str_radix(fields[2], 16).unwrap(), payload.len());
        assert_eq!(fields[3], md5_digest(&payload).to_string());

        let meta_path = csv_path.with_file_name(
            csv_path
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .into_owned()
                + "-meta.csv",
        );
        let meta = std::fs::read_to_string(&meta_path).unwrap();
        assert_eq!(meta.trim(), format!("M;{:012x}", empty_offset));

        std::fs::remove_file(&img_path).unwrap();
        std::fs::remove_file(&csv_path).unwrap();
        std::fs::remove_file(&meta_path).unwrap();
    }
}
