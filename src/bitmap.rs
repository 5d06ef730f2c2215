//! Битмап поверх файла (mmap): отметки «эта 4К-страница уже учтена».
//!
//! Раскладка MSB-first: бит 0 — старший бит нулевого байта. Файл создаётся
//! нужного размера, при повторном открытии размер обязан совпасть — иначе
//! это битмап от другого источника.

use anyhow::{anyhow, Context, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;

pub struct BitFileMappedArray {
    bit_size: u64,
    mmap: MmapMut,
}

impl BitFileMappedArray {
    pub fn open(fname: &Path, bits: u64) -> Result<Self> {
        let size_bytes = bits.div_ceil(8);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(fname)
            .with_context(|| format!("open bitmap {}", fname.display()))?;

        let cur_len = file.metadata()?.len();
        if cur_len == 0 {
            file.set_len(size_bytes)?;
        } else if cur_len != size_bytes {
            return Err(anyhow!(
                "bitmap {} size mismatch: have {:#x}, want {:#x}",
                fname.display(),
                cur_len,
                size_bytes
            ));
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mmap bitmap {}", fname.display()))?;

        Ok(Self {
            bit_size: bits,
            mmap,
        })
    }

    pub fn size_bits(&self) -> u64 {
        self.bit_size
    }

    pub fn get(&self, index: u64) -> Result<bool> {
        if index >= self.bit_size {
            return Err(anyhow!("bit index {} out of range {}", index, self.bit_size));
        }
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8) as u32;
        Ok(self.mmap[byte] & (1 << bit) != 0)
    }

    pub fn set(&mut self, index: u64, value: bool) -> Result<()> {
        if index >= self.bit_size {
            return Err(anyhow!("bit index {} out of range {}", index, self.bit_size));
        }
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8) as u32;
        if value {
            self.mmap[byte] |= 1 << bit;
        } else {
            self.mmap[byte] &= !(1 << bit);
        }
        Ok(())
    }

    /// Ставит в 1 все биты [start, end).
    pub fn set_range(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end || end > self.bit_size {
            return Err(anyhow!(
                "bad bit range {}..{} (size {})",
                start,
                end,
                self.bit_size
            ));
        }

        let start_byte = (start / 8) as usize;
        let end_byte = ((end - 1) / 8) as usize;

        if start_byte == end_byte {
            let mut mask = 0u8;
            for i in start..end {
                mask |= 1 << (7 - (i % 8));
            }
            self.mmap[start_byte] |= mask;
            return Ok(());
        }

        // частично заполненный первый байт
        let first_full = if start % 8 != 0 {
            let mask = 0xffu8 >> (start % 8);
            self.mmap[start_byte] |= mask;
            start_byte + 1
        } else {
            start_byte
        };

        // частично заполненный последний байт
        let last_full = if end % 8 != 0 {
            let mask = !(0xffu8 >> (end % 8));
            self.mmap[end_byte] |= mask;
            end_byte
        } else {
            end_byte + 1
        };

        for b in first_full..last_full {
            self.mmap[b] = 0xff;
        }
        Ok(())
    }
}
