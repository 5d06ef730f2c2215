//! Writer с поддержкой разреженных файлов: seek за конец вместо записи
//! нулей. Большие записи режутся на гигабайтные куски.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

const CHUNK_SIZE: usize = 1 << 30; // 1 GiB

pub struct Writer {
    fname: PathBuf,
    file: File,
}

impl Writer {
    /// `truncate=false` — дозапись поверх существующего файла
    /// (resume, обновление synthesized slot).
    pub fn create(fname: &Path, truncate: bool) -> Result<Writer> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(fname)
            .with_context(|| format!("create {}", fname.display()))?;
        Ok(Writer {
            fname: fname.to_path_buf(),
            file,
        })
    }

    pub fn fname(&self) -> &Path {
        &self.fname
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek {} to {:#x}", self.fname.display(), offset))?;
        Ok(())
    }

    pub fn seek_cur(&mut self, delta: i64) -> Result<()> {
        self.file
            .seek(SeekFrom::Current(delta))
            .with_context(|| format!("seek {} by {:#x}", self.fname.display(), delta))?;
        Ok(())
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(CHUNK_SIZE) {
            self.file
                .write_all(chunk)
                .with_context(|| format!("write {} bytes to {}", chunk.len(), self.fname.display()))?;
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.seek(offset)?;
        self.write(buf)
    }

    /// Гарантирует, что файл не короче текущей позиции (после seek'ов
    /// в хвосте дыра остаётся разреженной).
    pub fn extend_to_cursor(&mut self) -> Result<()> {
        let pos = self.tell()?;
        let len = self.file.metadata()?.len();
        if len < pos {
            self.file
                .set_len(pos)
                .map_err(|e| anyhow!("set_len {} to {:#x}: {}", self.fname.display(), pos, e))?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
