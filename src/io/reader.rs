//! Универсальный reader: обычные файлы и блочные устройства (/dev/sdX).
//!
//! - позиционное чтение (read_at), потокобезопасное: на unix это pread,
//!   состояние курсора не используется;
//! - размер устройства берётся через ioctl (BLKGETSIZE64), обычного файла —
//!   через metadata;
//! - для устройств с обязательным секторным выравниванием чтение
//!   прозрачно округляется и вырезается нужный срез;
//! - ошибка чтения отличима от остальных (ReadError): в force-режиме
//!   вызывающий код может пройти посекторно и продолжить.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{FileExt, FileTypeExt};

/// Маркер ошибки чтения: по нему force-режим решает деградировать
/// в посекторный обход вместо аварийного завершения.
#[derive(Debug)]
pub struct ReadError(pub String);

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "read error: {}", self.0)
    }
}

impl std::error::Error for ReadError {}

#[derive(Debug)]
pub struct Reader {
    fname: PathBuf,
    file: File,
    size: u64,
    align: u64, // 0 = выравнивание не требуется
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64 = _IOR(0x12, 114, size_t)
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
    let mut size: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if rc == -1 {
        return Err(anyhow!(
            "ioctl(BLKGETSIZE64): {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> Result<u64> {
    Err(anyhow!("block device size detection is not supported here"))
}

impl Reader {
    pub fn open(fname: &Path) -> Result<Reader> {
        let file = File::open(fname).with_context(|| format!("open {}", fname.display()))?;

        let meta = file.metadata()?;
        #[cfg(unix)]
        let (size, align) = if meta.file_type().is_block_device() {
            // посекторное выравнивание нужно только сырым устройствам
            (block_device_size(&file)?, 512)
        } else {
            (meta.len(), 0)
        };
        #[cfg(not(unix))]
        let (size, align) = (meta.len(), 0u64);

        Ok(Reader {
            fname: fname.to_path_buf(),
            file,
            size,
            align,
        })
    }

    /// Размер файла/устройства без открытия Reader.
    pub fn get_size(fname: &Path) -> Result<u64> {
        Reader::open(fname).map(|r| r.size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn align(&self) -> u64 {
        self.align
    }

    pub fn fname(&self) -> &Path {
        &self.fname
    }

    /// Позиционное чтение. Возвращает число прочитанных байт: короткое
    /// чтение валидно на границе EOF, за EOF возвращается 0.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        if self.align != 0 && (offset % self.align != 0 || buf.len() as u64 % self.align != 0) {
            return self.read_at_unaligned(offset, buf);
        }

        let mut total = 0usize;
        while total < buf.len() {
            let n = self
                .read_once(&mut buf[total..], offset + total as u64)
                .map_err(|e| {
                    anyhow!(ReadError(format!(
                        "{} @ {:#x}+{:#x}: {}",
                        self.fname.display(),
                        offset,
                        total,
                        e
                    )))
                })?;
            if n == 0 {
                break; // EOF
            }
            total += n;
        }
        Ok(total)
    }

    /// Чтение с выравниванием: округлить вниз/вверх до сектора, прочитать
    /// во временный буфер, скопировать нужный срез.
    fn read_at_unaligned(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let shift = (offset % self.align) as usize;
        let padded = (buf.len() + shift + self.align as usize * 2 - 1) & !(self.align as usize - 1);
        let mut tmp = vec![0u8; padded];
        let nread = self.read_at(offset - shift as u64, &mut tmp)?;
        let avail = nread.saturating_sub(shift);
        let count = buf.len().min(avail);
        buf[..count].copy_from_slice(&tmp[shift..shift + count]);
        Ok(count)
    }

    #[cfg(unix)]
    fn read_once(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_once(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        // нет pread — сериализуем курсором (Reader не шарится между
        // потоками на этих платформах)
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset))?;
        f.read(buf)
    }

    /// Удобный вариант: строго `count` байт или ошибка Truncated.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(anyhow!(
                "truncated read at {:#x}: {:#x} < {:#x}",
                offset,
                n,
                buf.len()
            ));
        }
        Ok(())
    }
}

/// Ошибка — именно чтение (а не открытие/структура)?
pub fn is_read_error(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<ReadError>().is_some())
        || err.downcast_ref::<ReadError>().is_some()
}
