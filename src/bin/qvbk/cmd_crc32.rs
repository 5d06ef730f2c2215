use anyhow::Result;
use std::path::Path;

use QuiverVBK::io::Reader;
use QuiverVBK::util::vcrc32;

/// vcrc32 региона файла, по 8 МиБ за раз.
pub fn exec(fname: &Path, offset: u64, size: Option<u64>) -> Result<()> {
    let reader = Reader::open(fname)?;
    let size = size.unwrap_or_else(|| reader.size().saturating_sub(offset));

    let mut crc = 0u32;
    let mut buf = vec![0u8; 8 * 1024 * 1024];
    let mut pos = offset;
    let mut remain = size;
    while remain > 0 {
        let chunk = (buf.len() as u64).min(remain) as usize;
        let nread = reader.read_at(pos, &mut buf[..chunk])?;
        if nread == 0 {
            break;
        }
        crc = vcrc32(crc, &buf[..nread]);
        pos += nread as u64;
        remain -= nread as u64;
    }

    println!("{:08x}", crc);
    Ok(())
}
