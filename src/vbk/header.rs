//! FileHeader — первые 4 КиБ контейнера.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::{BANK_INFO_SIZE, MAX_DIGEST_TYPE_LEN, MAX_SLOT_FMT, PAGE_SIZE};

#[derive(Clone)]
pub struct FileHeader {
    pub version: u32,
    pub inited: u32,
    pub digest_type_len: u32,
    pub digest_type: Vec<u8>, // до 251 байт ASCII
    pub slot_fmt: u32,
    pub std_block_size: u32,
    pub cluster_align: u32,
}

// упакованные смещения: digest_type занимает MAX_DIGEST_TYPE_LEN+1 байт
const OFF_SLOT_FMT: usize = 12 + MAX_DIGEST_TYPE_LEN + 1;

impl FileHeader {
    pub fn parse(buf: &[u8]) -> Option<FileHeader> {
        if buf.len() < OFF_SLOT_FMT + 12 {
            return None;
        }
        Some(FileHeader {
            version: LittleEndian::read_u32(&buf[0..4]),
            inited: LittleEndian::read_u32(&buf[4..8]),
            digest_type_len: LittleEndian::read_u32(&buf[8..12]),
            digest_type: buf[12..12 + MAX_DIGEST_TYPE_LEN + 1].to_vec(),
            slot_fmt: LittleEndian::read_u32(&buf[OFF_SLOT_FMT..OFF_SLOT_FMT + 4]),
            std_block_size: LittleEndian::read_u32(&buf[OFF_SLOT_FMT + 4..OFF_SLOT_FMT + 8]),
            cluster_align: LittleEndian::read_u32(&buf[OFF_SLOT_FMT + 8..OFF_SLOT_FMT + 12]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.version);
        LittleEndian::write_u32(&mut buf[4..8], self.inited);
        LittleEndian::write_u32(&mut buf[8..12], self.digest_type_len);
        let n = self.digest_type.len().min(MAX_DIGEST_TYPE_LEN + 1);
        buf[12..12 + n].copy_from_slice(&self.digest_type[..n]);
        LittleEndian::write_u32(&mut buf[OFF_SLOT_FMT..OFF_SLOT_FMT + 4], self.slot_fmt);
        LittleEndian::write_u32(
            &mut buf[OFF_SLOT_FMT + 4..OFF_SLOT_FMT + 8],
            self.std_block_size,
        );
        LittleEndian::write_u32(
            &mut buf[OFF_SLOT_FMT + 8..OFF_SLOT_FMT + 12],
            self.cluster_align,
        );
    }

    pub fn max_banks(&self) -> usize {
        match self.slot_fmt {
            0 => 0xf8,
            5 | 9 => 0x7f00,
            _ => 0,
        }
    }

    /// Выражение дословно из реверса; BankInfo = 16 байт.
    pub fn slot_size(&self) -> usize {
        ((((self.max_banks() * BANK_INFO_SIZE) & 0xFFFF_FFF0) + 120) & 0xFFFF_F000) + PAGE_SIZE
    }

    /// Поддерживается только дайджест "md5".
    pub fn valid(&self) -> bool {
        self.inited <= 1
            && self.version != 0
            && self.digest_type_len == 3
            && self.digest_type.get(..3) == Some(b"md5".as_slice())
            && self.std_block_size != 0
            && self.std_block_size % 512 == 0
            && self.cluster_align != 0
            && self.slot_fmt <= MAX_SLOT_FMT
    }

    pub fn digest_type_str(&self) -> String {
        let end = self
            .digest_type
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.digest_type.len());
        String::from_utf8_lossy(&self.digest_type[..end]).into_owned()
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<FileHeader version: {:x}, inited: {:x}, digest_type_len: {:x}, digest_type: \"{}\", slot_fmt: {:x}, std_block_size: {:x}, cluster_align: {:x}>",
            self.version,
            self.inited,
            self.digest_type_len,
            self.digest_type_str(),
            self.slot_fmt,
            self.std_block_size,
            self.cluster_align
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::BLOCK_SIZE;

    pub fn sample_header(slot_fmt: u32) -> FileHeader {
        FileHeader {
            version: 0xd,
            inited: 1,
            digest_type_len: 3,
            digest_type: {
                let mut v = vec![0u8; MAX_DIGEST_TYPE_LEN + 1];
                v[..3].copy_from_slice(b"md5");
                v
            },
            slot_fmt,
            std_block_size: BLOCK_SIZE as u32,
            cluster_align: 9,
        }
    }

    #[test]
    fn roundtrip() {
        let hdr = sample_header(9);
        let mut buf = vec![0u8; PAGE_SIZE];
        hdr.write_to(&mut buf);
        let back = FileHeader::parse(&buf).unwrap();
        assert!(back.valid());
        assert_eq!(back.slot_fmt, 9);
        assert_eq!(back.digest_type_str(), "md5");
    }

    #[test]
    fn slot_sizes_per_fmt() {
        assert_eq!(sample_header(0).max_banks(), 0xf8);
        assert_eq!(sample_header(0).slot_size(), 0x1000);
        assert_eq!(sample_header(5).slot_size(), 0x80000);
        assert_eq!(sample_header(9).slot_size(), 0x80000);
    }

    #[test]
    fn rejects_non_md5() {
        let mut hdr = sample_header(9);
        hdr.digest_type[..3].copy_from_slice(b"sha");
        assert!(!hdr.valid());

        let mut hdr = sample_header(9);
        hdr.std_block_size = 511;
        assert!(!hdr.valid());

        let mut hdr = sample_header(10);
        hdr.slot_fmt = 10;
        assert!(!hdr.valid());
    }
}
