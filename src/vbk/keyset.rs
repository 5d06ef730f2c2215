//! SKeySetRec и SRestoreRecBlob — записи криптохранилища.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::consts::KEYSET_REC_SIZE;
use crate::vbk::digest::Digest;
use crate::vbk::ppi::PhysPageId;

pub const KEYSET_MAGIC: u32 = 0xa110_ca2e; // "allocate"
pub const RESTORE_REC_MAGIC: u64 = u64::MAX;

/// Секунды между 1601-01-01 и 1970-01-01 (FILETIME -> unix).
const FILETIME_UNIX_DELTA: u64 = 11_644_473_600;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum KeyAlgo {
    Aes256Cbc,
    Rsa,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum KeyRole {
    Session = 1,     // блоками данных
    Storage = 2,     // метаданными
    Meta = 3,
    Enterprise = 4,
    User = 5,
    Archive = 6,
    // 7 не используется
    Policy = 8,      // приватный ключ RSA
    Agent = 9,       // промежуточный AES, расшифровывается RSA
    NasSession = 10,
    NasBackup = 11,
    KmsMaster = 12,
}

impl KeyRole {
    fn from_i32(v: i32) -> Option<KeyRole> {
        Some(match v {
            1 => KeyRole::Session,
            2 => KeyRole::Storage,
            3 => KeyRole::Meta,
            4 => KeyRole::Enterprise,
            5 => KeyRole::User,
            6 => KeyRole::Archive,
            8 => KeyRole::Policy,
            9 => KeyRole::Agent,
            10 => KeyRole::NasSession,
            11 => KeyRole::NasBackup,
            12 => KeyRole::KmsMaster,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyRole::Session => "session",
            KeyRole::Storage => "storage",
            KeyRole::Meta => "meta",
            KeyRole::Enterprise => "enterprise",
            KeyRole::User => "user",
            KeyRole::Archive => "archive",
            KeyRole::Policy => "policy",
            KeyRole::Agent => "agent",
            KeyRole::NasSession => "nas_session",
            KeyRole::NasBackup => "nas_backup",
            KeyRole::KmsMaster => "kms_master",
        }
    }
}

/// Запись keyset'а, 0x250 байт:
///   0x000 uuid (16)
///   0x010 algo i32
///   0x014 hint[0x200]
///   0x214 role i32
///   0x218 magic u32
///   0x21c unknown[7] u32
///   0x238 key_blobs_loc ppi
///   0x240 restore_rec_blobs_loc ppi
///   0x248 timestamp u64 (FILETIME)
#[derive(Clone)]
pub struct SKeySetRec {
    pub uuid: Digest,
    pub algo_raw: i32,
    pub hint: Vec<u8>,
    pub role_raw: i32,
    pub magic: u32,
    pub key_blobs_loc: PhysPageId,
    pub restore_rec_blobs_loc: PhysPageId,
    pub timestamp: u64,
}

impl SKeySetRec {
    pub const SIZE: usize = KEYSET_REC_SIZE;

    pub fn parse(buf: &[u8]) -> Option<SKeySetRec> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(SKeySetRec {
            uuid: Digest::from_bytes(&buf[0..16]),
            algo_raw: LittleEndian::read_i32(&buf[0x10..0x14]),
            hint: buf[0x14..0x214].to_vec(),
            role_raw: LittleEndian::read_i32(&buf[0x214..0x218]),
            magic: LittleEndian::read_u32(&buf[0x218..0x21c]),
            key_blobs_loc: PhysPageId::parse(&buf[0x238..0x240]),
            restore_rec_blobs_loc: PhysPageId::parse(&buf[0x240..0x248]),
            timestamp: LittleEndian::read_u64(&buf[0x248..0x250]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..16].copy_from_slice(&self.uuid.to_bytes());
        LittleEndian::write_i32(&mut buf[0x10..0x14], self.algo_raw);
        let n = self.hint.len().min(0x200);
        buf[0x14..0x14 + n].copy_from_slice(&self.hint[..n]);
        LittleEndian::write_i32(&mut buf[0x214..0x218], self.role_raw);
        LittleEndian::write_u32(&mut buf[0x218..0x21c], self.magic);
        self.key_blobs_loc.write_to(&mut buf[0x238..0x240]);
        self.restore_rec_blobs_loc.write_to(&mut buf[0x240..0x248]);
        LittleEndian::write_u64(&mut buf[0x248..0x250], self.timestamp);
    }

    pub fn algo(&self) -> Option<KeyAlgo> {
        match self.algo_raw {
            0 => Some(KeyAlgo::Aes256Cbc),
            1 => Some(KeyAlgo::Rsa),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<KeyRole> {
        KeyRole::from_i32(self.role_raw)
    }

    pub fn unix_timestamp(&self) -> u64 {
        (self.timestamp / 10_000_000).saturating_sub(FILETIME_UNIX_DELTA)
    }

    pub fn hint_str(&self) -> String {
        let end = self.hint.iter().position(|&b| b == 0).unwrap_or(self.hint.len());
        String::from_utf8_lossy(&self.hint[..end]).into_owned()
    }

    /// Грегорианский год расшифрованного timestamp обязан попадать в
    /// [2000, 2100] — лучший дискриминатор мусора при deep-скане.
    pub fn valid(&self) -> bool {
        if self.magic != KEYSET_MAGIC
            || self.role().is_none()
            || self.algo().is_none()
            || self.uuid.is_zero()
        {
            return false;
        }

        let year = 1970 + self.unix_timestamp() / 31_536_000;
        if !(2000..=2100).contains(&year) {
            return false;
        }

        for &b in &self.hint {
            if b == 0 {
                break;
            }
            if !(0x20..=0x7e).contains(&b) {
                return false;
            }
        }

        self.key_blobs_loc.valid_or_empty() && self.restore_rec_blobs_loc.valid_or_empty()
    }
}

impl fmt::Display for SKeySetRec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SKeySetRec uuid={} role={} algo={} hint='{}' key_blobs_loc={} restore_rec_blobs_loc={} unix_ts={}>",
            self.uuid,
            self.role().map(|r| r.as_str()).unwrap_or("unknown"),
            match self.algo() {
                Some(KeyAlgo::Aes256Cbc) => "aes256cbc",
                Some(KeyAlgo::Rsa) => "rsa",
                None => "unknown",
            },
            self.hint_str(),
            self.key_blobs_loc,
            self.restore_rec_blobs_loc,
            self.unix_timestamp()
        )
    }
}

/// Блоб восстановления ключа: фиксированный префикс + три подряд идущих
/// поля переменной длины (encrypted_key, key_checksum, salt).
#[derive(Clone)]
pub struct SRestoreRecBlob {
    pub keyset_id: [u8; 16],
    pub encrypted_key: Vec<u8>,
    pub key_checksum: Vec<u8>,
    pub salt: Vec<u8>,
    magic_ok: bool,
}

impl SRestoreRecBlob {
    pub const PREFIX_SIZE: usize = 0x42;

    /// Конструктор для синтеза блобов (сканерный слот, тестовые контейнеры).
    pub fn new(
        keyset_id: [u8; 16],
        encrypted_key: Vec<u8>,
        key_checksum: Vec<u8>,
        salt: Vec<u8>,
    ) -> SRestoreRecBlob {
        SRestoreRecBlob {
            keyset_id,
            encrypted_key,
            key_checksum,
            salt,
            magic_ok: true,
        }
    }

    pub fn parse(buf: &[u8]) -> Option<SRestoreRecBlob> {
        if buf.len() < Self::PREFIX_SIZE {
            return None;
        }
        let minus_one = LittleEndian::read_u64(&buf[0..8]);
        let one = LittleEndian::read_u32(&buf[0x10..0x14]);
        let keyset_id_size = LittleEndian::read_u32(&buf[0x14..0x18]);
        let mut keyset_id = [0u8; 16];
        keyset_id.copy_from_slice(&buf[0x18..0x28]);

        let encrypted_key_size = LittleEndian::read_u32(&buf[0x36..0x3a]) as usize;
        let key_checksum_size = LittleEndian::read_u32(&buf[0x3a..0x3e]) as usize;
        let salt_size = LittleEndian::read_u32(&buf[0x3e..0x42]) as usize;

        let mut pos = Self::PREFIX_SIZE;
        let take = |pos: &mut usize, n: usize| -> Option<Vec<u8>> {
            let out = buf.get(*pos..*pos + n)?.to_vec();
            *pos += n;
            Some(out)
        };
        let encrypted_key = take(&mut pos, encrypted_key_size)?;
        let key_checksum = take(&mut pos, key_checksum_size)?;
        let salt = take(&mut pos, salt_size)?;

        Some(SRestoreRecBlob {
            keyset_id,
            encrypted_key,
            key_checksum,
            salt,
            magic_ok: minus_one == RESTORE_REC_MAGIC && one == 1 && keyset_id_size == 16,
        })
    }

    pub fn valid(&self) -> bool {
        self.magic_ok
    }

    pub fn is_pbkdf2_derived(&self) -> bool {
        !self.salt.is_empty() && !self.encrypted_key.is_empty() && !self.key_checksum.is_empty()
    }

    /// Сериализация для тестовых контейнеров.
    pub fn write(&self) -> Vec<u8> {
        let mut buf =
            vec![0u8; Self::PREFIX_SIZE + self.encrypted_key.len() + self.key_checksum.len() + self.salt.len()];
        LittleEndian::write_u64(&mut buf[0..8], RESTORE_REC_MAGIC);
        LittleEndian::write_u32(&mut buf[0x10..0x14], 1);
        LittleEndian::write_u32(&mut buf[0x14..0x18], 16);
        buf[0x18..0x28].copy_from_slice(&self.keyset_id);
        LittleEndian::write_u32(&mut buf[0x28..0x2c], self.encrypted_key.len() as u32);
        LittleEndian::write_u32(&mut buf[0x36..0x3a], self.encrypted_key.len() as u32);
        LittleEndian::write_u32(&mut buf[0x3a..0x3e], self.key_checksum.len() as u32);
        LittleEndian::write_u32(&mut buf[0x3e..0x42], self.salt.len() as u32);
        let mut pos = Self::PREFIX_SIZE;
        for part in [&self.encrypted_key, &self.key_checksum, &self.salt] {
            buf[pos..pos + part.len()].copy_from_slice(part);
            pos += part.len();
        }
        buf
    }
}

impl fmt::Display for SRestoreRecBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SRestoreRecBlob pbkdf2_derived={} key_sz={:x} chk_sz={:x} salt_sz={:x}>",
            self.is_pbkdf2_derived(),
            self.encrypted_key.len(),
            self.key_checksum.len(),
            self.salt.len()
        )
    }
}
