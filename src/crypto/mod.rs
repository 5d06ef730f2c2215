//! Криптография keyset-цепочки: AES-256-CBC поверх блочного шифра,
//! реестр расшифрованных keyset'ов, дамп/загрузка ключей.
//!
//! CBC собран вручную поверх `aes::Aes256` (расписание ключей считается
//! один раз в конструкторе, аппаратное ускорение даёт сам крейт). Каждый
//! вызов decrypt — самостоятельный CBC-проход от IV конструктора; стриминга
//! между вызовами нет, PKCS#7-унпад опционален per call.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use zeroize::Zeroize;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes256;

use crate::vbk::digest::Digest;

pub mod kdf;
pub use kdf::{decrypt_pbkdf2_data, pbkdf2_utf16, rsa_decrypt};

/// 48 байт материала: 32 ключа + 16 IV.
#[derive(Clone)]
pub struct AesKey {
    pub key: [u8; 32],
    pub iv: [u8; 16],
}

impl AesKey {
    /// Ключ и IV лежат в ХВОСТЕ расшифрованного блоба: последние 48 байт —
    /// ключ, последние 16 — IV.
    pub fn from_tail(raw: &[u8]) -> Result<AesKey> {
        if raw.len() < 48 {
            return Err(anyhow!("decrypted key data is too short ({} bytes)", raw.len()));
        }
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&raw[raw.len() - 48..raw.len() - 16]);
        iv.copy_from_slice(&raw[raw.len() - 16..]);
        Ok(AesKey { key, iv })
    }
}

impl Drop for AesKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

pub struct Aes256Cbc {
    cipher: Aes256,
    iv0: [u8; 16],
}

impl Aes256Cbc {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Aes256Cbc {
        Aes256Cbc {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            iv0: *iv,
        }
    }

    pub fn from_key(key: &AesKey) -> Aes256Cbc {
        Aes256Cbc::new(&key.key, &key.iv)
    }

    /// CBC-дешифрование буфера на месте. Размер обязан быть ненулевым
    /// кратным 16.
    pub fn decrypt_in_place(&self, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() % 16 != 0 {
            return Err(anyhow!("aes input size must be a multiple of 16"));
        }

        let mut prev = self.iv0;
        for block in data.chunks_exact_mut(16) {
            let mut ct = [0u8; 16];
            ct.copy_from_slice(block);

            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev = ct;
        }
        Ok(())
    }

    /// Вариант с опциональным снятием PKCS#7-паддинга (усекает буфер).
    pub fn decrypt(&self, data: &mut Vec<u8>, remove_padding: bool) -> Result<()> {
        self.decrypt_in_place(data)?;
        if remove_padding {
            let pad = pkcs7_unpad_len(data)?;
            data.truncate(data.len() - pad);
        }
        Ok(())
    }
}

fn pkcs7_unpad_len(buf: &[u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let pad = buf[buf.len() - 1] as usize;
    if pad == 0 || pad > 16 || pad > buf.len() {
        return Err(anyhow!("invalid PKCS#7 padding"));
    }
    if buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(anyhow!("invalid PKCS#7 padding"));
    }
    Ok(pad)
}

/// Реестр keyset'ов: uuid -> (материал, готовый шифратор). На uuid ссылаются
/// и банки (keyset_id в заголовке), и дескрипторы блоков (keysetID).
#[derive(Default)]
pub struct KeysetStore {
    keys: BTreeMap<Digest, AesKey>,
    ciphers: BTreeMap<Digest, Aes256Cbc>,
    session_key: Option<Digest>,
}

impl KeysetStore {
    pub fn new() -> KeysetStore {
        KeysetStore::default()
    }

    pub fn register(&mut self, id: Digest, key: AesKey) {
        self.ciphers.insert(id, Aes256Cbc::from_key(&key));
        self.keys.insert(id, key);
    }

    pub fn set_session_key(&mut self, id: Digest) {
        self.session_key = Some(id);
    }

    pub fn session_key(&self) -> Option<Digest> {
        self.session_key
    }

    pub fn cipher(&self, id: &Digest) -> Option<&Aes256Cbc> {
        self.ciphers.get(id)
    }

    pub fn key(&self, id: &Digest) -> Option<&AesKey> {
        self.keys.get(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &Digest> {
        self.keys.keys()
    }

    /// Дамп ключей: u32 count, затем (uuid 16, key 32, iv 16)*.
    /// `session_only` оставляет только сессионный keyset (им шифруются
    /// блоки данных), `append` дописывает в существующий файл, обновляя
    /// счётчик.
    pub fn dump(&self, path: &Path, session_only: bool, append: bool) -> Result<usize> {
        let should_dump = |id: &Digest| !session_only || self.session_key.as_ref() == Some(id);
        let dump_count = self.keys.keys().filter(|&id| should_dump(id)).count();
        if dump_count == 0 {
            return Ok(0);
        }

        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("open keysets dump {}", path.display()))?;

        let mut count = 0u32;
        if append && f.metadata()?.len() >= 4 {
            f.seek(SeekFrom::Start(0))?;
            count = f.read_u32::<LittleEndian>()?;
            f.seek(SeekFrom::End(0))?;
        } else {
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&[0u8; 4])?;
        }

        for (id, key) in &self.keys {
            if !should_dump(id) {
                continue;
            }
            f.write_all(&id.to_bytes())?;
            f.write_all(&key.key)?;
            f.write_all(&key.iv)?;
            count += 1;
        }

        f.seek(SeekFrom::Start(0))?;
        let mut cnt_buf = [0u8; 4];
        LittleEndian::write_u32(&mut cnt_buf, count);
        f.write_all(&cnt_buf)?;
        Ok(dump_count)
    }

    /// Загрузка дампа, записанного `dump`.
    pub fn load(path: &Path) -> Result<KeysetStore> {
        let mut f = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("open keysets dump {}", path.display()))?;

        let count = f.read_u32::<LittleEndian>()?;
        let mut store = KeysetStore::new();
        for _ in 0..count {
            let mut uuid = [0u8; 16];
            let mut key = [0u8; 32];
            let mut iv = [0u8; 16];
            f.read_exact(&mut uuid)?;
            f.read_exact(&mut key)?;
            f.read_exact(&mut iv)?;
            store.register(Digest::from_bytes(&uuid), AesKey { key, iv });
        }
        Ok(store)
    }
}
