//! 16-байтовый контент-дайджест (md5) как значение.
//!
//! Храним как u128 в LE-порядке памяти: сравнения и хэширование дешёвые,
//! а hex-вид — это просто байты в порядке записи.

use std::fmt;

use crate::consts::{EMPTY_BLOCK_DIGEST, ZERO_BLOCK_DIGEST};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub u128);

impl Digest {
    pub const ZERO: Digest = Digest(0);

    pub fn from_bytes(b: &[u8]) -> Digest {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&b[..16]);
        Digest(u128::from_le_bytes(raw))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Блок с таким дайджестом — разреженный (нули), хранить его нечего.
    pub fn is_empty_block(self) -> bool {
        self.0 == EMPTY_BLOCK_DIGEST || self.0 == ZERO_BLOCK_DIGEST
    }

    /// Парсит hex-строку (байты в порядке записи). Лишний хвост игнорируется,
    /// недостающие байты остаются нулями — как parse в референсных дампах.
    pub fn parse(hex: &str) -> Option<Digest> {
        let hex = hex.as_bytes();
        let mut raw = [0u8; 16];
        let max_bytes = (hex.len() / 2).min(16);
        for (i, chunk) in hex.chunks_exact(2).take(max_bytes).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            raw[i] = ((hi << 4) | lo) as u8;
        }
        Some(Digest(u128::from_le_bytes(raw)))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// md5 от буфера, сразу как Digest.
pub fn md5_digest(data: &[u8]) -> Digest {
    use md5::{Digest as _, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    Digest::from_bytes(&hasher.finalize())
}
