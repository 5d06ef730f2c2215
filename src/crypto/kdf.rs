//! Деривация ключей: PBKDF2-каскад и RSA-развёртка.

use anyhow::{anyhow, Context, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha1::Sha1;
use sha2::Sha256;

use super::{Aes256Cbc, AesKey};

/// Известные конфигурации PBKDF2 (итерации, sha1?). Пробуются по порядку.
const PBKDF2_CONFIGS: [(u32, bool); 3] = [(600_000, false), (310_000, false), (10_000, true)];

/// PBKDF2-HMAC c паролем в UTF-16LE (не-ASCII пароли не поддерживаются),
/// 48 байт на выходе: 32 ключа + 16 IV.
pub fn pbkdf2_utf16(password: &str, salt: &[u8], iterations: u32, use_sha1: bool) -> [u8; 48] {
    let mut utf16_password = Vec::with_capacity(password.len() * 2);
    for b in password.bytes() {
        utf16_password.push(b);
        utf16_password.push(0);
    }

    let mut out = [0u8; 48];
    if use_sha1 {
        pbkdf2::pbkdf2_hmac::<Sha1>(&utf16_password, salt, iterations, &mut out);
    } else {
        pbkdf2::pbkdf2_hmac::<Sha256>(&utf16_password, salt, iterations, &mut out);
    }
    out
}

/// Перебирает конфигурации PBKDF2: первая, чья AES-CBC-расшифровка
/// `encrypted` даёт валидный PKCS#7 и >= 48 байт, побеждает.
pub fn decrypt_pbkdf2_data(password: &str, salt: &[u8], encrypted: &[u8]) -> Result<Vec<u8>> {
    for (iterations, use_sha1) in PBKDF2_CONFIGS {
        let derived = pbkdf2_utf16(password, salt, iterations, use_sha1);
        let key = AesKey::from_tail(&derived).expect("48-byte derivation");

        let mut decrypted = encrypted.to_vec();
        let cipher = Aes256Cbc::from_key(&key);
        match cipher.decrypt(&mut decrypted, true) {
            Ok(()) if decrypted.len() >= 48 => return Ok(decrypted),
            _ => continue, // следующая конфигурация
        }
    }

    Err(anyhow!("all PBKDF2 decryption attempts failed"))
}

/// RSA-PKCS#1 v1.5 развёртка. PEM принимается и в PKCS#1
/// ("RSA PRIVATE KEY"), и в PKCS#8 ("PRIVATE KEY").
pub fn rsa_decrypt(private_key_pem: &str, encrypted: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPrivateKey::from_pkcs1_pem(private_key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(private_key_pem))
        .context("parse RSA private key PEM")?;

    key.decrypt(Pkcs1v15Encrypt, encrypted)
        .context("rsa decrypt failed")
}
