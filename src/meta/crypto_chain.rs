//! Криптоцепочка: чтение keyset-страницы, деривация ключей и
//! расшифровка банков на месте.
//!
//! Две цепочки в зависимости от набора keyset'ов:
//!   AES-only (есть STORAGE, нет POLICY):
//!     PBKDF2(password, salt) -> storage key -> META -> SESSION
//!   RSA (есть POLICY):
//!     PBKDF2 -> RSA private key (PEM) -> AGENT -> STORAGE -> META -> SESSION
//! Все расшифрованные ключи регистрируются по uuid исходного keyset'а —
//! на эти uuid ссылаются и заголовки банков, и дескрипторы блоков.

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use std::collections::BTreeMap;

use crate::consts::PAGE_SIZE;
use crate::crypto::{decrypt_pbkdf2_data, rsa_decrypt, AesKey};
use crate::util::{get_out_pathname, sanitize_fname};
use crate::vbk::bank::{bank_clear_encryption, bank_valid_fast, page_is_metavec2_start, BankHeader};
use crate::vbk::keyset::{KeyRole, SKeySetRec, SRestoreRecBlob};
use crate::vbk::ppi::PhysPageId;

use super::{CMeta, MetaOptions};

impl CMeta {
    /// Загружает keyset'ы из банка криптохранилища. Для одиночного .bank
    /// файла (`is_bank_source`) банк дополнительно прописывается по
    /// индексу, на который указывает keyset-страница, чтобы get_page
    /// видел его без спецслучаев.
    pub(super) fn load_keysets(
        &mut self,
        crypto_bank_id: i32,
        opts: &MetaOptions,
        is_bank_source: bool,
    ) -> Result<bool> {
        if opts.password.is_empty() {
            self.log_or_die("need a password to decrypt this backup".to_string())?;
            return Ok(false);
        }
        if crypto_bank_id < 0 {
            self.log_or_die(format!("invalid crypto bank id {}", crypto_bank_id))?;
            return Ok(false);
        }

        // крипто-корень в текущем формате живёт на странице 0 своего банка
        let crypto_root = PhysPageId::new(if is_bank_source { 0 } else { crypto_bank_id }, 0);
        let Some(root_page) = self.get_page(crypto_root) else {
            self.log_or_die(format!("couldn't read crypto root page at {}", crypto_root))?;
            return Ok(false);
        };
        if !page_is_metavec2_start(&root_page, 0) {
            self.log_or_die("CryptoStoreRootPage isn't a metavec2 start on page 0".to_string())?;
            return Ok(false);
        }

        let keyset_page_ppi = PhysPageId::parse(&root_page[0x10..0x18]);
        let bank_index = keyset_page_ppi.bank_id;
        if bank_index < 0 {
            self.log_or_die(format!("keyset points to bank {} which is invalid", bank_index))?;
            return Ok(false);
        }

        if is_bank_source {
            // одиночный банк: положить его по нужному индексу, чтобы
            // get_page дальше работал без спецслучаев
            let bank = self.banks[0].clone();
            if self.banks.len() <= bank_index as usize {
                self.banks.resize(bank_index as usize + 1, Vec::new());
            }
            self.banks[bank_index as usize] = bank;
        }

        let Some(keyset_page) = self.get_page(keyset_page_ppi) else {
            self.log_or_die(format!("couldn't read SKeySetRec page at {}", keyset_page_ppi))?;
            return Ok(false);
        };

        let mut keysets: BTreeMap<KeyRole, SKeySetRec> = BTreeMap::new();
        for chunk in keyset_page.chunks_exact(SKeySetRec::SIZE) {
            if let Some(rec) = SKeySetRec::parse(chunk) {
                if rec.valid() {
                    debug!("  keyset found: {}", rec);
                    if let Some(role) = rec.role() {
                        keysets.insert(role, rec);
                    }
                }
            }
        }
        if keysets.is_empty() {
            self.log_or_die(format!("no keysets found in bank {}", bank_index))?;
            return Ok(false);
        }

        let password = opts.password.clone();
        if keysets.contains_key(&KeyRole::Policy) {
            info!("decrypting keysets with KR_POLICY (RSA)");
            if !self.run_rsa_chain(&keysets, &password)? {
                return Ok(false);
            }
        } else if keysets.contains_key(&KeyRole::Storage) {
            info!("decrypting keysets with KR_STORAGE (AES)");
            if !self.run_aes_chain(&keysets, &password)? {
                return Ok(false);
            }
        } else {
            self.log_or_die("found neither KR_POLICY nor KR_STORAGE keysets".to_string())?;
            return Ok(false);
        }

        if !self.keysets.is_empty() {
            info!(
                "loaded {} encryption keyset{}",
                self.keysets.len(),
                if self.keysets.len() == 1 { "" } else { "s" }
            );
            if opts.dump_keysets {
                self.dump_loaded_keysets(opts)?;
            }
        }

        Ok(!self.keysets.is_empty())
    }

    fn read_restore_blob(&self, keyset: &SKeySetRec) -> Option<SRestoreRecBlob> {
        let page = self.get_page(keyset.restore_rec_blobs_loc)?;
        SRestoreRecBlob::parse(&page)
    }

    /// AES-цепочка: storage из PBKDF2, затем meta/session через storage.
    fn run_aes_chain(
        &mut self,
        keysets: &BTreeMap<KeyRole, SKeySetRec>,
        password: &str,
    ) -> Result<bool> {
        let storage = &keysets[&KeyRole::Storage];
        let Some(blob) = self.read_restore_blob(storage) else {
            self.log_or_die(format!(
                "couldn't read KR_STORAGE blob at {}",
                storage.restore_rec_blobs_loc
            ))?;
            return Ok(false);
        };

        let decrypted = match decrypt_pbkdf2_data(password, &blob.salt, &blob.encrypted_key) {
            Ok(d) => d,
            Err(e) => {
                self.log_or_die(format!("KR_STORAGE key derivation failed: {}", e))?;
                return Ok(false);
            }
        };
        let storage_key = match AesKey::from_tail(&decrypted) {
            Ok(k) => k,
            Err(e) => {
                self.log_or_die(format!("KR_STORAGE: {}", e))?;
                return Ok(false);
            }
        };
        let storage_id = storage.uuid;
        self.keysets.register(storage_id, storage_key);

        self.unwrap_meta_and_session(keysets, storage_id)?;
        Ok(true)
    }

    /// RSA-цепочка: policy -> приватный ключ, agent -> промежуточный AES,
    /// storage через agent, дальше как в AES-цепочке.
    fn run_rsa_chain(
        &mut self,
        keysets: &BTreeMap<KeyRole, SKeySetRec>,
        password: &str,
    ) -> Result<bool> {
        let policy = &keysets[&KeyRole::Policy];
        let Some(rsa_blob) = self.read_restore_blob(policy) else {
            self.log_or_die(format!(
                "couldn't read KR_POLICY blob at {}",
                policy.restore_rec_blobs_loc
            ))?;
            return Ok(false);
        };
        if !rsa_blob.is_pbkdf2_derived() {
            self.log_or_die("RSA key blob isn't valid".to_string())?;
            return Ok(false);
        }

        let decrypted_rsa = match decrypt_pbkdf2_data(password, &rsa_blob.salt, &rsa_blob.encrypted_key)
        {
            Ok(d) => d,
            Err(e) => {
                self.log_or_die(format!("KR_POLICY key derivation failed: {}", e))?;
                return Ok(false);
            }
        };
        // фиксированный 8-байтовый заголовок перед PEM
        if decrypted_rsa.len() <= 8 {
            self.log_or_die("KR_POLICY blob is too short".to_string())?;
            return Ok(false);
        }
        let pem = String::from_utf8_lossy(&decrypted_rsa[8..]).into_owned();

        let Some(agent) = keysets.get(&KeyRole::Agent) else {
            self.log_or_die("no KR_AGENT keyset found".to_string())?;
            return Ok(false);
        };
        let Some(agent_blob) = self.read_restore_blob(agent) else {
            self.log_or_die(format!(
                "couldn't read KR_AGENT blob at {}",
                agent.restore_rec_blobs_loc
            ))?;
            return Ok(false);
        };

        // ключ агента лежит задом наперёд
        let reversed: Vec<u8> = agent_blob.encrypted_key.iter().rev().copied().collect();
        let agent_raw = match rsa_decrypt(&pem, &reversed) {
            Ok(d) => d,
            Err(e) => {
                self.log_or_die(format!("KR_AGENT unwrap failed: {}", e))?;
                return Ok(false);
            }
        };
        trace!("KR_AGENT key bytes: {} bytes", agent_raw.len());
        let agent_key = match AesKey::from_tail(&agent_raw) {
            Ok(k) => k,
            Err(e) => {
                self.log_or_die(format!("KR_AGENT: {}", e))?;
                return Ok(false);
            }
        };

        let Some(storage) = keysets.get(&KeyRole::Storage) else {
            self.log_or_die("no KR_STORAGE keyset found".to_string())?;
            return Ok(false);
        };
        let Some(storage_blob) = self.read_restore_blob(storage) else {
            self.log_or_die(format!(
                "couldn't read KR_STORAGE blob at {}",
                storage.restore_rec_blobs_loc
            ))?;
            return Ok(false);
        };

        let agent_cipher = crate::crypto::Aes256Cbc::from_key(&agent_key);
        let mut storage_raw = storage_blob.encrypted_key.clone();
        if let Err(e) = agent_cipher.decrypt(&mut storage_raw, true) {
            self.log_or_die(format!("KR_STORAGE unwrap failed: {}", e))?;
            return Ok(false);
        }
        let storage_key = match AesKey::from_tail(&storage_raw) {
            Ok(k) => k,
            Err(e) => {
                self.log_or_die(format!("KR_STORAGE: {}", e))?;
                return Ok(false);
            }
        };
        let storage_id = storage.uuid;
        self.keysets.register(storage_id, storage_key);

        self.unwrap_meta_and_session(keysets, storage_id)?;
        Ok(true)
    }

    /// KR_META и KR_SESSION разворачиваются storage-ключом; uuid
    /// session-keyset'а запоминается как «тот самый» сессионный ключ.
    fn unwrap_meta_and_session(
        &mut self,
        keysets: &BTreeMap<KeyRole, SKeySetRec>,
        storage_id: crate::vbk::Digest,
    ) -> Result<()> {
        for role in [KeyRole::Meta, KeyRole::Session] {
            let Some(rec) = keysets.get(&role) else {
                continue;
            };
            let Some(blob) = self.read_restore_blob(rec) else {
                warn!("couldn't read {} blob at {}", role.as_str(), rec.restore_rec_blobs_loc);
                continue;
            };

            let mut raw = blob.encrypted_key.clone();
            let Some(storage_cipher) = self.keysets.cipher(&storage_id) else {
                error!("storage cipher disappeared from the registry");
                return Ok(());
            };
            if let Err(e) = storage_cipher.decrypt(&mut raw, true) {
                warn!("{} unwrap failed: {}", role.as_str(), e);
                continue;
            }
            match AesKey::from_tail(&raw) {
                Ok(key) => {
                    let id = rec.uuid;
                    self.keysets.register(id, key);
                    if role == KeyRole::Session {
                        self.keysets.set_session_key(id);
                    }
                }
                Err(e) => warn!("{}: {}", role.as_str(), e),
            }
        }
        Ok(())
    }

    /// Расшифровка всех банков с is_encrypted: encr_size байт от начала
    /// нулевой страницы данных, остаток паддинга зануляется, крипто-поля
    /// заголовка очищаются.
    pub(super) fn decrypt_banks(&mut self) {
        for i in 0..self.banks.len() {
            if self.banks[i].is_empty() {
                continue;
            }
            let Some(hdr) = BankHeader::parse(&self.banks[i]) else {
                continue;
            };
            if !bank_valid_fast(&self.banks[i]) || !hdr.is_encrypted() {
                continue;
            }

            let Some(cipher) = self.keysets.cipher(&hdr.keyset_id) else {
                warn!("  no keyset found for bank[{}] keyset {}", i, hdr.keyset_id);
                continue;
            };

            let encr_size = hdr.encr_size as usize;
            let data_start = PAGE_SIZE;
            if self.banks[i].len() < data_start + encr_size {
                warn!(
                    "  bank[{}] is shorter than its encr_size ({:x} < {:x})",
                    i,
                    self.banks[i].len(),
                    data_start + encr_size
                );
                continue;
            }

            let mut data = self.banks[i][data_start..data_start + encr_size].to_vec();
            if let Err(e) = cipher.decrypt(&mut data, true) {
                error!("  failed to decrypt bank[{}] keyset {}: {}", i, hdr.keyset_id, e);
                continue;
            }

            let bank = &mut self.banks[i];
            bank[data_start..data_start + data.len()].copy_from_slice(&data);
            bank[data_start + data.len()..data_start + encr_size].fill(0);
            bank_clear_encryption(bank);
            debug!("  bank[{}] decrypted ({:x} bytes)", i, data.len());
        }
    }

    /// Дамп загруженных ключей: u32 count + (uuid, key, iv)*.
    pub fn dump_loaded_keysets(&self, opts: &MetaOptions) -> Result<()> {
        if self.keysets.is_empty() {
            info!(
                "no {}aes keysets loaded",
                if opts.dump_session_only { "session " } else { "" }
            );
            return Ok(());
        }

        let (out_path, append) = match &opts.keysets_same_file {
            Some(p) if !p.as_os_str().is_empty() => (p.clone(), true),
            _ => {
                let base = self
                    .source_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "metadata".to_string());
                let base = sanitize_fname(&base);
                (
                    get_out_pathname(
                        &self.source_path,
                        &format!("{}.keysets.bin", base),
                        opts.out_dir.as_deref(),
                    )?,
                    false,
                )
            }
        };

        let n = self
            .keysets
            .dump(&out_path, opts.dump_session_only, append)?;
        if n > 0 {
            info!("dumped {} keyset{} to {}", n, if n == 1 { "" } else { "s" }, out_path.display());
        }
        Ok(())
    }
}
