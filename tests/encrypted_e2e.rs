//! Зашифрованный контейнер: AES-цепочка keyset'ов (STORAGE -> META ->
//! SESSION), расшифровка банка метаданных на месте, зашифрованный блок
//! данных, дамп ключей.

mod common;

use common::*;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;

use QuiverVBK::consts::{BLOCK_SIZE, PAGE_SIZE};
use QuiverVBK::crypto::{pbkdf2_utf16, AesKey, KeysetStore};
use QuiverVBK::extract::{ExtractContext, ExtractOptions};
use QuiverVBK::io::Reader;
use QuiverVBK::meta::{CMeta, MetaOptions, MetaSource};
use QuiverVBK::vbk::bank::bank_set_encryption;
use QuiverVBK::vbk::dir_item::{DirPayload, FileType};
use QuiverVBK::vbk::keyset::{KeyRole, SKeySetRec, SRestoreRecBlob, KEYSET_MAGIC};
use QuiverVBK::vbk::{
    Digest, PhysPageId, SDirItemRec, SFibBlockDescriptorV7, SMetaTableDescriptor,
};
use QuiverVBK::HashTable;

const PASSWORD: &str = "t0p-secret";

/// CBC-шифрование с PKCS#7 (тестовая сторона; движок умеет только дешифровать).
fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
    let pad = 16 - plain.len() % 16;
    let mut data = plain.to_vec();
    data.extend(std::iter::repeat(pad as u8).take(pad));

    let enc = Aes256::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(16) {
        let mut block = [0u8; 16];
        for i in 0..16 {
            block[i] = chunk[i] ^ prev[i];
        }
        let mut ga = GenericArray::clone_from_slice(&block);
        enc.encrypt_block(&mut ga);
        prev.copy_from_slice(&ga);
        out.extend_from_slice(&ga);
    }
    out
}

fn keyset_rec(role: KeyRole, uuid: u128, blob_loc: PhysPageId) -> SKeySetRec {
    SKeySetRec {
        uuid: Digest(uuid),
        algo_raw: 0, // AES256CBC
        hint: b"test".to_vec(),
        role_raw: role as i32,
        magic: KEYSET_MAGIC,
        key_blobs_loc: PhysPageId::new(-1, -1),
        restore_rec_blobs_loc: blob_loc,
        // 2024 год в FILETIME
        timestamp: (1_704_067_200u64 + 11_644_473_600) * 10_000_000,
    }
}

fn keyset_page(recs: &[SKeySetRec]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, rec) in recs.iter().enumerate() {
        rec.write_to(&mut page[i * SKeySetRec::SIZE..(i + 1) * SKeySetRec::SIZE]);
    }
    page
}

fn blob_page(blob: &SRestoreRecBlob) -> Vec<u8> {
    let raw = blob.write();
    assert!(raw.len() <= PAGE_SIZE);
    let mut page = vec![0u8; PAGE_SIZE];
    page[..raw.len()].copy_from_slice(&raw);
    page
}

struct Keys {
    storage: AesKey,
    meta: AesKey,
    session: AesKey,
}

fn make_keys() -> Keys {
    Keys {
        storage: AesKey {
            key: [0x41; 32],
            iv: [0x42; 16],
        },
        meta: AesKey {
            key: [0x51; 32],
            iv: [0x52; 16],
        },
        session: AesKey {
            key: [0x61; 32],
            iv: [0x62; 16],
        },
    }
}

const STORAGE_UUID: u128 = 0x1111_2222;
const META_UUID: u128 = 0x3333_4444;
const SESSION_UUID: u128 = 0x5555_6666;

/// Контейнер: bank 0 — метаданные (шифруются meta-ключом), bank 1 —
/// криптохранилище. Один файл из двух блоков: чистый lz4 и lz4,
/// зашифрованный session-ключом.
fn build_encrypted(dir: &std::path::Path) -> (std::path::PathBuf, Vec<u8>, Vec<u8>) {
    let keys = make_keys();
    let mut fx = Fixture::new(2);

    let b0: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i / 0x1000) as u8).collect();
    let b1: Vec<u8> = (0..BLOCK_SIZE).map(|i| ((i / 0x800) % 199) as u8).collect();

    // блок 0 — обычный lz4
    let bd0 = fx.add_lz4_block(&b0);

    // блок 1 — lz4, обёрнутый в CBC session-ключом
    let mut bd1 = fx.add_lz4_block(&b1);
    {
        let plain_len = bd1.comp_size as usize;
        let start = (bd1.offset - fx.data_base()) as usize;
        let plain = fx.data[start..start + plain_len].to_vec();
        let ciphertext = cbc_encrypt(&keys.session.key, &keys.session.iv, &plain);
        // шифртекст длиннее на паддинг: дописываем в хвост региона данных
        let offset = fx.data_base() + fx.data.len() as u64;
        fx.data.extend_from_slice(&ciphertext);
        bd1.offset = offset;
        bd1.comp_size = ciphertext.len() as u32;
        bd1.alloc_size = ciphertext.len() as u32;
        bd1.keyset_id = Digest(SESSION_UUID);
    }

    // bank 0: метаданные
    fx.put_page(0, 0, &root_page(PhysPageId::new(0, 0), &[PhysPageId::new(0, 2)]));
    fx.put_page(0, 1, &root_page(PhysPageId::new(0, 1), &[PhysPageId::new(0, 3)]));
    fx.put_page(
        0,
        2,
        &dir_page(&[SDirItemRec {
            file_type: FileType::IntFib,
            name: "secret.bin".to_string(),
            props_loc: PhysPageId::new(-1, -1),
            payload: DirPayload::Fib {
                blocks_loc: PhysPageId::new(0, 5),
                n_blocks: 2,
                fib_size: 2 * BLOCK_SIZE as u64,
            },
        }]),
    );
    fx.put_page(0, 3, &bd_page(&[bd0, bd1]));
    fx.put_page(0, 5, &root_page(PhysPageId::new(0, 5), &[PhysPageId::new(0, 6)]));
    fx.put_page(
        0,
        6,
        &meta_table_page(&[SMetaTableDescriptor {
            ppi: PhysPageId::new(0, 7),
            block_size: BLOCK_SIZE as i64,
            n_blocks: 2,
        }]),
    );
    fx.put_page(0, 7, &root_page(PhysPageId::new(0, 7), &[PhysPageId::new(0, 8)]));
    fx.put_page(
        0,
        8,
        &fib_page(&[
            SFibBlockDescriptorV7 {
                size: BLOCK_SIZE as u32,
                block_type: 0,
                digest: bd0.digest,
                id: 0,
                flags: 0,
                keyset_id: Digest::ZERO,
            },
            SFibBlockDescriptorV7 {
                size: BLOCK_SIZE as u32,
                block_type: 0,
                digest: bd1.digest,
                id: 1,
                flags: 0,
                keyset_id: Digest(SESSION_UUID),
            },
        ]),
    );

    // bank 1: криптохранилище.
    // страница 0 — metavec2-корень, keyset-страница по смещению 0x10
    let mut crypto_root = root_page(PhysPageId::new(1, 0), &[]);
    PhysPageId::new(1, 1).write_to(&mut crypto_root[0x10..0x18]);
    fx.put_page(1, 0, &crypto_root);
    fx.put_page(
        1,
        1,
        &keyset_page(&[
            keyset_rec(KeyRole::Storage, STORAGE_UUID, PhysPageId::new(1, 2)),
            keyset_rec(KeyRole::Meta, META_UUID, PhysPageId::new(1, 3)),
            keyset_rec(KeyRole::Session, SESSION_UUID, PhysPageId::new(1, 4)),
        ]),
    );

    // storage-блоб: PBKDF2(пароль, соль) разворачивает материал ключа
    let salt = *b"0123456789abcdef";
    let derived = pbkdf2_utf16(PASSWORD, &salt, 600_000, false);
    let kek = AesKey::from_tail(&derived).unwrap();
    let mut storage_material = [0u8; 48];
    storage_material[..32].copy_from_slice(&keys.storage.key);
    storage_material[32..].copy_from_slice(&keys.storage.iv);
    fx.put_page(
        1,
        2,
        &blob_page(&SRestoreRecBlob::new(
            Digest(STORAGE_UUID).to_bytes(),
            cbc_encrypt(&kek.key, &kek.iv, &storage_material),
            vec![0xAA; 4],
            salt.to_vec(),
        )),
    );

    // meta- и session-блобы разворачиваются storage-ключом
    for (page, uuid, key) in [(3usize, META_UUID, &keys.meta), (4, SESSION_UUID, &keys.session)] {
        let mut material = [0u8; 48];
        material[..32].copy_from_slice(&key.key);
        material[32..].copy_from_slice(&key.iv);
        fx.put_page(
            1,
            page,
            &blob_page(&SRestoreRecBlob::new(
                Digest(uuid).to_bytes(),
                cbc_encrypt(&keys.storage.key, &keys.storage.iv, &material),
                vec![0xBB; 4],
                vec![],
            )),
        );
    }

    // шифрование bank 0: данные страниц 0..13 уходят в CBC meta-ключом
    let plain_len = 13 * PAGE_SIZE;
    let plain = fx.banks[0][PAGE_SIZE..PAGE_SIZE + plain_len].to_vec();
    let ciphertext = cbc_encrypt(&keys.meta.key, &keys.meta.iv, &plain);
    fx.banks[0][PAGE_SIZE..PAGE_SIZE + ciphertext.len()].copy_from_slice(&ciphertext);
    bank_set_encryption(&mut fx.banks[0], Digest(META_UUID), ciphertext.len() as u32);

    let path = dir.join("encrypted.vbk");
    // CryptoStoreRootPage должен указывать на bank 1
    write_encrypted_container(&fx, &path);
    (path, b0, b1)
}

/// Как Fixture::write_container, но с CryptoStoreRootPage=(1,0).
fn write_encrypted_container(fx: &Fixture, path: &std::path::Path) {
    use QuiverVBK::vbk::{BankInfo, CSlot, ObjRefs, SnapshotDescriptor};

    let bank_infos: Vec<BankInfo> = fx
        .banks
        .iter()
        .enumerate()
        .map(|(i, bank)| BankInfo {
            crc: QuiverVBK::vbk::bank::bank_crc(bank),
            offset: (Fixture::banks_base() + (i * BANK_SIZE) as u64) as i64,
            size: BANK_SIZE as u32,
        })
        .collect();

    let slot = CSlot {
        crc: 0,
        has_snapshot: 1,
        snapshot: SnapshotDescriptor {
            version: 0x18,
            storage_eof: fx.data_base() + fx.data.len() as u64,
            n_banks: fx.banks.len() as u32,
            obj_refs: ObjRefs {
                meta_root_dir_page: PhysPageId::new(0, 0),
                children_num: 1,
                data_store_root_page: PhysPageId::new(0, 1),
                crypto_store_root_page: PhysPageId::new(1, 0),
                ..ObjRefs::default()
            },
            f64: 0,
        },
        max_banks: 0x7f00,
        allocated_banks: fx.banks.len() as u32,
        bank_infos,
    };
    let slot_bytes = slot.write();

    let mut image = Vec::new();
    // тот же заголовок, что в обычной фикстуре
    let mut digest_type = vec![0u8; QuiverVBK::consts::MAX_DIGEST_TYPE_LEN + 1];
    digest_type[..3].copy_from_slice(b"md5");
    let hdr = QuiverVBK::vbk::FileHeader {
        version: 0xd,
        inited: 1,
        digest_type_len: 3,
        digest_type,
        slot_fmt: 9,
        std_block_size: BLOCK_SIZE as u32,
        cluster_align: 9,
    };
    let mut hdr_page = vec![0u8; PAGE_SIZE];
    hdr.write_to(&mut hdr_page);
    image.extend_from_slice(&hdr_page);
    for _ in 0..2 {
        let mut region = vec![0u8; SLOT_REGION];
        region[..slot_bytes.len()].copy_from_slice(&slot_bytes);
        image.extend_from_slice(&region);
    }
    for bank in &fx.banks {
        image.extend_from_slice(bank);
    }
    image.extend_from_slice(&fx.data);
    std::fs::write(path, &image).unwrap();
}

fn open_with_password(path: &std::path::Path, password: &str, dump: bool, out_dir: &std::path::Path) -> anyhow::Result<CMeta> {
    CMeta::open(
        path,
        &MetaOptions {
            offset: PAGE_SIZE as u64,
            source: MetaSource::Slot,
            password: password.to_string(),
            dump_keysets: dump,
            out_dir: Some(out_dir.to_path_buf()),
            ..MetaOptions::default()
        },
    )
}

#[test]
fn decrypts_metadata_and_data_blocks() {
    let dir = tmp_dir("encrypted");
    let (path, b0, b1) = build_encrypted(&dir);
    let out = dir.join("out");

    let meta = open_with_password(&path, PASSWORD, true, &out).unwrap();
    assert_eq!(meta.keysets().len(), 3);
    assert_eq!(meta.keysets().session_key(), Some(Digest(SESSION_UUID)));

    // каталог читается после расшифровки банка на месте
    let mut files = Vec::new();
    meta.for_each_file(&mut |pathname, vfi| files.push((pathname.to_string(), vfi.clone())));
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "secret.bin");

    // извлечение: блок 1 расшифровывается session-ключом
    let ex_ht = HashTable::new();
    let vbkf = Reader::open(&path).unwrap();
    let opts = ExtractOptions {
        md_fname: path.clone(),
        out_dir: Some(out.clone()),
        ..ExtractOptions::default()
    };
    let mut ctx = ExtractContext::new(&meta, Some(vbkf), &ex_ht, Vec::new(), opts).unwrap();
    meta.for_each_file(&mut |pathname, vfi| {
        ctx.process_file(pathname, vfi).unwrap();
    });

    let extracted = std::fs::read(out.join("secret.bin")).unwrap();
    assert_eq!(extracted.len(), 2 * BLOCK_SIZE);
    assert_eq!(&extracted[..BLOCK_SIZE], &b0[..]);
    assert_eq!(&extracted[BLOCK_SIZE..], &b1[..]);

    // дамп ключей читается обратно
    let dump = out.join("encrypted.vbk.keysets.bin");
    assert!(dump.exists());
    let store = KeysetStore::load(&dump).unwrap();
    assert_eq!(store.len(), 3);
    assert!(store.key(&Digest(SESSION_UUID)).is_some());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn wrong_password_fails_closed() {
    let dir = tmp_dir("encrypted-wrong-pw");
    let (path, _, _) = build_encrypted(&dir);
    let out = dir.join("out");

    // строгий режим: цепочка не собралась — открытие падает.
    // (теоретический случайный валидный PKCS#7 на чужом ключе дал бы Ok
    // с мусорными ключами — тогда банк останется шифртекстом без файлов)
    match open_with_password(&path, "nope", false, &out) {
        Err(_) => {}
        Ok(meta) => {
            let mut n = 0;
            meta.for_each_file(&mut |_, _| n += 1);
            assert_eq!(n, 0);
        }
    }

    std::fs::remove_dir_all(&dir).unwrap();
}
