//! Общие константы формата контейнера (header, slots, banks, pages, blocks).

// -------- Pages / banks --------
pub const PAGE_SIZE: usize = 0x1000;

/// Максимум страниц данных в банке (V13).
pub const MAX_PAGES: usize = 0x400;
pub const MIN_PAGES: usize = 0x20;

/// Банк на диске занимает (nPages+2) страниц.
pub const MAX_BANK_SIZE: u64 = ((MAX_PAGES + 2) * PAGE_SIZE) as u64;

/// Верхняя граница bank_id (зашита в оригинальном агенте).
pub const MAX_BANKS: u32 = 0xffa0;

// -------- Slots --------
pub const MAX_SLOTS: usize = 2;
pub const MAX_SLOT_FMT: u32 = 9;
pub const MAX_DIGEST_TYPE_LEN: usize = 250;

/// Фиксированная часть CSlot: crc(4) + has_snapshot(4) + SnapshotDescriptor(108)
/// + max_banks(4) + allocated_banks(4), добитая до кратности 8.
pub const SLOT_FIXED_SIZE: usize = 0x80;
/// Смещение массива BankInfo внутри слота (конец упакованных полей).
pub const SLOT_BANK_INFOS_OFF: usize = 0x7c;
pub const BANK_INFO_SIZE: usize = 0x10;

// -------- Data blocks --------
pub const BLOCK_SIZE: usize = 0x100000; // 1 MiB

/// Магия заголовка LZ4-блока. Агент проверяет (v & 0xF0FFFFFF) == 0xF000000F,
/// бит 0x08000000 — какой-то флаг.
pub const LZ_START_MAGIC: u32 = 0xF800_000F;
pub const LZ_HDR_SIZE: usize = 12;

// -------- Record sizes (packed, LE) --------
pub const DIR_ITEM_SIZE: usize = 0xc0;
pub const META_TABLE_DESC_SIZE: usize = 0x18;
pub const FIB_BLOCK_DESC_SIZE: usize = 0x2e;
pub const PATCH_BLOCK_DESC_SIZE: usize = 0x35;
pub const BLOCK_DESC_SIZE: usize = 0x3c;
pub const KEYSET_REC_SIZE: usize = 0x250;
pub const DEDUP_REC_SIZE: usize = 0x20;
pub const HASH_ENTRY_SIZE: usize = 0x38;

/// md5 от 1 MiB нулей — каноничный «пустой» блок.
/// b6d81b36 0a5672d8 0c27430f 39153e2c
pub const EMPTY_BLOCK_DIGEST: u128 = u128::from_le_bytes([
    0xb6, 0xd8, 0x1b, 0x36, 0x0a, 0x56, 0x72, 0xd8, 0x0c, 0x27, 0x43, 0x0f, 0x39, 0x15, 0x3e,
    0x2c,
]);
pub const ZERO_BLOCK_DIGEST: u128 = 0;
