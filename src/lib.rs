#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod units;
pub mod util;

// Формат контейнера (упакованные записи + валидация)
pub mod vbk; // src/vbk/{ppi,digest,header,slot,bank,page_stack,dir_item,meta_table,block,block_desc,keyset}.rs

// Криптоцепочка keyset'ов
pub mod crypto; // src/crypto/{mod,kdf}.rs

// Байтовый ввод-вывод
pub mod io; // src/io/{reader,writer}.rs

// Кэш страниц метаданных и его обходы
pub mod meta; // src/meta/{mod,crypto_chain,dir,deep_scan,blocks}.rs

// Extract/test
pub mod extract; // src/extract/{mod,stats}.rs

// Внешняя хэш-таблица нарезанных блоков
pub mod hashtable;

// Сканер и карвер
pub mod scan; // src/scan/{mod,dblbuf,scanner,carver,lz4part}.rs

// Вспомогательное
pub mod bitmap;
pub mod lru_set;
pub mod progress;

// Удобные реэкспорты
pub use extract::{ExtractContext, ExtractOptions, FileTestInfo};
pub use hashtable::HashTable;
pub use meta::{CMeta, MetaOptions, MetaSource};
pub use scan::{Carver, ScanOptions, Scanner};
pub use vbk::{Digest, PhysPageId, VFile};
