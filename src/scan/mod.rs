//! Сканирование сырого потока: двухбуферный проход, сигнатурный сканер
//! слотов/банков/блоков и плоский карвер.

pub mod carver;
pub mod dblbuf;
pub mod lz4part;
pub mod scanner;

pub use carver::Carver;
pub use scanner::{ScanOptions, Scanner};
