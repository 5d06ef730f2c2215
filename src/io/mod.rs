//! Байтовый ввод-вывод: позиционный reader и sparse-aware writer.

pub mod reader;
pub mod writer;

pub use reader::{is_read_error, ReadError, Reader};
pub use writer::Writer;
