//! Сборка списка блоков логического файла (VAllBlocks).
//!
//! Не-инкрементный файл: PageStack от attribs.ppi даёт страницы таблиц
//! SMetaTableDescriptor; regular-дескриптор раскрывается своим PageStack
//! со страницами SFibBlockDescriptorV7, sparse вносит MAX_BLOCKS нулевых
//! записей. Инкремент: SPatchBlockDescriptorV7 читаются прямо из стека
//! файла. Хвост из sparse-записей сверх attribs.nBlocks отрезается.

use log::{error, trace, warn};

use crate::vbk::block::{SFibBlockDescriptorV7, SPatchBlockDescriptorV7, VBlockDesc};
use crate::vbk::dir_item::{FileType, VFile};
use crate::vbk::meta_table::{SMetaTableDescriptor, MAX_BLOCKS};

use super::CMeta;

pub type VAllBlocks = Vec<VBlockDesc>;

impl CMeta {
    pub fn get_file_blocks(&self, vfi: &VFile) -> VAllBlocks {
        let mut blocks: VAllBlocks = Vec::with_capacity(vfi.attribs.n_blocks.max(0) as usize);
        let n_blocks_wanted = vfi.attribs.n_blocks.max(0) as usize;

        let stack = self.get_page_stack(vfi.attribs.ppi);
        for (idx, ppi1) in stack.iter().enumerate() {
            if !ppi1.valid() {
                error!(
                    "get_file_blocks({}): invalid ppi #{}: {}",
                    vfi.attribs.ppi, idx, ppi1
                );
                continue;
            }
            let Some(page) = self.page_ref(*ppi1) else {
                continue;
            };

            if vfi.file_type == FileType::Increment {
                for chunk in page.chunks_exact(SPatchBlockDescriptorV7::SIZE) {
                    let Some(desc) = SPatchBlockDescriptorV7::parse(chunk) else {
                        break;
                    };
                    trace!(
                        "get_file_blocks({}): patch {:?} total: {:x}",
                        vfi.attribs.ppi,
                        desc,
                        blocks.len()
                    );
                    blocks.push(desc.to_vblock());
                    if blocks.len() >= n_blocks_wanted {
                        break;
                    }
                }
            } else {
                for chunk in page.chunks_exact(SMetaTableDescriptor::SIZE) {
                    let Some(desc) = SMetaTableDescriptor::parse(chunk) else {
                        break;
                    };
                    if !desc.valid() {
                        break;
                    }
                    trace!(
                        "get_file_blocks({}): {} total: {:x}",
                        vfi.attribs.ppi,
                        desc,
                        blocks.len()
                    );

                    if desc.is_sparse() {
                        blocks.resize(blocks.len() + MAX_BLOCKS, VBlockDesc::default());
                    } else {
                        let mut collected: i64 = 0;
                        'pages: for ppi2 in &self.get_page_stack(desc.ppi) {
                            let Some(page2) = self.page_ref(*ppi2) else {
                                continue;
                            };
                            for chunk2 in page2.chunks_exact(SFibBlockDescriptorV7::SIZE) {
                                let Some(fib) = SFibBlockDescriptorV7::parse(chunk2) else {
                                    break;
                                };
                                blocks.push(fib.to_vblock());
                                collected += 1;
                                if collected >= desc.n_blocks {
                                    break 'pages;
                                }
                            }
                        }
                    }
                }
            }
        }

        // лишние хвостовые sparse-блоки
        while blocks.len() > n_blocks_wanted
            && blocks.last().map(|b| b.is_sparse()).unwrap_or(false)
        {
            blocks.pop();
        }
        if blocks.len() > n_blocks_wanted {
            warn!(
                "get_file_blocks({}): collected {:x} > declared {:x}",
                vfi.attribs.ppi,
                blocks.len(),
                n_blocks_wanted
            );
        }

        blocks
    }
}
