//! Deep-скан: каждая непустая страница пробуется как корень блочного
//! индекса — сначала как таблица IntFib-дескрипторов, затем как стек
//! патч-дескрипторов. Находки становятся синтетическими VFile'ами
//! с именем "<bank>_<page>.bin".

use log::{info, warn};
use std::collections::HashSet;
use std::sync::Once;

use crate::consts::BLOCK_SIZE;
use crate::units::bytes2human_full;
use crate::vbk::block::{SFibBlockDescriptorV7, SPatchBlockDescriptorV7};
use crate::vbk::dir_item::{FileType, VFile, VFileAttribs};
use crate::vbk::meta_table::{SMetaTableDescriptor, MAX_BLOCKS};
use crate::vbk::ppi::PhysPageId;

use super::CMeta;

static WARN_VIB_SIZE: Once = Once::new();
static WARN_VIB_NAME: Once = Once::new();

impl CMeta {
    /// Возвращает найденные файлы, отсортированные по ppi корня.
    pub fn deep_scan(&self) -> Vec<VFile> {
        let mut results: Vec<VFile> = Vec::new();
        let mut all_visited: HashSet<PhysPageId> = HashSet::new();

        let mut candidates = Vec::new();
        self.for_each_page(|ppi, _| candidates.push(ppi));

        // проход 1: IntFib (есть и в VBK, и в VIB)
        for &ppi in &candidates {
            if let Some((vfi, visited)) = self.try_fib_root(ppi) {
                results.push(vfi);
                all_visited.extend(visited);
            }
        }

        // проход 2: патчи (только VIB); страницы, накрытые первым
        // проходом, не перепроверяются
        for &ppi in &candidates {
            if all_visited.contains(&ppi) {
                continue;
            }
            if let Some(vfi) = self.try_patch_root(ppi) {
                results.push(vfi);
            }
        }

        results.sort_by_key(|v| v.attribs.ppi);
        results
    }

    fn try_fib_root(&self, ppi: PhysPageId) -> Option<(VFile, Vec<PhysPageId>)> {
        let stack = self.get_page_stack(ppi);
        let mut n_descriptors = 0usize;
        let mut n_blocks = 0usize;
        let mut fib_size_d = 0u64;
        let mut fib_size_b = 0u64;

        let mut visited = Vec::with_capacity(stack.len() + 1);
        visited.push(ppi);

        for ppi1 in &stack {
            let Some(page) = self.page_ref(*ppi1) else {
                break;
            };
            visited.push(*ppi1);
            for chunk in page.chunks_exact(SMetaTableDescriptor::SIZE) {
                let Some(desc) = SMetaTableDescriptor::parse(chunk) else {
                    break;
                };
                if !desc.valid() {
                    break;
                }
                n_descriptors += 1;
                fib_size_d += desc.size();
                if desc.is_sparse() {
                    n_blocks += MAX_BLOCKS;
                    fib_size_b += desc.size();
                } else {
                    for ppi2 in &self.get_page_stack(desc.ppi) {
                        let Some(page2) = self.page_ref(*ppi2) else {
                            break;
                        };
                        visited.push(*ppi2);
                        for chunk2 in page2.chunks_exact(SFibBlockDescriptorV7::SIZE) {
                            let Some(fib) = SFibBlockDescriptorV7::parse(chunk2) else {
                                break;
                            };
                            if !fib.valid() {
                                break;
                            }
                            n_blocks += 1;
                            fib_size_b += fib.size as u64;
                        }
                    }
                }
            }
        }

        if n_blocks == 0 {
            return None;
        }

        info!(
            "deep scan result @ {}: {} IntFib descriptor{} ({}) = {} block{} ({})",
            ppi,
            n_descriptors,
            if n_descriptors == 1 { "" } else { "s" },
            bytes2human_full(fib_size_d, " bytes", 1),
            n_blocks,
            if n_blocks == 1 { "" } else { "s" },
            bytes2human_full(fib_size_b, " bytes", 1)
        );

        let vfi = VFile {
            file_type: FileType::IntFib,
            name: format!("{:04x}_{:04x}.bin", ppi.bank_id, ppi.page_id),
            attribs: VFileAttribs {
                ppi,
                n_blocks: n_blocks as i64,
                filesize: fib_size_b as i64,
                vib_updsize: 0,
            },
        };
        Some((vfi, visited))
    }

    fn try_patch_root(&self, ppi: PhysPageId) -> Option<VFile> {
        let stack = self.get_page_stack(ppi);
        let mut n_descriptors = 0usize;
        let mut max_patch_offset = 0u64;

        for ppi1 in &stack {
            let Some(page) = self.page_ref(*ppi1) else {
                break;
            };
            for chunk in page.chunks_exact(SPatchBlockDescriptorV7::SIZE) {
                let Some(desc) = SPatchBlockDescriptorV7::parse(chunk) else {
                    break;
                };
                if !desc.valid() {
                    break;
                }
                n_descriptors += 1;
                max_patch_offset = max_patch_offset.max(desc.fib_offset());
            }
        }

        if n_descriptors == 0 {
            return None;
        }

        let fname = format!("{:04x}_{:04x}.bin", ppi.bank_id, ppi.page_id);
        WARN_VIB_SIZE.call_once(|| {
            warn!(
                "deep scan cannot get VIB's original size - using max patch block offset ({:#x}) instead",
                max_patch_offset
            );
        });
        WARN_VIB_NAME.call_once(|| {
            warn!(
                "deep scan cannot get VIB's original filename - using \"{}\" instead",
                fname
            );
        });

        info!(
            "deep scan result @ {}: {} Increment descriptor{}",
            ppi,
            n_descriptors,
            if n_descriptors == 1 { "" } else { "s" }
        );

        Some(VFile {
            file_type: FileType::Increment,
            name: fname,
            attribs: VFileAttribs {
                ppi,
                n_blocks: n_descriptors as i64,
                filesize: (max_patch_offset + BLOCK_SIZE as u64) as i64,
                vib_updsize: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::PAGE_SIZE;
    use crate::vbk::bank::{bank_new, bank_put_page};
    use crate::vbk::digest::Digest;
    use crate::vbk::page_stack::calc_idx;

    fn root_page(this: PhysPageId, payload: &[PhysPageId]) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        for off in (0..PAGE_SIZE).step_by(8) {
            PhysPageId::new(-1, -1).write_to(&mut page[off..off + 8]);
        }
        PhysPageId::new(-1, -1).write_to(&mut page[0..8]);
        this.write_to(&mut page[8..16]);
        for (i, ppi) in payload.iter().enumerate() {
            let slot = calc_idx(i);
            ppi.write_to(&mut page[slot * 8..slot * 8 + 8]);
        }
        page
    }

    #[test]
    fn finds_unreferenced_fib() {
        let mut bank = bank_new(0x20);

        // корень fib-таблицы @ 0:5 -> таблица @ 0:6; дескриптор ссылается
        // на стек блоков @ 0:7 -> страница fib-записей @ 0:8
        bank_put_page(&mut bank, 5, &root_page(PhysPageId::new(0, 5), &[PhysPageId::new(0, 6)]));

        let mut table = vec![0u8; PAGE_SIZE];
        SMetaTableDescriptor {
            ppi: PhysPageId::new(0, 7),
            block_size: BLOCK_SIZE as i64,
            n_blocks: 2,
        }
        .write_to(&mut table[0..SMetaTableDescriptor::SIZE]);
        bank_put_page(&mut bank, 6, &table);

        bank_put_page(&mut bank, 7, &root_page(PhysPageId::new(0, 7), &[PhysPageId::new(0, 8)]));

        let mut blocks = vec![0u8; PAGE_SIZE];
        for i in 0..2usize {
            SFibBlockDescriptorV7 {
                size: BLOCK_SIZE as u32,
                block_type: 0,
                digest: Digest(0x100 + i as u128),
                id: i as u64,
                flags: 0,
                keyset_id: Digest::ZERO,
            }
            .write_to(&mut blocks[i * SFibBlockDescriptorV7::SIZE..(i + 1) * SFibBlockDescriptorV7::SIZE]);
        }
        bank_put_page(&mut bank, 8, &blocks);

        let meta = CMeta::from_banks(vec![bank]);
        let found = meta.deep_scan();

        // дубликаты не плодятся: вложенные страницы уже накрыты корнем 0:5
        assert_eq!(found.len(), 1);
        let vfi = &found[0];
        assert_eq!(vfi.file_type, FileType::IntFib);
        assert_eq!(vfi.name, "0000_0005.bin");
        assert_eq!(vfi.attribs.n_blocks, 2);
        assert_eq!(vfi.attribs.filesize, 2 * BLOCK_SIZE as i64);
    }

    #[test]
    fn finds_patch_root() {
        let mut bank = bank_new(0x20);
        bank_put_page(&mut bank, 3, &root_page(PhysPageId::new(0, 3), &[PhysPageId::new(0, 4)]));

        let mut page = vec![0u8; PAGE_SIZE];
        for i in 0..3usize {
            SPatchBlockDescriptorV7 {
                size: BLOCK_SIZE as u32,
                block_type: 0,
                digest: Digest(0x200 + i as u128),
                id: i as i64,
                block_idx: (i * 2) as i64,
                digest2: Digest::ZERO,
            }
            .write_to(&mut page[i * SPatchBlockDescriptorV7::SIZE..(i + 1) * SPatchBlockDescriptorV7::SIZE]);
        }
        bank_put_page(&mut bank, 4, &page);

        let meta = CMeta::from_banks(vec![bank]);
        let found = meta.deep_scan();
        assert_eq!(found.len(), 1);
        let vfi = &found[0];
        assert_eq!(vfi.file_type, FileType::Increment);
        assert_eq!(vfi.attribs.n_blocks, 3);
        // максимум block_idx = 4 -> размер 5 блоков
        assert_eq!(vfi.attribs.filesize, 5 * BLOCK_SIZE as i64);
    }

    #[test]
    fn empty_meta_finds_nothing() {
        let meta = CMeta::from_banks(vec![bank_new(0x20)]);
        assert!(meta.deep_scan().is_empty());
    }
}
