//! Обход каталогов: штатное дерево от MetaRootDirPage, затем поиск
//! осиротевших каталожных страниц по всем банкам, затем (опционально)
//! deep-скан структур без единой ссылки из каталога.

use log::{debug, info};
use std::collections::HashSet;

use crate::vbk::dir_item::{DirPayload, SDirItemRec, VFile};
use crate::vbk::ppi::PhysPageId;

use super::CMeta;

pub type PpiSet = HashSet<PhysPageId>;

impl CMeta {
    /// Все файлы: корневой каталог (0,0), осиротевшие каталоги,
    /// и — при включённом deep-скане — синтетические файлы.
    pub fn for_each_file(&self, cb: &mut dyn FnMut(&str, &VFile)) {
        let mut visited: PpiSet = PpiSet::new();

        // корень: SnapshotDescriptor.ObjRefs.MetaRootDirPage, обычно 0:0
        self.read_dir(PhysPageId::new(0, 0), "", cb, &mut visited);

        // все непосещённые страницы: вдруг это оторванный каталог
        let mut orphan_pages = Vec::new();
        self.for_each_page(|ppi, _| {
            if !visited.contains(&ppi) {
                orphan_pages.push(ppi);
            }
        });
        for ppi in orphan_pages {
            if visited.contains(&ppi) {
                continue; // мог быть посещён рекурсией предыдущего сироты
            }
            let Some(page) = self.page_ref(ppi) else {
                continue;
            };
            // visited для самой страницы намеренно не обновляется
            let mut was = false;
            let page = page.to_vec();
            self.process_dir_page(&page, "", &mut |path, vfi| {
                if !was {
                    info!("found orphaned dir @ {}", ppi);
                    was = true;
                }
                cb(path, vfi);
            }, &mut visited);
        }

        if self.deep_scan_enabled() {
            for vfi in self.deep_scan() {
                let ppi = vfi.attribs.ppi;
                if visited.insert(ppi) {
                    cb(&vfi.name, &vfi);
                }
            }
        }
    }

    /// Каталог по PageStack: каждая полезная страница — массив SDirItemRec.
    /// Уже посещённые страницы не перечитываются.
    pub fn read_dir(
        &self,
        dir_ppi: PhysPageId,
        prefix: &str,
        cb: &mut dyn FnMut(&str, &VFile),
        visited: &mut PpiSet,
    ) {
        let stack = self.get_page_stack(dir_ppi);
        debug!("read_dir({}): page_stack={}", dir_ppi, stack);
        if !stack.valid() {
            return;
        }
        for ppi in &stack {
            let Some(page) = self.get_page(*ppi) else {
                continue;
            };
            if !visited.insert(*ppi) {
                continue;
            }
            self.process_dir_page(&page, prefix, cb, visited);
        }
    }

    /// Сканирует записи до первой невалидной; каталоги раскрываются
    /// рекурсивно с расширением префикса пути.
    pub(super) fn process_dir_page(
        &self,
        page: &[u8],
        prefix: &str,
        cb: &mut dyn FnMut(&str, &VFile),
        visited: &mut PpiSet,
    ) {
        for chunk in page.chunks_exact(SDirItemRec::SIZE) {
            let Some(rec) = SDirItemRec::parse(chunk, 0) else {
                if let Some(name) = SDirItemRec::peek_name(chunk) {
                    debug!("process_dir_page: invalid entry: \"{}\"", name);
                }
                break; // битая запись завершает страницу, но не обход
            };

            let Some(vfi) = VFile::load(&rec) else {
                continue; // ExtFib/Patch каталогом не загружаются
            };

            let path = if prefix.is_empty() {
                rec.name.clone()
            } else {
                format!("{}/{}", prefix, rec.name)
            };
            cb(&path, &vfi);

            if rec.is_dir() {
                if let DirPayload::Directory { children_loc, .. } = rec.payload {
                    self.read_dir(children_loc, &path, cb, visited);
                }
            }
        }
    }
}
