//! Обработка метаданных: листинг, extract/test, сырые страницы и
//! PageStack'и. Вызывается и напрямую (md), и из vbk-потока.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use std::io::Read as _;
use std::path::{Path, PathBuf};

use QuiverVBK::consts::PAGE_SIZE;
use QuiverVBK::extract::{ExtractContext, ExtractOptions};
use QuiverVBK::io::Reader;
use QuiverVBK::meta::{CMeta, MetaOptions, MetaSource};
use QuiverVBK::units::bytes2human;
use QuiverVBK::util::{get_out_dir, get_out_pathname};
use QuiverVBK::vbk::PhysPageId;
use QuiverVBK::HashTable;

use crate::cli::MdArgs;

pub struct MdConfig {
    pub vbk: Option<PathBuf>,
    pub vbk_offset: u64,
    pub no_vbk: bool,
    pub force: bool,
    pub out_dir: Option<PathBuf>,
    pub source: MetaSource,
    pub meta_offset: u64,
}

pub fn exec_files(md_fnames: &[PathBuf], md: &MdArgs, cfg: &MdConfig) -> Result<()> {
    // общий файл дампа ключей при нескольких входах
    let keysets_same_file = if md.dump_keysets && md_fnames.len() > 1 {
        let out_dir = get_out_dir(&md_fnames[0], cfg.out_dir.as_deref())?;
        let p = out_dir.join("all_keysets.bin");
        let _ = std::fs::remove_file(&p);
        Some(p)
    } else {
        None
    };

    let mut result = Ok(());
    for md_fname in md_fnames {
        if let Err(e) = exec_file(md_fname, md, cfg, keysets_same_file.clone()) {
            error!("{}: {:#}", md_fname.display(), e);
            result = Err(anyhow!("processing {} failed", md_fname.display()));
        }
    }
    result
}

fn meta_options(md: &MdArgs, cfg: &MdConfig, keysets_same_file: Option<PathBuf>) -> MetaOptions {
    MetaOptions {
        offset: cfg.meta_offset,
        source: cfg.source,
        password: md.password.clone(),
        ignore_errors: cfg.force,
        dump_keysets: md.dump_keysets,
        dump_session_only: md.session,
        keysets_same_file,
        out_dir: cfg.out_dir.clone(),
    }
}

fn create_meta(
    md_fname: &Path,
    md: &MdArgs,
    cfg: &MdConfig,
    keysets_same_file: Option<PathBuf>,
) -> Result<CMeta> {
    let opts = meta_options(md, cfg, keysets_same_file);
    let mut meta = CMeta::open(md_fname, &opts)?;
    if let Some(v) = md.new_version {
        meta.set_version(v);
    }
    if md.deep {
        meta.set_deep_scan(true);
    }
    Ok(meta)
}

fn exec_file(
    md_fname: &Path,
    md: &MdArgs,
    cfg: &MdConfig,
    keysets_same_file: Option<PathBuf>,
) -> Result<()> {
    info!("processing {}", md_fname.display());

    // .bank + --dump-keysets: ключи дампит конструктор, больше делать нечего
    if md.dump_keysets && md_fname.extension().and_then(|e| e.to_str()) == Some("bank") {
        let _ = create_meta(md_fname, md, cfg, keysets_same_file)?;
        return Ok(());
    }

    if let Some(page_id) = &md.page {
        return read_page(md_fname, md, cfg, page_id, md.write.as_deref());
    }
    if let Some(stack_id) = &md.stack {
        return read_stack(md_fname, md, cfg, stack_id);
    }

    if md.extract.is_some() || md.test.is_some() {
        let test_only = md.extract.is_none();
        let mut names = if test_only {
            md.test.clone().unwrap_or_default()
        } else {
            md.extract.clone().unwrap_or_default()
        };
        if names.is_empty() {
            names.push(String::new()); // пустое имя = все файлы
        }
        for name in names {
            extract_file(md_fname, md, cfg, keysets_same_file.clone(), &name, test_only)?;
        }
        return Ok(());
    }

    list_files(md_fname, md, cfg, keysets_same_file)
}

fn list_files(
    md_fname: &Path,
    md: &MdArgs,
    cfg: &MdConfig,
    keysets_same_file: Option<PathBuf>,
) -> Result<()> {
    let meta = create_meta(md_fname, md, cfg, keysets_same_file)?;
    meta.for_each_file(&mut |pathname, vfi| {
        let size_str = if vfi.is_dir() {
            String::new()
        } else if vfi.attribs.filesize == -1 {
            "?".to_string()
        } else {
            bytes2human(vfi.attribs.filesize.max(0) as u64)
        };
        info!(
            "{} {:6} {:8x} {:6} {}",
            vfi.attribs.ppi,
            vfi.type_str(),
            vfi.attribs.n_blocks,
            size_str,
            pathname
        );
    });
    Ok(())
}

/// Подбор VBK по пути метаданных: подняться по каталогам до "*.out",
/// отрезать суффикс и проверить, что исходник существует.
fn guess_vbk_fname(md_fname: &Path) -> Option<PathBuf> {
    let mut path = md_fname.to_path_buf();
    for _ in 0..5 {
        let s = path.to_string_lossy();
        if let Some(stripped) = s.strip_suffix(".out") {
            let cand = PathBuf::from(stripped);
            if cand.exists() {
                return Some(cand);
            }
        }
        path = path.parent()?.to_path_buf();
    }
    None
}

fn extract_file(
    md_fname: &Path,
    md: &MdArgs,
    cfg: &MdConfig,
    keysets_same_file: Option<PathBuf>,
    xname: &str,
    test_only: bool,
) -> Result<()> {
    // короткий "bank:page" трактуется как PPI
    let mut needle_ppi = PhysPageId::new(-1, -1);
    if xname.contains(':') && xname.len() < 10 {
        if let Some(ppi) = PhysPageId::parse_str(xname) {
            if !ppi.zero() {
                needle_ppi = ppi;
            }
        }
    }

    let mut device_files = Vec::new();
    for dev in &md.device {
        device_files.push(Reader::open(dev)?);
    }

    // внешняя хэш-таблица (carving-режим)
    let mut ex_ht = HashTable::new();
    if !md.data.is_empty() {
        if md.data.len() != md.device.len() {
            return Err(anyhow!(
                "mismatch between --data files ({}) and --device files ({})",
                md.data.len(),
                md.device.len()
            ));
        }
        let cache_fname = get_out_pathname(md_fname, "ht_cache.bin", cfg.out_dir.as_deref())?;
        let csvs: Vec<&Path> = md.data.iter().map(|p| p.as_path()).collect();
        ex_ht.load(&csvs, &cache_fname)?;
    }

    // выбор источника данных
    let vbk_fname: Option<PathBuf> = if cfg.no_vbk {
        None
    } else if let Some(vbk) = &cfg.vbk {
        Some(vbk.clone())
    } else {
        guess_vbk_fname(md_fname)
    };

    if vbk_fname.is_none() && device_files.is_empty() && !cfg.no_vbk {
        return Err(anyhow!(
            "no --vbk nor --device specified and can't guess vbk filename from path"
        ));
    }
    if cfg.no_vbk && !test_only {
        return Err(anyhow!("no VBK file specified, can't extract files without it"));
    }

    let vbkf = match &vbk_fname {
        Some(f) => {
            let r = Reader::open(f)?;
            info!("source vbk {} ({:x} = {})", f.display(), r.size(), bytes2human(r.size()));
            Some(r)
        }
        None => None,
    };

    let meta = create_meta(md_fname, md, cfg, keysets_same_file)?;

    let opts = ExtractOptions {
        md_fname: md_fname.to_path_buf(),
        out_dir: cfg.out_dir.clone(),
        json_fname: md.json_file.clone(),
        xname: xname.to_string(),
        needle_ppi,
        test_only,
        no_read: md.skip_read,
        resume: md.resume,
        vbk_offset: cfg.vbk_offset,
    };
    if md.skip_read {
        info!("disabled reading blocks, only checking hash table membership");
    }

    let mut ctx = ExtractContext::new(&meta, vbkf, &ex_ht, device_files, opts)?;
    let mut walk_error = None;
    meta.for_each_file(&mut |pathname, vfi| {
        if walk_error.is_some() {
            return;
        }
        if let Err(e) = ctx.process_file(pathname, vfi) {
            walk_error = Some(anyhow!("{}: {:#}", pathname, e));
        }
    });
    if let Some(e) = walk_error {
        return Err(e);
    }
    ctx.report_unused();

    if !xname.is_empty() && !ctx.found {
        if needle_ppi.valid() {
            error!("file with id {} not found in metadata", needle_ppi);
        } else {
            error!("file \"{}\" not found in metadata", xname);
        }
        return Err(anyhow!("file not found"));
    }

    Ok(())
}

fn hexdump_page(buf: &[u8]) {
    for (i, chunk) in buf.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        println!("    {:04x}: {:<47} {}", i * 16, hex.join(" "), ascii);
    }
}

fn read_page(
    md_fname: &Path,
    md: &MdArgs,
    cfg: &MdConfig,
    id: &str,
    out_fname: Option<&Path>,
) -> Result<()> {
    let meta = create_meta(md_fname, md, cfg, None)?;

    if id == "all" {
        meta.for_each_page(|ppi, page| {
            println!("{}", ppi);
            hexdump_page(page);
        });
        return Ok(());
    }

    let ppi = PhysPageId::parse_str(id).ok_or_else(|| anyhow!("bad page id {:?}", id))?;
    info!("reading page {}", ppi);
    let mut page = meta
        .get_page(ppi)
        .ok_or_else(|| anyhow!("page {} is missing", ppi))?;

    // zstd-сжатые страницы по запросу разворачиваются
    if page.len() >= 4 && page[0..4] == [0x28, 0xb5, 0x2f, 0xfd] {
        if md.decompress {
            let mut out = Vec::new();
            let decoder = zstd::stream::read::Decoder::new(&page[..])?.single_frame();
            match decoder.take(0x20000).read_to_end(&mut out) {
                Ok(_) => {
                    info!("decompressed: {:x} -> {:x} bytes", page.len(), out.len());
                    page = out;
                }
                Err(e) => warn!("zstd decompress failed: {}", e),
            }
        } else {
            warn!("[zstd magic detected, but decompress is not enabled]");
        }
    }

    match out_fname {
        None => hexdump_page(&page),
        Some(out) => {
            std::fs::write(out, &page)?;
            info!("saved {} bytes to \"{}\"", page.len(), out.display());
        }
    }
    Ok(())
}

fn read_stack(md_fname: &Path, md: &MdArgs, cfg: &MdConfig, id: &str) -> Result<()> {
    let meta = create_meta(md_fname, md, cfg, None)?;

    if id == "all" {
        meta.for_each_page(|ppi, _| {
            let ps = meta.get_page_stack(ppi);
            if ps.valid() {
                info!("{}: {}", ppi, ps);
            }
        });
        return Ok(());
    }

    let ppi = PhysPageId::parse_str(id).ok_or_else(|| anyhow!("bad page id {:?}", id))?;
    info!("reading PageStack {}", ppi);
    let ps = meta.get_page_stack(ppi);
    if !ps.valid() {
        return Err(anyhow!("no valid PageStack at {}", ppi));
    }
    info!("{}", ps);
    if log::log_enabled!(log::Level::Debug) {
        for (idx, page_ppi) in ps.iter().enumerate() {
            if let Some(page) = meta.get_page(*page_ppi) {
                info!("page {} ({}/{})", page_ppi, idx, ps.len());
                hexdump_page(&page[..PAGE_SIZE.min(page.len())]);
            }
        }
    }
    Ok(())
}
