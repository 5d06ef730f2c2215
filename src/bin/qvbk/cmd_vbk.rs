//! Одношаговая обработка VBK/VIB: валидация заголовка, выбор лучшего
//! слота по числу валидных банков, затем обычный md-поток от этого слота.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use std::path::Path;

use QuiverVBK::io::Reader;
use QuiverVBK::meta::slots::evaluate_slots;
use QuiverVBK::units::bytes2human;
use QuiverVBK::MetaSource;

use crate::cli::MdArgs;
use crate::cmd_md::{self, MdConfig};

pub fn exec(
    vbk_fname: &Path,
    offset: u64,
    explicit_slot: Option<usize>,
    md: &MdArgs,
    force: bool,
    out_dir: Option<&Path>,
) -> Result<()> {
    let reader = Reader::open(vbk_fname)?;
    info!(
        "source vbk {} ({:x} = {})",
        vbk_fname.display(),
        reader.size(),
        bytes2human(reader.size())
    );

    let survey = evaluate_slots(&reader, offset, explicit_slot)?;
    if survey.header_valid && survey.slot_fmt == 0 {
        // slot_fmt=0: значение из реверса, фикстурами пока не подтверждено
        warn!("slot_fmt=0 (max_banks=0xf8) has never been seen in the wild, proceed carefully");
    }
    if survey.merge_would_help() {
        warn!("slot merging would cover more banks. 'scan' command can do that");
    }

    let Some(best) = survey.best() else {
        error!("no valid slots found. cannot continue. try to use 'scan' command");
        return Err(anyhow!("no valid slots found"));
    };
    drop(reader);

    info!(
        "using{} slot @ {:x}",
        if survey.scores.len() == 1 { "" } else { " best" },
        best.offset
    );

    let cfg = MdConfig {
        vbk: Some(vbk_fname.to_path_buf()),
        vbk_offset: 0,
        no_vbk: false,
        force,
        out_dir: out_dir.map(|p| p.to_path_buf()),
        source: MetaSource::Slot,
        meta_offset: best.offset,
    };
    cmd_md::exec_files(&[vbk_fname.to_path_buf()], md, &cfg)
}
