use anyhow::Result;
use std::path::Path;

use QuiverVBK::util::get_out_pathname;
use QuiverVBK::Carver;

pub fn exec(
    fname: &Path,
    offset: u64,
    find_blocks: bool,
    find_empty: bool,
    out_dir: Option<&Path>,
) -> Result<()> {
    let base = fname
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "carved".to_string());
    let out_base = get_out_pathname(fname, &format!("{}-carved.csv", base), out_dir)?;

    let mut carver = Carver::new(fname, offset, &out_base, find_blocks, find_empty)?;
    carver.process()
}
