use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};

use QuiverVBK::io::Reader;
use QuiverVBK::units::bytes2human;
use QuiverVBK::{ScanOptions, Scanner};

pub fn exec(
    fname: &Path,
    start: u64,
    blocks: bool,
    carve: bool,
    keysets: Option<PathBuf>,
    force: bool,
    out_dir: Option<&Path>,
) -> Result<()> {
    let size = Reader::get_size(fname)?;
    info!("source vbk {} ({:x} = {})", fname.display(), size, bytes2human(size));

    let mut scanner = Scanner::new(
        fname,
        ScanOptions {
            start,
            find_blocks: blocks,
            carve_mode: carve,
            keysets_dump: keysets,
            out_dir: out_dir.map(|p| p.to_path_buf()),
            force,
        },
    )?;
    scanner.scan()
}
