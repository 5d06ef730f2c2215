use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "qvbk",
    version,
    about = "Forensic recovery and inspection engine for VBK/VIB containers",
    arg_required_else_help = true
)]
pub struct Cli {
    /// increase verbosity
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// decrease verbosity
    #[arg(short = 'q', long, action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,
    /// force continue on errors
    #[arg(short = 'f', long, global = true)]
    pub force: bool,
    /// output dir [default: input filename + ".out"]
    #[arg(short = 'o', long, global = true)]
    pub out_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Общие аргументы обработки метаданных (vbk и md).
#[derive(Args, Debug, Clone)]
pub struct MdArgs {
    /// extract file(s) by name/id/glob; no value = extract all
    #[arg(short = 'x', long, num_args = 0.., value_name = "NAME")]
    pub extract: Option<Vec<String>>,
    /// test file(s) integrity without extraction
    #[arg(short = 't', long, num_args = 0.., value_name = "NAME")]
    pub test: Option<Vec<String>>,
    /// resume file extraction
    #[arg(long)]
    pub resume: bool,
    /// append test results to JSON file
    #[arg(short = 'j', long)]
    pub json_file: Option<PathBuf>,

    /// bank:page - show raw page data ('all' for all pages)
    #[arg(short = 'p', long)]
    pub page: Option<String>,
    /// bank:page - read PageStack starting there ('all' for all stacks)
    #[arg(short = 'S', long)]
    pub stack: Option<String>,
    /// write raw data to file instead of stdout
    #[arg(short = 'w', long)]
    pub write: Option<PathBuf>,

    /// go over all PageStacks and try to interpret them as files
    #[arg(short = 'd', long)]
    pub deep: bool,
    /// try to decompress [zstd] compressed pages
    #[arg(short = 'D', long)]
    pub decompress: bool,

    /// device(s) for extracting files from carved data
    #[arg(long)]
    pub device: Vec<PathBuf>,
    /// carved offset CSV file(s), one per device
    #[arg(long)]
    pub data: Vec<PathBuf>,
    /// do not read blocks, only check hash table membership
    #[arg(long)]
    pub skip_read: bool,

    /// password for decrypting encrypted containers
    #[arg(long, default_value = "")]
    pub password: String,
    /// dump loaded AES keysets (uuid + key + iv)
    #[arg(long)]
    pub dump_keysets: bool,
    /// with --dump-keysets: only dump the session keyset
    #[arg(long)]
    pub session: bool,
    /// skip version detect: force old (false) or new (true) metadata
    #[arg(long)]
    pub new_version: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// one-step vbk/vib processing
    Vbk {
        /// VBK/VIB filename
        filename: PathBuf,
        /// start offset (hex)
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        offset: u64,
        /// pick slot explicitly (default: best by valid banks)
        #[arg(long)]
        slot: Option<usize>,
        #[command(flatten)]
        md: MdArgs,
    },

    /// process metadata file (METADATA/slot/bank)
    Md {
        /// metadata file(s)
        #[arg(required = true)]
        filenames: Vec<PathBuf>,
        /// VBK/VIB file for extracting files
        #[arg(long)]
        vbk: Option<PathBuf>,
        /// VBK start offset (hex), e.g. when opening a physical drive
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        vbk_offset: u64,
        /// work without VBK file, for structure validation
        #[arg(long)]
        no_vbk: bool,
        #[command(flatten)]
        md: MdArgs,
    },

    /// scan for slots, banks and (optionally) data blocks
    #[command(alias = "scan2")]
    Scan {
        /// VBK/VIB file or raw image
        filename: PathBuf,
        /// start offset (hex)
        #[arg(short = 's', long, value_parser = parse_hex, default_value = "0")]
        start: u64,
        /// (or --data) find data blocks
        #[arg(long, alias = "data")]
        blocks: bool,
        /// carve multiple backups from a disk
        #[arg(long)]
        carve: bool,
        /// load keysets dump
        #[arg(long)]
        keysets: Option<PathBuf>,
    },

    /// flat LZ4 + empty-digest carver
    Carve {
        /// raw image / device
        filename: PathBuf,
        /// start offset (hex)
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        offset: u64,
        /// skip LZ4 data blocks
        #[arg(long)]
        no_blocks: bool,
        /// skip empty-digest sightings
        #[arg(long)]
        no_empty: bool,
    },

    /// vcrc32 of a file region
    Crc32 {
        filename: PathBuf,
        /// start offset (hex)
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        offset: u64,
        /// size (hex), default to EOF
        #[arg(long, value_parser = parse_hex)]
        size: Option<u64>,
    },
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

pub fn run(cli: Cli) -> Result<()> {
    let force = cli.force;
    let out_dir = cli.out_dir.clone();
    match cli.cmd {
        Cmd::Vbk {
            filename,
            offset,
            slot,
            md,
        } => cmd_vbk(&filename, offset, slot, &md, force, out_dir.as_deref()),

        Cmd::Md {
            filenames,
            vbk,
            vbk_offset,
            no_vbk,
            md,
        } => {
            let cfg = crate::cmd_md::MdConfig {
                vbk,
                vbk_offset,
                no_vbk,
                force,
                out_dir,
                source: QuiverVBK::MetaSource::Auto,
                meta_offset: 0,
            };
            crate::cmd_md::exec_files(&filenames, &md, &cfg)
        }

        Cmd::Scan {
            filename,
            start,
            blocks,
            carve,
            keysets,
        } => crate::cmd_scan::exec(&filename, start, blocks, carve, keysets, force, out_dir.as_deref()),

        Cmd::Carve {
            filename,
            offset,
            no_blocks,
            no_empty,
        } => crate::cmd_carve::exec(&filename, offset, !no_blocks, !no_empty, out_dir.as_deref()),

        Cmd::Crc32 {
            filename,
            offset,
            size,
        } => crate::cmd_crc32::exec(&filename, offset, size),
    }
}

fn cmd_vbk(
    filename: &std::path::Path,
    offset: u64,
    slot: Option<usize>,
    md: &MdArgs,
    force: bool,
    out_dir: Option<&std::path::Path>,
) -> Result<()> {
    crate::cmd_vbk::exec(filename, offset, slot, md, force, out_dir)
}
