use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, LevelFilter};

mod cli;
mod cmd_carve;
mod cmd_crc32;
mod cmd_md;
mod cmd_scan;
mod cmd_vbk;

fn init_logger(verbose: u8, quiet: u8) {
    // Уровень по умолчанию info; -v/-q двигают его, RUST_LOG имеет приоритет.
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbose as i8 - quiet as i8 {
            i8::MIN..=-2 => LevelFilter::Error,
            -1 => LevelFilter::Warn,
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        builder.filter_level(level);
    }
    builder.format_timestamp_millis().init();
}

fn main() {
    let cli = cli::Cli::parse();
    init_logger(cli.verbose, cli.quiet);

    if let Err(e) = cli::run(cli) {
        // логируем ошибку и выходим с кодом 1
        error!("{:#}", e);
        std::process::exit(1);
    }
}
