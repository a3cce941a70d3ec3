mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing::Level;

use crate::cli::Cli;

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    init_logging(cli.verbose);

    // Resolve relative paths once so every task row stores an absolute target.
    if cli.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            cli.download_dir = cwd.join(&cli.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(cli))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
