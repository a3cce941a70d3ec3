use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-connection download manager", long_about = None)]
pub struct Cli {
    /// Task store file
    #[arg(long = "store", global = true, default_value = "fdl.json")]
    pub store: PathBuf,

    /// Directory downloads are saved under
    #[arg(short = 'd', long = "download-dir", global = true, default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Proxy URL for every request (e.g. http://127.0.0.1:8080)
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one URL in the foreground; Ctrl-C stops and keeps progress
    Get {
        url: String,

        /// Target file (defaults to the download dir plus the server's name)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Queue a URL in the task store
    Add {
        url: String,

        /// Override the file name
        #[arg(long)]
        filename: Option<String>,

        /// Higher runs first
        #[arg(short = 'p', long, default_value_t = 1)]
        priority: i32,

        #[arg(long)]
        referer: Option<String>,

        /// Extra request header, "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// List stored tasks
    List,

    /// Run the queue until nothing is left to download
    Run {
        /// Concurrent downloads (stored as the max_concurrent setting)
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,
    },

    /// Remove a task
    Remove {
        id: String,

        /// Also delete the downloaded file and any partial data
        #[arg(long)]
        delete_file: bool,
    },

    /// Change a setting (max_concurrent, default_connections)
    Set { key: String, value: String },
}

#[derive(Args, Debug, Clone, Default)]
pub struct TransferArgs {
    /// Connections per file (1-32)
    #[arg(short = 's', long = "split")]
    pub connections: Option<usize>,

    /// Rate cap in bytes per second (e.g. 1048576 for 1 MiB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<u64>,
}
