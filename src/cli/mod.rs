use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "p2pshare")]
#[command(about = "Share files with peers through a central tracker", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.config/p2pshare/config.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Tracker address, host or host:port (default: 127.0.0.1:6600)
    #[arg(long, short = 't', global = true)]
    pub tracker: Option<String>,

    /// Share directory to index, serve from and download into
    #[arg(long, short = 's', global = true)]
    pub share: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index the share directory and serve it to peers until interrupted
    Serve,

    /// List every file known to the tracker
    List,

    /// Download a file from the first peer that has it
    Fetch {
        /// File name as listed by the tracker
        filename: String,
    },

    /// Index, serve, and read list/request/quit commands from stdin
    Shell,

    /// Print the digest that would be registered for a file
    Hash {
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
