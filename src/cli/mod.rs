use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new ustar archive from the given files and directories.
    #[command(alias = "c")]
    Create {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Add files and directories to the end of an existing archive.
    #[command(alias = "r")]
    Append {
        #[command(flatten)]
        common: CommonArgs,

        /// JSON array of entries already in the archive (`[{"path", "offset", "size"}]`).
        /// New entries then overwrite the old end-of-archive marker instead of following it.
        /// Needed whenever the archive file already holds data.
        #[arg(long)]
        existing_index: Option<PathBuf>,

        /// Leave out entries whose name is already listed in the existing index.
        #[arg(long, requires = "existing_index")]
        skip_existing: bool,
    },
}

/// Options shared by `create` and `append`.
#[derive(clap::Args, Clone, Debug)]
pub struct CommonArgs {
    /// Files and directories to archive. Directories are added recursively.
    pub inputs: Vec<PathBuf>,

    /// The archive to write. `-` writes to standard output.
    #[arg(short = 'f', long = "file", default_value = "-")]
    pub file: PathBuf,

    /// List archived entries on stderr. Repeat for a long listing.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Skip entries that cannot be read instead of stopping at the first one.
    #[arg(long)]
    pub keep_going: bool,

    /// Fail entries whose owner or group id has no name instead of storing an empty name.
    #[arg(long)]
    pub strict_ids: bool,
}

/// Environment variable holding a `tracing` filter directive, e.g. `minitar=debug`.
pub const LOG_ENV: &str = "MINITAR_LOG";

/// Parses command-line arguments using `clap` and returns the command to execute.
///
/// This is the main entry point for the CLI logic.
/// It handles parsing and returns a `Commands` enum variant, or an error if parsing fails.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}
