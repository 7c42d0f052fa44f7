use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "timelapse",
    version,
    about = "Step through the history of a file with per-line authorship from Mercurial"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// File to inspect in the interactive viewer.
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Include merge commits in the revision list.
    #[arg(long, global = true)]
    pub merges: bool,

    /// Path to the `hg` executable (overrides the config file).
    #[arg(long, value_name = "PATH", global = true)]
    pub hg: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the revision list of a file without the interactive viewer.
    Log {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Wait for annotations, merge dates and patches of every revision.
        #[arg(long)]
        details: bool,
    },
    /// Check that `hg` can be run and show the active configuration.
    Doctor,
}
