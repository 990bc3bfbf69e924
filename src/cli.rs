use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// quorum — fan a code review out to a council of AI agents and let a
/// decision maker adjudicate their verdicts
#[derive(Parser, Debug)]
#[command(name = "quorum", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the council config file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Analysis mode: inline, batch, or explore
    #[arg(long, global = true)]
    pub mode: Option<String>,

    /// Comma-separated check categories
    #[arg(long, global = true)]
    pub checks: Option<String>,

    /// Extra review instructions
    #[arg(long, global = true)]
    pub extra: Option<String>,

    /// Language the reviewers must reply in
    #[arg(long, global = true)]
    pub language: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Review the diff of a repository against a base branch
    Diff {
        /// Repository path
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Base branch to diff against
        #[arg(long, default_value = "main")]
        base: String,
    },
    /// Review an explicit list of files
    Files {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Review a whole repository
    Codebase {
        /// Repository directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Char budget per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Comma-separated extension filter (defaults built in)
        #[arg(long)]
        extensions: Option<String>,
    },
    /// List known agent CLIs and whether they are installed
    Agents,
    /// Validate a council config file and print the verdict as JSON
    ValidateConfig { path: PathBuf },
}

/// Split a comma-separated flag value, dropping empty entries.
pub fn split_csv(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}
