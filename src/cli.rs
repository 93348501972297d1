//! Command-line arguments.

use clap::{Args, Parser, Subcommand, ValueEnum};
use lode_mines::Relative;
use std::path::PathBuf;

/// Index datasets into a queryable SQLite index.
#[derive(Parser, Debug)]
#[command(name = "lode", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Index file, overriding the configured one
    #[arg(long, global = true)]
    pub index: Option<PathBuf>,

    /// Open the index without writing to it
    #[arg(long, global = true)]
    pub read_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Index every file below a directory
    Index(IndexArgs),
    /// Run a SQL statement and print its rows, tab-separated
    Query {
        sql: String,
    },
    /// List the mines registered in the index
    Mines,
}

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Directory to walk
    pub root: PathBuf,

    /// Skip files whose name ends in `.<SUFFIX>`
    #[arg(long = "exclude-suffix", value_name = "SUFFIX")]
    pub exclude_suffixes: Vec<String>,

    /// Skip files whose path matches the regular expression
    #[arg(long = "exclude-regex", value_name = "REGEX")]
    pub exclude_regexes: Vec<String>,

    /// How file paths are stored
    #[arg(long, value_enum, default_value_t = RelativeArg::Absolute)]
    pub relative: RelativeArg,

    /// Also index the members of tar archives
    #[arg(long)]
    pub archives: bool,

    /// Also index getar-style records in tar archives
    #[arg(long)]
    pub records: bool,

    /// Walk again even if this directory has been indexed before
    #[arg(long)]
    pub force: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelativeArg {
    /// As walked
    Absolute,
    /// Relative to the working directory
    Cwd,
    /// Relative to the index file
    Index,
}
impl From<RelativeArg> for Relative {
    fn from(relative: RelativeArg) -> Self {
        match relative {
            RelativeArg::Absolute => Relative::Absolute,
            RelativeArg::Cwd => Relative::WorkingDir,
            RelativeArg::Index => Relative::Index,
        }
    }
}
