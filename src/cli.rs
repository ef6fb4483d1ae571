use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "jar-obfuscator")]
#[command(about = "Obfuscate the classes of a Java application jar")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration; defaults to ./jar-obfuscator.toml, then the user config directory
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Obfuscate a jar, or every jar below a directory
    Obfuscate(ObfuscateArgs),
    /// Summarize the classes, resources and manifest of a jar
    Inspect {
        jar: PathBuf,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct ObfuscateArgs {
    pub input: PathBuf,

    #[arg(short = 'o', long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Rename classes to short meaningless names
    #[arg(long)]
    pub rename: bool,

    /// Encrypt string literals
    #[arg(long)]
    pub strings: bool,

    /// Insert dead branches
    #[arg(long)]
    pub flow: bool,

    /// Throw when a debugger agent is attached
    #[arg(long)]
    pub anti_debug: bool,

    /// Only run on the machine with this fingerprint (see the Guard class's main)
    #[arg(long, value_name = "HASH")]
    pub bind_hash: Option<String>,

    /// Only run when launched from this directory
    #[arg(long, value_name = "DIR")]
    pub bind_dir: Option<String>,

    /// Ask for a password at startup; one is generated when no value is given
    #[arg(long, value_name = "PW", num_args = 0..=1)]
    pub password: Option<Option<String>>,

    /// Rename, strings, flow and anti-debug
    #[arg(long)]
    pub all: bool,

    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    #[arg(long, value_name = "N")]
    pub dead_branches: Option<usize>,

    /// Package or class prefix to leave unrenamed (repeatable)
    #[arg(long, value_name = "PREFIX")]
    pub keep: Vec<String>,

    /// Write the rename mapping as JSON
    #[arg(long, value_name = "FILE")]
    pub mapping: Option<PathBuf>,

    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}
