use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Base URL of the stage services (overrides the configuration file)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive session
    Session {
        /// Initial target language code
        #[arg(short, long)]
        language: Option<String>,

        /// Video to open when the session starts
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Run extract, translate, synthesize and merge for one video
    Run {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Target language code
        #[arg(short, long)]
        language: Option<String>,

        /// Save the merged video to this file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List supported target languages
    Languages,

    /// Write a configuration file with default values
    Init {
        /// Destination path
        #[arg(default_value = "dubflow.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
