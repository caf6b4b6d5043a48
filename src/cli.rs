//! Uses clap to define the CLI interface declaratively.
use std::path::PathBuf;

use clap::{command, ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(version, about = "Supervise the service in a directory", long_about = None)]
pub struct Cli {
    /// Service directory containing the `run` entry point
    pub dir: PathBuf,

    /// Dependency mode: supervise only, start the service on `+`
    #[arg(short, long)]
    pub dependency: bool,

    /// Timing configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Report whether DIR is supervised and its last status, then exit
    #[arg(short, long, conflicts_with = "dependency")]
    pub probe: bool,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}
