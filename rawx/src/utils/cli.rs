use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short = 'f', long = "config", env = "RAWX_CONFIG")]
    pub config: PathBuf,

    /// Unused, kept for command line compatibility
    #[arg(short = 'D', hide = true)]
    pub compat: Option<String>,

    /// Write access lines to this file instead of stdout
    #[arg(long, env = "RAWX_ACCESS_LOG")]
    pub access_log: Option<PathBuf>,

    /// Write error and service logs to this file instead of stderr
    #[arg(long, env = "RAWX_ERROR_LOG")]
    pub error_log: Option<PathBuf>,
}
