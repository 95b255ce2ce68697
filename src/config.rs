//! Command line and environment configuration.

use std::path::PathBuf;

use clap::builder::FalseyValueParser;
use clap::Parser;
use log::LevelFilter;

use crate::worker::bridge::{DEFAULT_BRIDGE_SCRIPT, DEFAULT_PYTHON};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "audiosr-worker",
    version,
    about = "Audio super-resolution worker speaking JSON Lines on stdin/stdout"
)]
pub struct WorkerArgs {
    /// Python interpreter used to run the bridge script.
    #[arg(long, env = "AUDIOSR_PYTHON", default_value = DEFAULT_PYTHON)]
    pub python: String,

    /// Bridge script that loads the model and runs inference.
    #[arg(long, env = "AUDIOSR_BRIDGE_SCRIPT", default_value = DEFAULT_BRIDGE_SCRIPT)]
    pub bridge_script: PathBuf,

    /// Log level for the diagnostic stream (error, warn, info, debug, trace, off).
    #[arg(long, env = "AUDIOSR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Keep fd 1 as is instead of pointing it at stderr.
    #[arg(
        long,
        env = "AUDIOSR_NO_STDOUT_ISOLATION",
        value_parser = FalseyValueParser::new()
    )]
    pub no_stdout_isolation: bool,
}

impl WorkerArgs {
    /// Parsed log level. Unknown names fall back to `info`.
    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}
