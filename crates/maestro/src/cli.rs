//! Command-line interface for maestro

use crate::api::DEFAULT_PORT;
use argh::FromArgs;
use std::path::PathBuf;

/// Start a project's services in dependency order and keep them supervised
#[derive(FromArgs, Debug)]
pub struct MaestroArgs {
    /// project directory holding maestro.yaml (default: .)
    #[argh(positional, default = "String::from(\".\")")]
    pub dir: String,

    /// port of the HTTP status API (default: 4357)
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    pub port: u16,

    /// validate the service file, print the launch order and exit
    #[argh(switch)]
    pub validate: bool,

    /// do not serve the HTTP status API
    #[argh(switch)]
    pub no_api: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

impl MaestroArgs {
    pub fn project_dir(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }

    /// Log filter for `env_logger`; unknown levels fall back to `info`
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
