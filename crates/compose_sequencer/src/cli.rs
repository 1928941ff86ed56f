//! Command-line interface for compose_sequencer

use crate::config::AppVersion;
use argh::FromArgs;
use std::path::PathBuf;
use std::time::Duration;

/// Start compose services in dependency order, waiting for each to be ready
#[derive(FromArgs, Debug)]
pub struct SequencerArgs {
    /// compose project name
    #[argh(option, short = 'p')]
    pub project_name: Option<String>,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    /// docker binary to use (default: docker)
    #[argh(option, default = "String::from(\"docker\")")]
    pub docker: String,

    #[argh(subcommand)]
    pub command: Option<Command>,
}

#[derive(FromArgs, Debug, Clone, PartialEq)]
#[argh(subcommand)]
pub enum Command {
    Up(UpArgs),
    Rm(RmArgs),
}

/// Start services in dependency order (the default command)
#[derive(FromArgs, Debug, Clone, Default, PartialEq)]
#[argh(subcommand, name = "up")]
pub struct UpArgs {
    /// compose files, merged in order (default: docker-compose.yml)
    #[argh(positional)]
    pub files: Vec<String>,

    /// failing timeout in seconds for services whose conditions have none
    #[argh(option, from_str_fn(parse_seconds))]
    pub default_timeout: Option<Duration>,

    /// image version to use instead of the one in the compose files, as
    /// <image>:<version>; repeatable
    #[argh(option, short = 'a')]
    pub app_version: Vec<AppVersion>,

    /// show the start plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the compose files and exit
    #[argh(switch)]
    pub validate: bool,
}

/// Remove the containers of a project (requires -p)
#[derive(FromArgs, Debug, Clone, Default, PartialEq)]
#[argh(subcommand, name = "rm")]
pub struct RmArgs {
    /// stop and remove containers that are still running
    #[argh(switch, short = 'f')]
    pub force: bool,
}

/// Parse a non-negative number of seconds, fractions allowed
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid duration '{}'. Expected seconds", s))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("Invalid duration '{}'. {}", s, e))
}

impl SequencerArgs {
    /// The requested command; `up` with defaults when none is given
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Up(UpArgs::default()))
    }

    /// Log filter for the requested level; unknown levels mean `info`
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

impl UpArgs {
    /// Compose files to load, falling back to `docker-compose.yml`
    pub fn compose_files(&self) -> Vec<PathBuf> {
        if self.files.is_empty() {
            return vec![PathBuf::from("docker-compose.yml")];
        }
        self.files.iter().map(PathBuf::from).collect()
    }
}
