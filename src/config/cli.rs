use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the BeeKeeper cache tool.
#[derive(Debug, Parser)]
#[command(
    name = "beekeeper",
    version,
    about = "BeeKeeper's Blog cache and prefetch tool"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "BEEKEEPER_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a warming strategy against the API and print statistics.
    Warm(WarmArgs),
    /// Fetch one query key through the cache and print it.
    Get(GetArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the REST API base URL.
    #[arg(long = "api-base-url", value_name = "URL", global = true)]
    pub api_base_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the directory holding the behaviour profile and snapshots.
    #[arg(long = "storage-dir", value_name = "PATH", global = true)]
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    /// Strategy to run; all strategies bound to `app.init` when omitted.
    #[arg(long, value_name = "NAME")]
    pub strategy: Option<String>,

    /// Route the reader is on.
    #[arg(long, default_value = "/", value_name = "PATH")]
    pub route: String,
}

impl Default for WarmArgs {
    fn default() -> Self {
        Self {
            strategy: None,
            route: "/".to_string(),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    /// Query key as a JSON array, e.g. `["articles","detail",42]`.
    #[arg(value_name = "KEY_JSON")]
    pub key: String,
}
