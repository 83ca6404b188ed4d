use std::time::Duration;

use clap::Parser;

/// Runs the HTTP tests described in a YAML, JSON or TOML file
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to test config file
    #[arg(short, long)]
    pub config: String,

    /// Initial variable, can be given several times
    #[arg(short = 'D', long = "define", value_name = "KEY=VALUE", value_parser = parse_definition)]
    pub defines: Vec<(String, String)>,

    /// Give up on a request after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Log what the runner is doing to stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Splits at the first `=`; everything after it is the value.
pub fn parse_definition(definition: &str) -> Result<(String, String), String> {
    definition
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("`{definition}` is not of the form KEY=VALUE"))
}
