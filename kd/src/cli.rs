//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::engine::VERSION;

/// Kiln - incremental build daemon
#[derive(Parser)]
#[command(
    name = "kd",
    about = "Incremental build daemon with continuation-based rules",
    version = VERSION,
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Project directory (defaults to the current directory)
    #[arg(short, long, global = true, value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the project's daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Build a target
    Build {
        target: String,

        /// Build in this process instead of through the daemon
        #[arg(long)]
        local: bool,
    },

    /// Invoke an action
    Run {
        action: String,

        /// Argument override as key=value (string valued)
        #[arg(short, long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// Print events as they happen
        #[arg(short, long)]
        stream: bool,

        /// With --stream, cancel the action if this client goes away
        #[arg(long, requires = "stream")]
        cancel_on_disconnect: bool,

        /// Run in this process instead of through the daemon
        #[arg(long)]
        local: bool,
    },

    /// Show project information
    Info {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Re-read the project's target graph
    Reload,

    /// Follow the events of a run
    Watch { run_id: String },

    /// Cancel a run in progress
    Cancel { run_id: String },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ping the daemon to check if it's alive and responsive
    Ping,
}

/// Parse `key=value`
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Result of checking a compiler used by the built-in rules
pub struct ToolCheck {
    pub name: &'static str,
    pub available: bool,
    pub version: Option<String>,
}

impl ToolCheck {
    /// Check if a tool is available and get its version
    pub fn check(name: &'static str, version_args: &[&str]) -> Self {
        debug!(name, ?version_args, "ToolCheck::check: called");
        match std::process::Command::new(name).args(version_args).output() {
            Ok(output) if output.status.success() => {
                // javac prints its version on stdout, older JDKs on stderr
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Self {
                    name,
                    available: true,
                    version: Some(parse_version(&text)),
                }
            }
            _ => Self {
                name,
                available: false,
                version: None,
            },
        }
    }
}

/// Parse version from command output (extracts first version-like string)
fn parse_version(output: &str) -> String {
    for word in output.split_whitespace() {
        let word = word.trim_start_matches('v');
        if word.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            let version: String = word.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !version.is_empty() {
                return version;
            }
        }
    }
    "unknown".to_string()
}

pub fn check_tools() -> Vec<ToolCheck> {
    vec![ToolCheck::check("javac", &["-version"]), ToolCheck::check("kotlinc", &["-version"])]
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiln")
        .join("logs")
        .join("kiln.log")
}

/// Generate the after_help text with compiler checks and the log location
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let mut help = String::new();

    help.push_str("Compilers:\n");
    for tool in check_tools() {
        let icon = if tool.available { "\u{2705}" } else { "\u{274C}" };
        let version = tool.version.as_deref().unwrap_or("not found");
        help.push_str(&format!("  {} {:<10} {}\n", icon, tool.name, version));
    }

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", get_log_path().display()));
    help
}

/// Output format for status and info commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
