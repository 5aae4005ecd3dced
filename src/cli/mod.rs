//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running both pipelines end to end on in-memory backends (`demo`)
//! - Inspecting configuration (`config show`, `config check`)
//! - Applying database migrations (`migrate`, feature `postgres`)

mod config;
mod demo;

pub use config::{ConfigCommand, load_config, run_config_command};
pub use demo::{DemoReport, run_demo_command};

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "im-presence")]
#[command(about = "Presence registry and offline message worker for IM gateways")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Load environment variables from this file instead of ./.env
    #[arg(short, long, global = true)]
    pub env_file: Option<std::path::PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the registry and worker scenarios against in-memory backends
    Demo {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Apply pending database migrations
    #[cfg(feature = "postgres")]
    Migrate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_demo_with_global_flags() {
        let cli = Cli::try_parse_from(["im-presence", "--log-format", "json", "demo", "--json"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Demo { json: true }));
    }

    #[test]
    fn test_parse_config_check() {
        let cli = Cli::try_parse_from(["im-presence", "config", "check", "-e", "/tmp/x.env"])
            .unwrap();
        assert!(matches!(cli.command, Command::Config(ConfigCommand::Check)));
        assert_eq!(cli.env_file.as_deref(), Some(std::path::Path::new("/tmp/x.env")));
    }
}
