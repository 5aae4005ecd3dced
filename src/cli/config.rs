//! Configuration CLI commands.

use std::path::Path;

use clap::Subcommand;

use crate::config::Config;

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the effective configuration as JSON
    Show,

    /// Validate configuration and report the first problem
    Check,
}

/// Load configuration from `env_file` when given, else from the process
/// environment and `./.env`.
pub fn load_config(env_file: Option<&Path>) -> anyhow::Result<Config> {
    let config = match env_file {
        Some(path) => Config::from_env_file(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

/// Run a config command.
pub fn run_config_command(cmd: ConfigCommand, env_file: Option<&Path>) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let config = load_config(env_file)?;
            println!("{}", serde_json::to_string_pretty(&redacted(&config))?);
        }
        ConfigCommand::Check => match load_config(env_file) {
            Ok(config) => {
                println!("Configuration OK");
                println!("  Registry prefix:  {}", config.registry.key_prefix);
                println!("  Lease TTL:        {}s", config.registry.lease_ttl.as_secs());
                println!("  Worker group:     {}", config.worker.group_id);
                println!("  Topics:           {}", config.worker.topics.join(", "));
                println!(
                    "  Database:         {}",
                    if config.database.url.is_some() {
                        "configured"
                    } else {
                        "not set (in-memory store)"
                    }
                );
            }
            Err(e) => {
                println!("Configuration invalid: {}", e);
                std::process::exit(1);
            }
        },
    }
    Ok(())
}

/// Config with the database password masked.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(url) = config.database.url.as_mut() {
        *url = mask_password(url);
    }
    config
}

fn mask_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:****@{}", scheme, user, host),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://app:s3cret@db:5432/im"),
            "postgres://app:****@db:5432/im"
        );
        assert_eq!(mask_password("postgres://db/im"), "postgres://db/im");
        assert_eq!(mask_password("not a url"), "not a url");
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "OFFLINE_GROUP_ID=cli-test-group").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.worker.group_id, "cli-test-group");
    }
}
