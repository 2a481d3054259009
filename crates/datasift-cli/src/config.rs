//! Configuration file handling for datasift-cli

use anyhow::{Context, Result};
use datasift_client::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub username: Option<String>,
    pub api_key: Option<String>,
    /// Stream host
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Recycle after this many milliseconds without interactions
    pub interaction_timeout_ms: Option<u64>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("datasift-cli");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: &ArgOverrides<'_>) -> MergedConfig {
        MergedConfig {
            username: args
                .username
                .map(String::from)
                .or_else(|| self.username.clone())
                .unwrap_or_default(),
            api_key: args
                .api_key
                .map(String::from)
                .or_else(|| self.api_key.clone())
                .unwrap_or_default(),
            host: args
                .host
                .map(String::from)
                .or_else(|| self.host.clone())
                .unwrap_or_else(|| datasift_client::config::DEFAULT_HOST.to_string()),
            port: args
                .port
                .or(self.port)
                .unwrap_or(datasift_client::config::DEFAULT_PORT),
            output: args
                .output
                .map(String::from)
                .or_else(|| self.output.clone())
                .unwrap_or_else(|| "text".to_string()),
            no_color: args.no_color || self.no_color.unwrap_or(false),
            interaction_timeout_ms: self.interaction_timeout_ms,
        }
    }
}

/// Values given on the command line (or through the environment)
#[derive(Debug, Default)]
pub struct ArgOverrides<'a> {
    pub username: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub host: Option<&'a str>,
    pub port: Option<u16>,
    pub output: Option<&'a str>,
    pub no_color: bool,
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone, PartialEq)]
pub struct MergedConfig {
    pub username: String,
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub output: String,
    pub no_color: bool,
    pub interaction_timeout_ms: Option<u64>,
}

impl MergedConfig {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.username, &self.api_key)
            .with_host(&self.host)
            .with_port(self.port)
            .with_user_agent(format!("datasift-cli/{}", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = self.interaction_timeout_ms {
            config.interaction_timeout_ms = timeout;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_args_override_file() {
        let file: Config = toml::from_str(
            r#"
            username = "file-user"
            api_key = "file-key"
            port = 8080
            output = "json"
            "#,
        )
        .unwrap();

        let merged = file.merge_with_args(&ArgOverrides {
            username: Some("cli-user"),
            ..Default::default()
        });

        assert_eq!(merged.username, "cli-user");
        assert_eq!(merged.api_key, "file-key");
        assert_eq!(merged.host, "stream.datasift.com");
        assert_eq!(merged.port, 8080);
        assert_eq!(merged.output, "json");
        assert!(!merged.no_color);
    }

    #[test]
    fn test_defaults_without_file() {
        let merged = Config::default().merge_with_args(&ArgOverrides::default());
        assert_eq!(merged.output, "text");
        assert_eq!(merged.port, 80);
        assert!(merged.username.is_empty());
    }

    #[test]
    fn test_client_config() {
        let file = Config {
            interaction_timeout_ms: Some(1000),
            ..Default::default()
        };
        let merged = file.merge_with_args(&ArgOverrides {
            username: Some("u"),
            api_key: Some("k"),
            host: Some("localhost"),
            ..Default::default()
        });

        let config = merged.client_config();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.interaction_timeout_ms, 1000);
        assert!(config.user_agent.starts_with("datasift-cli/"));
        assert!(config.validate().is_ok());
    }
}
