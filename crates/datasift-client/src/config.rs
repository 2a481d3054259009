//! Client configuration

use std::time::Duration;

use datasift_transport::TransportConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

pub const DEFAULT_HOST: &str = "stream.datasift.com";
pub const DEFAULT_PORT: u16 = 80;
/// Confirmation window after writing a subscribe
pub const DEFAULT_SUBSCRIBE_WAIT_MS: u64 = 750;
/// Recycle the connection after this long without an interaction
pub const DEFAULT_INTERACTION_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STOP_GRACE_MS: u64 = 5_000;

/// Configuration for a [`DataSiftClient`](crate::DataSiftClient)
///
/// Deserializable so it can sit in a config file; only the credentials are
/// required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub username: String,
    pub api_key: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_subscribe_wait_ms")]
    pub subscribe_wait_ms: u64,

    #[serde(default = "default_interaction_timeout_ms")]
    pub interaction_timeout_ms: u64,

    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Give up for good on 401/404 instead of retrying
    #[serde(default = "default_true")]
    pub halt_on_fatal_status: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_user_agent() -> String {
    format!("DataSiftRust/{}", env!("CARGO_PKG_VERSION"))
}

fn default_subscribe_wait_ms() -> u64 {
    DEFAULT_SUBSCRIBE_WAIT_MS
}

fn default_interaction_timeout_ms() -> u64 {
    DEFAULT_INTERACTION_TIMEOUT_MS
}

fn default_socket_timeout_ms() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            api_key: api_key.into(),
            host: default_host(),
            port: default_port(),
            user_agent: default_user_agent(),
            subscribe_wait_ms: DEFAULT_SUBSCRIBE_WAIT_MS,
            interaction_timeout_ms: DEFAULT_INTERACTION_TIMEOUT_MS,
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            halt_on_fatal_status: true,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Both credentials must be present
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(ClientError::Configuration(
                "a username is required".to_string(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(ClientError::Configuration(
                "an API key is required".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ClientError::Configuration("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Value of the Host header; the port is left out when it is 80
    pub fn host_header(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }

    pub fn subscribe_wait(&self) -> Duration {
        Duration::from_millis(self.subscribe_wait_ms)
    }

    pub fn interaction_timeout(&self) -> Duration {
        Duration::from_millis(self.interaction_timeout_ms)
    }

    /// Transport settings with the stream's request headers
    pub fn transport_config(&self) -> Result<TransportConfig> {
        self.validate()?;

        let config = TransportConfig::parse(&self.endpoint())?
            .with_header("User-Agent", &self.user_agent)?
            .with_header("Host", &self.host_header())?
            .with_header("Connection", "Keep-Alive")?
            .with_header("Transfer-Encoding", "chunked")?
            .with_header(
                "Authorization",
                &format!("{}:{}", self.username, self.api_key),
            )?
            .with_socket_timeout(Duration::from_millis(self.socket_timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_stop_grace(Duration::from_millis(self.stop_grace_ms))
            .with_halt_on_fatal_status(self.halt_on_fatal_status);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("user", "key");
        assert_eq!(config.host, "stream.datasift.com");
        assert_eq!(config.port, 80);
        assert_eq!(config.subscribe_wait(), Duration::from_millis(750));
        assert_eq!(config.interaction_timeout(), Duration::from_secs(300));
        assert!(config.halt_on_fatal_status);
        assert_eq!(config.endpoint(), "http://stream.datasift.com:80/");
    }

    #[test]
    fn test_missing_credentials() {
        assert!(matches!(
            ClientConfig::new("", "key").validate(),
            Err(ClientError::Configuration(_))
        ));
        assert!(matches!(
            ClientConfig::new("user", "  ").validate(),
            Err(ClientError::Configuration(_))
        ));
        assert!(ClientConfig::new("user", "key").validate().is_ok());
    }

    #[test]
    fn test_request_headers() {
        let config = ClientConfig::new("alice", "s3cret")
            .with_port(8080)
            .with_user_agent("test-agent/1.0")
            .transport_config()
            .unwrap();

        let header = |name: &str| config.headers.get(name).unwrap().to_str().unwrap().to_string();
        assert_eq!(header("authorization"), "alice:s3cret");
        assert_eq!(header("user-agent"), "test-agent/1.0");
        assert_eq!(header("host"), "stream.datasift.com:8080");
        assert_eq!(header("connection"), "Keep-Alive");
        assert_eq!(header("transfer-encoding"), "chunked");
        assert_eq!(config.endpoint.as_str(), "http://stream.datasift.com:8080/");
    }

    #[test]
    fn test_host_header_omits_default_port() {
        assert_eq!(ClientConfig::new("u", "k").host_header(), "stream.datasift.com");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            username = "alice"
            api_key = "s3cret"
            subscribe_wait_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.username, "alice");
        assert_eq!(config.subscribe_wait_ms, 50);
        assert_eq!(config.socket_timeout_ms, DEFAULT_SOCKET_TIMEOUT_MS);
        assert_eq!(config.host, DEFAULT_HOST);
    }
}
