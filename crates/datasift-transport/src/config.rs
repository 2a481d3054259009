//! Transport configuration

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::TransportError;

/// Idle time without inbound bytes before the socket is torn down
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
/// TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a stopped connection keeps draining the response body
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Configuration for a [`PersistentConnection`](crate::PersistentConnection)
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upstream endpoint
    pub endpoint: Url,
    /// Headers sent with every connect attempt
    pub headers: HeaderMap,
    /// Socket idle timeout
    pub socket_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Drain window after `stop()`
    pub stop_grace: Duration,
    /// Written on the request body as soon as a link comes up
    pub greeting: Option<Bytes>,
    /// Stop reconnecting after 401/404
    pub halt_on_fatal_status: bool,
}

impl TransportConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            headers: HeaderMap::new(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            greeting: Some(Bytes::from_static(b"\n")),
            halt_on_fatal_status: true,
        }
    }

    /// Parse the endpoint from a string
    pub fn parse(endpoint: &str) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| TransportError::InvalidConfig(format!("endpoint {endpoint}: {e}")))?;
        Ok(Self::new(endpoint))
    }

    /// Add a request header
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidConfig(format!("header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidConfig(format!("header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_greeting(mut self, greeting: Option<Bytes>) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn with_halt_on_fatal_status(mut self, halt: bool) -> Self {
        self.halt_on_fatal_status = halt;
        self
    }
}
