//! Client configuration.

use std::time::Duration;

/// Default page size for cursor iteration.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Configuration for a [`Client`](crate::Client).
///
/// Credentials live here and are attached to requests by the transport;
/// entities and queries never look at them.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Application id sent with every request.
    pub app_id: String,
    /// Base URL of the REST API (e.g., "https://api.example.com/server").
    pub server_url: String,
    /// Optional REST API key.
    pub rest_key: Option<String>,
    /// Optional session token of the signed-in user.
    pub session_token: Option<String>,
    /// Page size used by [`Query::each`](crate::Query::each).
    pub batch_size: u32,
    /// Request timeout.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration with default batch size and timeout.
    pub fn new(app_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            rest_key: None,
            session_token: None,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the REST API key.
    pub fn with_rest_key(mut self, key: impl Into<String>) -> Self {
        self.rest_key = Some(key.into());
        self
    }

    /// Sets the session token.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Sets the page size for cursor iteration. Zero is treated as one.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}
