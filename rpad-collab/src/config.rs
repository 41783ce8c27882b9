//! Session configuration.

use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Everything a session needs besides its editor.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the document
    pub uri: String,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Configuration for document `id` served from `origin`.
    pub fn for_document(origin: &str, id: &str) -> Self {
        Self::new(socket_uri(origin, id))
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Socket endpoint for document `id` on `origin`.
///
/// `https://` origins map to `wss://`, anything else to `ws://`.
pub fn socket_uri(origin: &str, id: &str) -> String {
    let origin = origin.trim_end_matches('/');
    let (scheme, host) = if let Some(host) = origin.strip_prefix("https://") {
        ("wss", host)
    } else if let Some(host) = origin.strip_prefix("http://") {
        ("ws", host)
    } else if let Some(host) = origin.strip_prefix("wss://") {
        ("wss", host)
    } else if let Some(host) = origin.strip_prefix("ws://") {
        ("ws", host)
    } else {
        ("ws", origin)
    };
    format!("{scheme}://{host}/api/socket/{id}")
}
