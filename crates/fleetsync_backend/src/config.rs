//! Backend configuration.

use fleetsync_protocol::PROTOCOL_VERSION;
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// Configuration for the reference backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Address the demo server binds to.
    pub listen_addr: SocketAddr,
    /// Token sessions must present, if any.
    pub token: Option<String>,
    /// Whether confirming events carry the mutation's correlation id.
    pub echo_correlation: bool,
    /// Actions refused with a `MutationRejected` frame.
    pub reject_actions: BTreeSet<String>,
    /// Events buffered per session before it is considered lagging.
    pub feed_capacity: usize,
    /// Protocol version clients must speak.
    pub protocol_version: u16,
}

impl BackendConfig {
    /// Creates a configuration bound to `listen_addr`.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            token: None,
            echo_correlation: true,
            reject_actions: BTreeSet::new(),
            feed_capacity: 1024,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Requires sessions to present `token`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets whether confirming events echo correlation ids.
    pub fn with_echo_correlation(mut self, echo: bool) -> Self {
        self.echo_correlation = echo;
        self
    }

    /// Refuses every mutation with this action type.
    pub fn with_rejected_action(mut self, action: impl Into<String>) -> Self {
        self.reject_actions.insert(action.into());
        self
    }

    /// Sets the per-session feed capacity.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BackendConfig::default();
        assert!(config.echo_correlation);
        assert!(config.token.is_none());
        assert_eq!(config.listen_addr.port(), 8080);
    }

    #[test]
    fn config_builder() {
        let config = BackendConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_token("s3cret")
            .with_echo_correlation(false)
            .with_rejected_action("delete")
            .with_feed_capacity(0);

        assert_eq!(config.token.as_deref(), Some("s3cret"));
        assert!(!config.echo_correlation);
        assert!(config.reject_actions.contains("delete"));
        assert_eq!(config.feed_capacity, 1);
    }
}
