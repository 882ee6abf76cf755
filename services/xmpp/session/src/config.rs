//! Connection configuration.

use std::time::Duration;

use crate::dispatch::UnknownIqReply;
use crate::error::SessionError;
use crate::keepalive::AckRequestPolicy;
use crate::reconnect::ReconnectPolicy;

/// How strictly transport security is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Fail unless the transport is secure or STARTTLS succeeds
    #[default]
    Required,
    /// Use STARTTLS when offered, continue in plain text otherwise
    IfPossible,
    /// Never attempt STARTTLS
    Disabled,
}

/// TLS parameters for STARTTLS
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Name to verify the certificate against (defaults to the domain)
    pub server_name: Option<String>,
    /// Extra trusted CA certificates in PEM form
    pub extra_ca_pem: Option<String>,
}

/// What `send` does while the connection is being re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboundPolicy {
    /// Queue into the unacknowledged queue while it has room
    #[default]
    QueueWhileReconnecting,
    /// Return `NotConnected` immediately
    FailFast,
}

/// Stream management (XEP-0198) settings
#[derive(Debug, Clone)]
pub struct StreamManagementConfig {
    /// Enable stream management when the server offers it
    pub enabled: bool,
    /// Ask the server for a resumable session
    pub resumption: bool,
    /// Preferred maximum resumption window
    pub preferred_max_resumption: Option<Duration>,
    /// When to send `<r/>`
    pub ack_request: AckRequestPolicy,
    /// Capacity of the unacknowledged queue while reconnecting
    pub max_unacked: usize,
}

impl Default for StreamManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resumption: true,
            preferred_max_resumption: Some(Duration::from_secs(300)),
            ack_request: AckRequestPolicy::default(),
            max_unacked: 1000,
        }
    }
}

/// Configuration for one [`Connection`](crate::Connection)
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service domain (the `to` of the stream header)
    pub domain: String,
    /// Requested resource; the server picks one when `None`
    pub resource: Option<String>,
    /// Authorization identity handed to the SASL adapter
    pub authzid: Option<String>,
    /// Security policy
    pub security: SecurityMode,
    /// TLS parameters
    pub tls: TlsOptions,
    /// Default stream language
    pub lang: Option<String>,
    /// Bound on every negotiation step and `send_iq`
    pub reply_timeout: Duration,
    /// Bound on opening the transport
    pub connect_timeout: Duration,
    /// Whitespace keepalive interval on an idle stream
    pub keepalive_interval: Option<Duration>,
    /// Maximum size of one inbound element
    pub max_element_size: usize,
    /// Stream management settings
    pub stream_management: StreamManagementConfig,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Outbound behaviour while reconnecting
    pub outbound_policy: OutboundPolicy,
    /// Maximum concurrently running async listener invocations
    pub async_listener_workers: usize,
    /// Async invocations waiting for a worker before the reader pauses
    pub async_listener_queue: usize,
    /// Answer to iq requests without a registered handler
    pub unknown_iq_reply: UnknownIqReply,
}

impl ConnectionConfig {
    /// Defaults for the given domain
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            resource: None,
            authzid: None,
            security: SecurityMode::default(),
            tls: TlsOptions::default(),
            lang: None,
            reply_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(60)),
            max_element_size: xmpp_wire::DEFAULT_MAX_ELEMENT_SIZE,
            stream_management: StreamManagementConfig::default(),
            reconnect: ReconnectPolicy::default(),
            outbound_policy: OutboundPolicy::default(),
            async_listener_workers: 16,
            async_listener_queue: 1024,
            unknown_iq_reply: UnknownIqReply::default(),
        }
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.domain.is_empty() {
            return Err(SessionError::Config("Domain must not be empty".to_string()));
        }
        if self.reply_timeout.is_zero() {
            return Err(SessionError::Config("Reply timeout must be > 0".to_string()));
        }
        if self.async_listener_workers == 0 {
            return Err(SessionError::Config(
                "Async listener workers must be > 0".to_string(),
            ));
        }
        if self.async_listener_queue == 0 {
            return Err(SessionError::Config(
                "Async listener queue must be > 0".to_string(),
            ));
        }
        if self.stream_management.ack_request.every_stanzas == Some(0) {
            return Err(SessionError::Config(
                "Ack request stanza threshold must be > 0".to_string(),
            ));
        }
        self.reconnect.backoff.validate().map_err(SessionError::Config)
    }

    /// Name used for certificate verification
    pub fn tls_server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.domain)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ConnectionConfig::new("example.com");
        assert!(config.validate().is_ok());
        assert_eq!(config.security, SecurityMode::Required);
        assert_eq!(config.tls_server_name(), "example.com");
        assert!(config.stream_management.enabled);
        assert_eq!(config.unknown_iq_reply, UnknownIqReply::FeatureNotImplemented);
    }

    #[test]
    fn test_zero_async_queue_rejected() {
        let mut config = ConnectionConfig::new("example.com");
        config.async_listener_queue = 0;
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = ConnectionConfig::new("example.com");
        config.reconnect.backoff.factor = 0.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_empty_domain_rejected() {
        let config = ConnectionConfig::new("");
        assert!(config.validate().is_err());
    }
}
