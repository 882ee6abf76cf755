//! Configuration handling for the xmpp client.
//!
//! Values come from a YAML file, then environment variables, then command-line flags.
//! Durations are humantime strings such as `30s` or `5m`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use xmpp_session::{
    AckRequestPolicy, BackoffConfig, ConnectionConfig, ReconnectPolicy, SecurityMode,
    StreamManagementConfig, TlsOptions,
};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Account address, `user@domain`
    pub jid: String,
    /// Account password
    pub password: String,
    /// Requested resource
    pub resource: Option<String>,
    /// Server host; the jid's domain when empty
    pub host: Option<String>,
    /// Server port
    pub port: u16,
    /// Connect over WebSocket instead of TCP
    pub websocket_url: Option<String>,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Reply timeout for requests and negotiation steps
    pub reply_timeout: String,
    /// Transport connect timeout
    pub connect_timeout: String,
    /// Whitespace keepalive interval; empty disables it
    pub keepalive_interval: String,
    /// Stream management
    pub stream_management: SmConfig,
    /// Reconnection
    pub reconnect: ReconnectConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// `required`, `if_possible` or `disabled`
    pub mode: String,
    /// Use TLS from the first byte instead of STARTTLS
    pub direct: bool,
    /// Name to verify the certificate against
    pub server_name: Option<String>,
    /// Path to an extra CA certificate file (PEM format)
    pub ca_file: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: "required".to_string(),
            direct: false,
            server_name: None,
            ca_file: None,
        }
    }
}

/// Stream management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmConfig {
    /// Enable stream management
    pub enabled: bool,
    /// Request a resumable session
    pub resumption: bool,
    /// Preferred resumption window
    pub max_resumption: String,
    /// Request an ack every this many stanzas; 0 disables it
    pub ack_every: u32,
    /// Request an ack after this long with unacked stanzas; empty disables it
    pub ack_interval: String,
    /// Queue capacity while reconnecting
    pub max_unacked: usize,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resumption: true,
            max_resumption: "5m".to_string(),
            ack_every: 5,
            ack_interval: "30s".to_string(),
            max_unacked: 1000,
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after unexpected loss
    pub enabled: bool,
    /// Give up after this many attempts; 0 retries forever
    pub max_attempts: u32,
    /// First delay
    pub initial_delay: String,
    /// Delay cap
    pub max_delay: String,
    /// Growth factor
    pub factor: f64,
    /// Jitter fraction
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay: "1s".to_string(),
            max_delay: "60s".to_string(),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            jid: String::new(),
            password: String::new(),
            resource: None,
            host: None,
            port: 5222,
            websocket_url: None,
            tls: TlsConfig::default(),
            reply_timeout: "5s".to_string(),
            connect_timeout: "30s".to_string(),
            keepalive_interval: "60s".to_string(),
            stream_management: SmConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<ClientConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(jid) = std::env::var("XMPP_JID") {
            info!("JID overridden by environment: {}", jid);
            self.jid = jid;
        }
        if let Ok(password) = std::env::var("XMPP_PASSWORD") {
            self.password = password;
        }
        if let Ok(host) = std::env::var("XMPP_HOST") {
            info!("Host overridden by environment: {}", host);
            self.host = Some(host);
        }
        if let Ok(port) = std::env::var("XMPP_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid XMPP_PORT {:?}", port),
            }
        }
        if let Ok(url) = std::env::var("XMPP_WEBSOCKET_URL") {
            info!("WebSocket URL overridden by environment: {}", url);
            self.websocket_url = Some(url);
        }
        if let Ok(resource) = std::env::var("XMPP_RESOURCE") {
            self.resource = Some(resource);
        }
    }

    /// Split the jid into local part and domain
    pub fn account(&self) -> Result<(String, String)> {
        let bare = self.jid.split('/').next().unwrap_or_default();
        match bare.split_once('@') {
            Some((user, domain)) if !user.is_empty() && !domain.is_empty() => {
                Ok((user.to_string(), domain.to_string()))
            }
            _ => bail!("jid {:?} is not of the form user@domain", self.jid),
        }
    }

    /// Host to open the transport to
    pub fn server_host(&self) -> Result<String> {
        match &self.host {
            Some(host) if !host.is_empty() => Ok(host.clone()),
            _ => Ok(self.account()?.1),
        }
    }

    /// Build the library configuration
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let (_, domain) = self.account()?;
        let mut config = ConnectionConfig::new(domain);

        config.resource = self.resource.clone().filter(|r| !r.is_empty());
        config.security = parse_security_mode(&self.tls.mode)?;
        config.tls = TlsOptions {
            server_name: self.tls.server_name.clone(),
            extra_ca_pem: match &self.tls.ca_file {
                Some(path) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("reading CA file {}", path))?,
                ),
                None => None,
            },
        };
        config.reply_timeout = parse_duration("reply_timeout", &self.reply_timeout)?;
        config.connect_timeout = parse_duration("connect_timeout", &self.connect_timeout)?;
        config.keepalive_interval =
            parse_optional_duration("keepalive_interval", &self.keepalive_interval)?;

        let sm = &self.stream_management;
        config.stream_management = StreamManagementConfig {
            enabled: sm.enabled,
            resumption: sm.resumption,
            preferred_max_resumption: parse_optional_duration(
                "stream_management.max_resumption",
                &sm.max_resumption,
            )?,
            ack_request: AckRequestPolicy {
                every_stanzas: Some(sm.ack_every).filter(|n| *n > 0),
                interval: parse_optional_duration("stream_management.ack_interval", &sm.ack_interval)?,
            },
            max_unacked: sm.max_unacked,
        };

        let rc = &self.reconnect;
        config.reconnect = ReconnectPolicy {
            enabled: rc.enabled,
            max_attempts: Some(rc.max_attempts).filter(|n| *n > 0),
            backoff: BackoffConfig {
                initial_delay: parse_duration("reconnect.initial_delay", &rc.initial_delay)?,
                max_delay: parse_duration("reconnect.max_delay", &rc.max_delay)?,
                factor: rc.factor,
                jitter: rc.jitter,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_security_mode(mode: &str) -> Result<SecurityMode> {
    match mode.to_ascii_lowercase().replace('-', "_").as_str() {
        "required" => Ok(SecurityMode::Required),
        "if_possible" => Ok(SecurityMode::IfPossible),
        "disabled" => Ok(SecurityMode::Disabled),
        other => bail!("unknown TLS mode {:?}", other),
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).with_context(|| format!("invalid duration for {}", field))
}

fn parse_optional_duration(field: &str, value: &str) -> Result<Option<Duration>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    parse_duration(field, value).map(Some)
}
