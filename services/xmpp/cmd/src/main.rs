//! XMPP client binary.
//!
//! Connects an account, logs inbound messages and connection events, optionally sends
//! one chat message and stays online until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xmpp_session::{
    make_client_config, Connection, ConnectionEvent, Connector, IqRequestType, ListenerMode,
    PlainCredentials, StanzaFilter, TcpConnector, WebSocketConnector,
};
use xmpp_wire::{Stanza, StanzaKind};

mod config;
mod logging;

use config::ClientConfig;
use logging::ClientLogFormatter;

/// XMPP client with stream management and automatic reconnection
#[derive(Parser, Debug)]
#[command(name = "redb-xmpp", version, about = "XMPP client with stream resumption")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "xmpp.yaml")]
    config: PathBuf,

    /// Account address, e.g. alice@example.com
    #[arg(long)]
    jid: Option<String>,

    /// Account password
    #[arg(long)]
    password: Option<String>,

    /// Requested resource
    #[arg(long)]
    resource: Option<String>,

    /// Server host (defaults to the jid's domain)
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Connect over WebSocket, e.g. wss://example.com/xmpp-websocket
    #[arg(long, conflicts_with_all = ["host", "port"])]
    websocket_url: Option<String>,

    /// Use TLS from the first byte instead of STARTTLS
    #[arg(long)]
    direct_tls: bool,

    /// Reply timeout, e.g. 10s
    #[arg(long)]
    reply_timeout: Option<humantime::Duration>,

    /// Send a chat message to this address after connecting
    #[arg(long, requires = "message")]
    to: Option<String>,

    /// Body of the chat message
    #[arg(long, requires = "to")]
    message: Option<String>,

    /// Disconnect once the message is acknowledged instead of staying online
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(jid) = &self.jid {
            config.jid = jid.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(resource) = &self.resource {
            config.resource = Some(resource.clone());
        }
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = &self.websocket_url {
            config.websocket_url = Some(url.clone());
        }
        if self.direct_tls {
            config.tls.direct = true;
        }
        if let Some(timeout) = self.reply_timeout {
            config.reply_timeout = timeout.to_string();
        }
    }
}

fn build_connector(config: &ClientConfig) -> anyhow::Result<Arc<dyn Connector>> {
    if let Some(url) = config.websocket_url.as_ref().filter(|u| !u.is_empty()) {
        info!("Using WebSocket transport {}", url);
        return Ok(Arc::new(WebSocketConnector::new(url.clone())));
    }

    let host = config.server_host()?;
    let mut connector = TcpConnector::new(host.clone(), config.port);
    if config.tls.direct {
        let extra_ca = match &config.tls.ca_file {
            Some(path) => Some(
                std::fs::read_to_string(path).with_context(|| format!("reading CA file {}", path))?,
            ),
            None => None,
        };
        let tls = make_client_config(extra_ca.as_deref()).context("building TLS config")?;
        let sni = config.tls.server_name.clone().unwrap_or(config.account()?.1);
        connector = connector.with_direct_tls(Arc::new(tls), sni);
    }
    info!("Using TCP transport {}:{} (direct TLS: {})", host, config.port, config.tls.direct);
    Ok(Arc::new(connector))
}

async fn log_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} connection events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ConnectionEvent::Connected { jid, resumed } => {
                crate::component_info!("events", "Online as {:?} (resumed: {})", jid, resumed);
            }
            ConnectionEvent::ConnectionLost { error } => {
                crate::component_warn!("events", "Connection lost: {}", error);
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                crate::component_info!("events", "Reconnecting in {:?} (attempt {})", delay, attempt);
            }
            ConnectionEvent::ReconnectionFailed { error } => {
                crate::component_warn!("events", "Reconnection failed: {}", error);
            }
            ConnectionEvent::StanzasAcknowledged { stanzas } => {
                tracing::debug!(component = "events", "{} stanzas acknowledged", stanzas.len());
            }
            ConnectionEvent::DeliveryUnknown { stanzas } => {
                let ids: Vec<&str> = stanzas.iter().filter_map(|s| s.id()).collect();
                crate::component_warn!("events", "Delivery unknown for {:?}", ids);
            }
            ConnectionEvent::Failed { error } => {
                crate::component_warn!("events", "Connection failed: {}", error);
            }
            ConnectionEvent::Disconnected => {
                crate::component_info!("events", "Disconnected");
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("xmpp_session={}", args.log_level).parse()?)
        .add_directive(format!("xmpp_wire={}", args.log_level).parse()?)
        .add_directive(format!("redb_xmpp={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(ClientLogFormatter::new("xmpp"))
        .init();

    info!("Starting reDB XMPP client v{}", env!("CARGO_PKG_VERSION"));

    let mut client_config = ClientConfig::load_from_file(&args.config)?;
    args.apply(&mut client_config);

    let connection_config = client_config
        .connection_config()
        .context("invalid configuration")?;
    let reply_timeout = connection_config.reply_timeout;
    let (user, _) = client_config.account()?;
    let connector = build_connector(&client_config)?;
    let credentials = Arc::new(PlainCredentials::new(user, client_config.password.clone()));

    let connection = Connection::new(connection_config, connector, credentials)?;
    let event_logger = tokio::spawn(log_events(connection.events()));

    connection.add_listener(
        StanzaFilter::kind(StanzaKind::Message).and(StanzaFilter::custom(|s: &Stanza| {
            s.body().is_some()
        })),
        |stanza: &Stanza| {
            info!(
                "Message from {}: {}",
                stanza.from().unwrap_or("server"),
                stanza.body().unwrap_or_default()
            );
            Ok(())
        },
        ListenerMode::Sync,
    );

    // Answer server pings (XEP-0199)
    connection.register_iq_request_handler(
        "ping",
        "urn:xmpp:ping",
        IqRequestType::Get,
        ListenerMode::Sync,
        |request: &Stanza| Ok(Some(request.reply().stanza_type("result").build())),
    );

    connection
        .connect()
        .await
        .with_context(|| format!("connecting as {}", client_config.jid))?;

    // Announce availability
    connection.send(Stanza::presence().build())?;

    let mut sent = None;
    if let (Some(to), Some(body)) = (&args.to, &args.message) {
        let message = Stanza::message()
            .to(to.clone())
            .stanza_type("chat")
            .body(body.clone())
            .build();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = std::sync::Mutex::new(Some(done_tx));
        if let Some(id) = message.id() {
            connection.add_stanza_id_acknowledged_listener(id, move |stanza: &Stanza| {
                info!("Message {:?} acknowledged by the server", stanza.id());
                if let Some(tx) = done_tx.lock().ok().and_then(|mut tx| tx.take()) {
                    let _ = tx.send(());
                }
            });
        }
        connection.send(message)?;
        if let Err(e) = connection.request_ack() {
            warn!("Cannot request acknowledgement: {}", e);
        }
        info!("Sent message to {}", to);
        sent = Some(done_rx);
    }

    if args.once {
        if let Some(done_rx) = sent {
            if tokio::time::timeout(reply_timeout, done_rx).await.is_err() {
                warn!("No acknowledgement within {:?}", reply_timeout);
            }
        }
    } else {
        info!("Online; press Ctrl-C to disconnect");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    }

    info!("Shutting down");
    connection.disconnect().await?;
    event_logger.abort();
    Ok(())
}
