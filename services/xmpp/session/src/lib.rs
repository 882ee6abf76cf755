//! Client connection engine for xmpp: negotiation, dispatch, stream management, reconnection.
//!
//! This crate drives one client-to-server XMPP stream over a pluggable transport. It
//! negotiates security, authentication and a resource, delivers inbound stanzas to
//! listeners and collectors, tracks acknowledgements with XEP-0198 and resumes the
//! session after a transient disconnect.
//!
//! ## Features
//!
//! - **Transports**: TCP with STARTTLS or direct TLS, WebSocket (RFC 7395), in-memory pipes
//! - **Negotiation**: explicit state machine, pluggable SASL adapters
//! - **Dispatch**: sync listeners in wire order, async listeners on a bounded pool, iq
//!   request handlers with automatic error replies
//! - **Outbound hooks**: interceptors and sending listeners
//! - **Collectors**: bounded, deadline-aware waits for matching stanzas
//! - **Stream Management**: ack tracking, ack requests, resumption with in-order resend
//! - **Auto-reconnect**: capped exponential backoff with jitter
//!
//! ## Tasks
//!
//! ```text
//!                 +-------------+
//!  send() ------> |   outbox    | -- record seq --> unacked queue
//!                 +------+------+
//!                        | mpsc
//!                 +------v------+      +-----------+
//!                 | writer task | ---> | transport |
//!                 +-------------+      +-----+-----+
//!                                            |
//!                 +-------------+            |
//!  listeners <--- | reader task | <----------+
//!  collectors     +-------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xmpp_session::{
//!     Connection, ConnectionConfig, ListenerMode, PlainCredentials, StanzaFilter, TcpConnector,
//! };
//! use xmpp_wire::{Stanza, StanzaKind};
//!
//! # async fn example() -> Result<(), xmpp_session::SessionError> {
//! let config = ConnectionConfig::new("example.com");
//! let connection = Connection::new(
//!     config,
//!     Arc::new(TcpConnector::new("example.com", 5222)),
//!     Arc::new(PlainCredentials::new("alice", "secret")),
//! )?;
//!
//! connection.add_listener(
//!     StanzaFilter::kind(StanzaKind::Message),
//!     |stanza: &Stanza| {
//!         println!("Message from {:?}: {:?}", stanza.from(), stanza.body());
//!         Ok(())
//!     },
//!     ListenerMode::Sync,
//! );
//!
//! connection.connect().await?;
//!
//! let ping = Stanza::iq("get")
//!     .to("example.com")
//!     .extension(xmpp_wire::Element::new("ping", "urn:xmpp:ping"))
//!     .build();
//! let pong = connection.send_iq(ping).await?;
//! println!("Pong: {}", pong);
//!
//! connection
//!     .send(Stanza::message().to("bob@example.com").stanza_type("chat").body("hi").build())?;
//! tokio::time::sleep(Duration::from_secs(1)).await;
//! connection.disconnect().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod keepalive;
pub mod negotiation;
pub mod outbound;
pub mod reconnect;
pub mod reliability;
pub mod sasl;
pub mod stream;
pub mod transport;

// Re-export main types
pub use collector::{Collector, CollectorOptions, CollectorRegistry, OverflowPolicy};
pub use config::{
    ConnectionConfig, OutboundPolicy, SecurityMode, StreamManagementConfig, TlsOptions,
};
pub use connection::{Connection, ConnectionEvent};
pub use dispatch::{
    Dispatcher, IqHandlerCallback, IqRequestType, ListenerCallback, ListenerId, ListenerMode,
    Responder, UnknownIqReply,
};
pub use error::{ErrorKind, NegotiationFailure, SessionError};
pub use filter::StanzaFilter;
pub use keepalive::{AckRequestPolicy, AckRequestScheduler, WhitespaceKeepalive};
pub use negotiation::{NegotiationState, Negotiated, Negotiator, ResumeOutcome};
pub use outbound::{InterceptorCallback, OutboundHooks, SendingCallback};
pub use reconnect::{calculate_backoff, BackoffConfig, ReconnectPolicy};
pub use reliability::{AckListeners, ReliabilitySession, SmCounters};
pub use sasl::{Anonymous, PlainCredentials, SaslAdapter, SaslError, SaslExchange, SaslOutcome};
pub use stream::{FrameReader, FrameWriter, XmlStream};
pub use transport::{Connector, IoStream, MemoryConnector, MemoryListener, TcpConnector};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config};

#[cfg(feature = "websocket")]
pub use transport::websocket::{WebSocketConnector, WsStream};
