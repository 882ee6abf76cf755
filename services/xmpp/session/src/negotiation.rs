//! Stream negotiation state machine.
//!
//! ## States
//!
//! ```text
//! Disconnected -> Connecting -> StreamOpened -+-> SecurityNegotiation --+
//!                    ^                        |                        |
//!                    +------------------------+-- (restart) <----------+
//!                    |                        |
//!                    +-- (restart) <-- AuthNegotiation <---------------+
//!                                             |
//!                                             +-> Resuming ---------> Connected
//!                                             |       | rejected
//!                                             +-> ResourceBinding -> EnablingStreamManagement -> Connected
//! ```
//!
//! Every step performs exactly one protocol exchange and returns the next state or a
//! typed failure. The caller publishes each state as it is entered; on failure the
//! stream is closed and the connection moves to `Failed`.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xmpp_wire::{ns, Element, Frame, Nonza, SmEnabled, Stanza, StreamFeatures, StreamHeader};

use crate::config::{ConnectionConfig, SecurityMode};
use crate::error::{NegotiationFailure, SessionError};
use crate::filter::StanzaFilter;
use crate::sasl::{select_mechanism, SaslAdapter, SaslOutcome};
use crate::stream::XmlStream;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// No transport
    Disconnected,
    /// Transport open, stream header being exchanged
    Connecting,
    /// Header received, waiting for features
    StreamOpened,
    /// STARTTLS in progress
    SecurityNegotiation,
    /// SASL in progress
    AuthNegotiation,
    /// Resuming a stream-management session
    Resuming,
    /// Binding a resource
    ResourceBinding,
    /// Enabling stream management
    EnablingStreamManagement,
    /// Ready for stanza traffic
    Connected,
    /// Unrecoverable failure
    Failed,
}

impl NegotiationState {
    /// True for the states a negotiation passes through
    pub fn is_negotiating(self) -> bool {
        !matches!(
            self,
            NegotiationState::Disconnected | NegotiationState::Connected | NegotiationState::Failed
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Connecting => "connecting",
            NegotiationState::StreamOpened => "stream-opened",
            NegotiationState::SecurityNegotiation => "security-negotiation",
            NegotiationState::AuthNegotiation => "auth-negotiation",
            NegotiationState::Resuming => "resuming",
            NegotiationState::ResourceBinding => "resource-binding",
            NegotiationState::EnablingStreamManagement => "enabling-stream-management",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happened to a requested resumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// No resumption was requested or the server does not offer it
    NotAttempted,
    /// Server resumed the session and handled `h` stanzas
    Resumed {
        /// Handled count reported by the server
        h: u32,
    },
    /// Server refused to resume
    Rejected {
        /// Handled count, if the server reported one
        h: Option<u32>,
    },
}

/// Result of a successful negotiation
#[derive(Debug)]
pub struct Negotiated {
    /// Established stream
    pub stream: XmlStream,
    /// Stream id from the server header
    pub stream_id: Option<String>,
    /// Bound address (unchanged on resumption)
    pub jid: Option<String>,
    /// Resumption result
    pub resumption: ResumeOutcome,
    /// Server's `<enabled/>`, when stream management was enabled
    pub sm_enabled: Option<SmEnabled>,
    /// Stanzas read during negotiation, to be dispatched after `Connected`
    pub early_stanzas: Vec<Stanza>,
}

/// Inputs for choosing the step after `<stream:features/>`
#[derive(Debug, Clone, Copy)]
pub(crate) struct RouteContext {
    pub secure: bool,
    pub security: SecurityMode,
    pub authenticated: bool,
    pub resume_pending: bool,
}

/// Pick the next state from the advertised features
pub(crate) fn route_features(
    features: &StreamFeatures,
    ctx: RouteContext,
) -> Result<NegotiationState, SessionError> {
    if !ctx.secure {
        match ctx.security {
            SecurityMode::Disabled if features.starttls_required() => {
                return Err(NegotiationFailure::Security(
                    "server requires STARTTLS but TLS is disabled".to_string(),
                )
                .into());
            }
            SecurityMode::Required if features.starttls.is_none() => {
                return Err(NegotiationFailure::Security(
                    "STARTTLS not offered on an insecure transport".to_string(),
                )
                .into());
            }
            SecurityMode::Required | SecurityMode::IfPossible if features.starttls.is_some() => {
                return Ok(NegotiationState::SecurityNegotiation);
            }
            _ => {}
        }
    }

    if !ctx.authenticated {
        if features.mechanisms.is_empty() {
            return Err(NegotiationFailure::Auth("no SASL mechanisms offered".to_string()).into());
        }
        return Ok(NegotiationState::AuthNegotiation);
    }

    if ctx.resume_pending && features.stream_management {
        return Ok(NegotiationState::Resuming);
    }
    if features.bind {
        return Ok(NegotiationState::ResourceBinding);
    }
    Err(NegotiationFailure::Bind("server offered no resource binding".to_string()).into())
}

/// Drives one transport through negotiation
pub struct Negotiator<'a> {
    config: &'a ConnectionConfig,
    sasl: &'a dyn SaslAdapter,
    stream: Option<XmlStream>,
    resume: Option<Nonza>,
    features: StreamFeatures,
    stream_id: Option<String>,
    authenticated: bool,
    jid: Option<String>,
    resumption: ResumeOutcome,
    sm_enabled: Option<SmEnabled>,
    early_stanzas: Vec<Stanza>,
}

impl<'a> Negotiator<'a> {
    /// Negotiate over `stream`; `resume` is the `<resume/>` of a previous session
    pub fn new(
        stream: XmlStream,
        config: &'a ConnectionConfig,
        sasl: &'a dyn SaslAdapter,
        resume: Option<Nonza>,
    ) -> Self {
        Self {
            config,
            sasl,
            stream: Some(stream),
            resume,
            features: StreamFeatures::default(),
            stream_id: None,
            authenticated: false,
            jid: None,
            resumption: ResumeOutcome::NotAttempted,
            sm_enabled: None,
            early_stanzas: Vec::new(),
        }
    }

    /// Run from `Connecting` to `Connected`, reporting each state entered
    pub async fn run<F>(mut self, mut on_transition: F) -> Result<Negotiated, SessionError>
    where
        F: FnMut(NegotiationState),
    {
        let mut state = NegotiationState::Connecting;
        while state != NegotiationState::Connected {
            match self.step(state).await {
                Ok(next) => {
                    debug!("Negotiation {} -> {}", state, next);
                    state = next;
                    on_transition(state);
                }
                Err(e) => {
                    warn!("Negotiation failed in {}: {}", state, e);
                    if let Some(stream) = self.stream.take() {
                        stream.abort().await;
                    }
                    return Err(e);
                }
            }
        }

        let stream = self.stream.take().ok_or(SessionError::ConnectionClosed)?;
        Ok(Negotiated {
            stream,
            stream_id: self.stream_id,
            jid: self.jid,
            resumption: self.resumption,
            sm_enabled: self.sm_enabled,
            early_stanzas: self.early_stanzas,
        })
    }

    /// Perform the single protocol step belonging to `state`
    pub async fn step(&mut self, state: NegotiationState) -> Result<NegotiationState, SessionError> {
        match state {
            NegotiationState::Connecting => self.open_stream().await,
            NegotiationState::StreamOpened => self.read_features().await,
            NegotiationState::SecurityNegotiation => self.starttls().await,
            NegotiationState::AuthNegotiation => self.authenticate().await,
            NegotiationState::Resuming => self.resume().await,
            NegotiationState::ResourceBinding => self.bind().await,
            NegotiationState::EnablingStreamManagement => self.enable_sm().await,
            other => Err(SessionError::IllegalState(other)),
        }
    }

    fn stream(&mut self) -> Result<&mut XmlStream, SessionError> {
        self.stream.as_mut().ok_or(SessionError::ConnectionClosed)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.reply_timeout
    }

    async fn read(&mut self, what: &'static str, deadline: Instant) -> Result<Frame, SessionError> {
        let timeout = self.config.reply_timeout;
        let stream = self.stream()?;
        match tokio::time::timeout_at(deadline, stream.next_frame()).await {
            Err(_) => Err(SessionError::timeout(what, timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Frame::Nonza(Nonza::StreamError(cond)))) => Err(SessionError::Stream {
                condition: cond.condition,
                text: cond.text,
            }),
            Ok(Ok(Frame::StreamClose)) => Err(SessionError::ConnectionClosed),
            Ok(Ok(frame)) => Ok(frame),
        }
    }

    async fn next_nonza(&mut self, what: &'static str) -> Result<Nonza, SessionError> {
        let deadline = self.deadline();
        loop {
            match self.read(what, deadline).await? {
                Frame::Nonza(nonza) => return Ok(nonza),
                Frame::Stanza(stanza) => self.early_stanzas.push(stanza),
                other => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "unexpected {} while waiting for {}",
                        other.name(),
                        what
                    )))
                }
            }
        }
    }

    async fn send_and_await_reply(
        &mut self,
        request: Stanza,
        what: &'static str,
    ) -> Result<Stanza, SessionError> {
        let filter = StanzaFilter::reply_to(&request);
        self.stream()?.send(&Frame::Stanza(request)).await?;
        let deadline = self.deadline();
        loop {
            match self.read(what, deadline).await? {
                Frame::Stanza(stanza) if filter.matches(&stanza) => return Ok(stanza),
                Frame::Stanza(stanza) => self.early_stanzas.push(stanza),
                Frame::Nonza(nonza) => {
                    debug!("Ignoring {} while waiting for {}", nonza.name(), what);
                }
                Frame::StreamOpen(_) | Frame::StreamClose => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "unexpected stream boundary while waiting for {}",
                        what
                    )))
                }
            }
        }
    }

    async fn open_stream(&mut self) -> Result<NegotiationState, SessionError> {
        let header =
            StreamHeader::client(self.config.domain.clone()).with_lang(self.config.lang.clone());
        let stream = self.stream()?;
        stream.restart();
        stream.send(&Frame::StreamOpen(header)).await?;

        let deadline = self.deadline();
        match self.read("stream header", deadline).await? {
            Frame::StreamOpen(header) => {
                debug!("Stream opened: id={:?}, from={:?}", header.id, header.from);
                self.stream_id = header.id;
                Ok(NegotiationState::StreamOpened)
            }
            other => Err(SessionError::ProtocolViolation(format!(
                "expected stream header, got {}",
                other.name()
            ))),
        }
    }

    async fn read_features(&mut self) -> Result<NegotiationState, SessionError> {
        match self.next_nonza("stream features").await? {
            Nonza::Features(features) => {
                debug!(
                    "Features: starttls={:?}, mechanisms={:?}, bind={}, sm={}",
                    features.starttls,
                    features.mechanisms,
                    features.bind,
                    features.stream_management
                );
                let ctx = RouteContext {
                    secure: self.stream()?.is_secure(),
                    security: self.config.security,
                    authenticated: self.authenticated,
                    resume_pending: self.resume.is_some(),
                };
                let next = route_features(&features, ctx);
                self.features = features;
                next
            }
            other => Err(SessionError::ProtocolViolation(format!(
                "expected stream features, got {}",
                other.name()
            ))),
        }
    }

    #[cfg(feature = "tls")]
    async fn starttls(&mut self) -> Result<NegotiationState, SessionError> {
        self.stream()?.send(&Frame::Nonza(Nonza::StartTls)).await?;
        match self.next_nonza("STARTTLS reply").await? {
            Nonza::TlsProceed => {}
            Nonza::TlsFailure => {
                return Err(NegotiationFailure::Security("server refused STARTTLS".to_string()).into())
            }
            other => {
                return Err(SessionError::ProtocolViolation(format!(
                    "unexpected {} during STARTTLS",
                    other.name()
                )))
            }
        }

        let tls_config = crate::transport::tls::make_client_config(
            self.config.tls.extra_ca_pem.as_deref(),
        )
        .map_err(|e| NegotiationFailure::Security(format!("{:#}", e)))?;
        let stream = self.stream.take().ok_or(SessionError::ConnectionClosed)?;
        let upgraded = stream
            .starttls(std::sync::Arc::new(tls_config), self.config.tls_server_name())
            .await
            .map_err(|e| NegotiationFailure::Security(e.to_string()))?;
        self.stream = Some(upgraded);
        info!("TLS established with {}", self.config.tls_server_name());
        Ok(NegotiationState::Connecting)
    }

    #[cfg(not(feature = "tls"))]
    async fn starttls(&mut self) -> Result<NegotiationState, SessionError> {
        Err(NegotiationFailure::Security("built without TLS support".to_string()).into())
    }

    async fn authenticate(&mut self) -> Result<NegotiationState, SessionError> {
        let mechanism = select_mechanism(self.sasl, &self.features.mechanisms).ok_or_else(|| {
            NegotiationFailure::Auth(format!(
                "no shared mechanism (server offers {:?})",
                self.features.mechanisms
            ))
        })?;
        let (mut exchange, initial) = self
            .sasl
            .select_and_begin(&mechanism, self.config.authzid.as_deref())
            .map_err(|e| NegotiationFailure::Auth(e.to_string()))?;
        debug!("SASL mechanism {}", mechanism);

        self.stream()?
            .send(&Frame::Nonza(Nonza::SaslAuth {
                mechanism: mechanism.clone(),
                initial,
            }))
            .await?;

        loop {
            match self.next_nonza("SASL reply").await? {
                Nonza::SaslChallenge(challenge) => match exchange.evaluate_challenge(&challenge) {
                    SaslOutcome::Response(data) => {
                        self.stream()?.send(&Frame::Nonza(Nonza::SaslResponse(data))).await?;
                    }
                    SaslOutcome::Success => {
                        self.stream()?
                            .send(&Frame::Nonza(Nonza::SaslResponse(Vec::new())))
                            .await?;
                    }
                    SaslOutcome::Failure(reason) => {
                        self.stream()?.send(&Frame::Nonza(Nonza::SaslAbort)).await?;
                        return Err(NegotiationFailure::Auth(reason).into());
                    }
                },
                Nonza::SaslSuccess(additional) => {
                    match exchange.verify_success(additional.as_deref()) {
                        SaslOutcome::Failure(reason) => {
                            return Err(NegotiationFailure::Auth(reason).into())
                        }
                        _ => {
                            info!("Authenticated with {}", mechanism);
                            self.authenticated = true;
                            return Ok(NegotiationState::Connecting);
                        }
                    }
                }
                Nonza::SaslFailure(cond) => {
                    let reason = match cond.text {
                        Some(text) => format!("{}: {}", cond.condition, text),
                        None => cond.condition,
                    };
                    return Err(NegotiationFailure::Auth(reason).into());
                }
                other => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "unexpected {} during SASL",
                        other.name()
                    )))
                }
            }
        }
    }

    async fn resume(&mut self) -> Result<NegotiationState, SessionError> {
        let request = self.resume.take().ok_or(SessionError::IllegalState(NegotiationState::Resuming))?;
        let expected_previd = match &request {
            Nonza::SmResume { previd, .. } => Some(previd.clone()),
            _ => None,
        };
        self.stream()?.send(&Frame::Nonza(request)).await?;

        match self.next_nonza("resumption reply").await? {
            Nonza::SmResumed { h, previd } => {
                if expected_previd.as_deref() != Some(previd.as_str()) {
                    return Err(SessionError::ProtocolViolation(format!(
                        "server resumed {} but {:?} was requested",
                        previd, expected_previd
                    )));
                }
                info!("Stream resumed (h={})", h);
                self.resumption = ResumeOutcome::Resumed { h };
                Ok(NegotiationState::Connected)
            }
            Nonza::SmFailed { condition, h } => {
                warn!("Resumption rejected: {:?}", condition);
                self.resumption = ResumeOutcome::Rejected { h };
                if self.features.bind {
                    Ok(NegotiationState::ResourceBinding)
                } else {
                    Err(NegotiationFailure::Bind("server offered no resource binding".to_string())
                        .into())
                }
            }
            other => Err(SessionError::ProtocolViolation(format!(
                "unexpected {} during resumption",
                other.name()
            ))),
        }
    }

    async fn bind(&mut self) -> Result<NegotiationState, SessionError> {
        let mut bind = Element::new("bind", ns::BIND);
        if let Some(resource) = &self.config.resource {
            bind.push_child(Element::new("resource", ns::BIND).with_text(resource.clone()));
        }
        let request = Stanza::iq("set").extension(bind).build();
        let reply = self.send_and_await_reply(request, "bind result").await?;
        if reply.stanza_type() == Some("error") {
            return Err(NegotiationFailure::Bind(
                reply.error_condition().unwrap_or("undefined-condition").to_string(),
            )
            .into());
        }

        let jid = reply
            .extension("bind", ns::BIND)
            .and_then(|ext| ext.element().get_child("jid", ns::BIND))
            .map(|jid| jid.text().trim().to_string())
            .filter(|jid| !jid.is_empty())
            .ok_or_else(|| NegotiationFailure::Bind("bind result carries no jid".to_string()))?;
        info!("Bound as {}", jid);
        self.jid = Some(jid);

        if self.features.session_required() {
            let request = Stanza::iq("set")
                .extension(Element::new("session", ns::SESSION))
                .build();
            let reply = self.send_and_await_reply(request, "session result").await?;
            if reply.stanza_type() == Some("error") {
                return Err(NegotiationFailure::Bind(format!(
                    "session: {}",
                    reply.error_condition().unwrap_or("undefined-condition")
                ))
                .into());
            }
            debug!("Legacy session established");
        }

        if self.config.stream_management.enabled && self.features.stream_management {
            Ok(NegotiationState::EnablingStreamManagement)
        } else {
            Ok(NegotiationState::Connected)
        }
    }

    async fn enable_sm(&mut self) -> Result<NegotiationState, SessionError> {
        let sm = &self.config.stream_management;
        let max = sm
            .preferred_max_resumption
            .filter(|_| sm.resumption)
            .map(secs_u32);
        let enable = Nonza::SmEnable {
            resume: sm.resumption,
            max,
        };
        self.stream()?.send(&Frame::Nonza(enable)).await?;

        match self.next_nonza("stream management reply").await? {
            Nonza::SmEnabled(enabled) => {
                self.sm_enabled = Some(enabled);
            }
            Nonza::SmFailed { condition, .. } => {
                warn!(
                    "Stream management not enabled ({}), continuing without it",
                    condition.as_deref().unwrap_or("no condition")
                );
            }
            other => {
                return Err(SessionError::ProtocolViolation(format!(
                    "unexpected {} while enabling stream management",
                    other.name()
                )))
            }
        }
        Ok(NegotiationState::Connected)
    }
}

fn secs_u32(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(starttls: Option<bool>, mechanisms: &[&str], bind: bool, sm: bool) -> StreamFeatures {
        StreamFeatures {
            starttls,
            mechanisms: mechanisms.iter().map(|m| m.to_string()).collect(),
            bind,
            session: None,
            stream_management: sm,
            other: Vec::new(),
        }
    }

    fn ctx(secure: bool, security: SecurityMode, authenticated: bool) -> RouteContext {
        RouteContext {
            secure,
            security,
            authenticated,
            resume_pending: false,
        }
    }

    #[test]
    fn test_route_security() {
        let offered = features(Some(false), &["PLAIN"], false, false);
        assert_eq!(
            route_features(&offered, ctx(false, SecurityMode::Required, false)).unwrap(),
            NegotiationState::SecurityNegotiation
        );
        assert_eq!(
            route_features(&offered, ctx(false, SecurityMode::IfPossible, false)).unwrap(),
            NegotiationState::SecurityNegotiation
        );
        // Already secure, STARTTLS is skipped
        assert_eq!(
            route_features(&offered, ctx(true, SecurityMode::Required, false)).unwrap(),
            NegotiationState::AuthNegotiation
        );
        assert_eq!(
            route_features(&offered, ctx(false, SecurityMode::Disabled, false)).unwrap(),
            NegotiationState::AuthNegotiation
        );
    }

    #[test]
    fn test_route_security_failures() {
        let none = features(None, &["PLAIN"], false, false);
        let err = route_features(&none, ctx(false, SecurityMode::Required, false)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Negotiation(NegotiationFailure::Security(_))
        ));
        assert_eq!(
            route_features(&none, ctx(false, SecurityMode::IfPossible, false)).unwrap(),
            NegotiationState::AuthNegotiation
        );

        let required = features(Some(true), &["PLAIN"], false, false);
        let err = route_features(&required, ctx(false, SecurityMode::Disabled, false)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Negotiation(NegotiationFailure::Security(_))
        ));
    }

    #[test]
    fn test_route_after_auth() {
        let post_auth = features(None, &[], true, true);
        assert_eq!(
            route_features(&post_auth, ctx(true, SecurityMode::Required, true)).unwrap(),
            NegotiationState::ResourceBinding
        );

        let mut resume = ctx(true, SecurityMode::Required, true);
        resume.resume_pending = true;
        assert_eq!(
            route_features(&post_auth, resume).unwrap(),
            NegotiationState::Resuming
        );

        let no_sm = features(None, &[], true, false);
        assert_eq!(
            route_features(&no_sm, resume).unwrap(),
            NegotiationState::ResourceBinding
        );

        let nothing = features(None, &[], false, false);
        assert!(matches!(
            route_features(&nothing, ctx(true, SecurityMode::Required, true)),
            Err(SessionError::Negotiation(NegotiationFailure::Bind(_)))
        ));
    }

    #[test]
    fn test_route_no_mechanisms() {
        let empty = features(None, &[], true, false);
        assert!(matches!(
            route_features(&empty, ctx(true, SecurityMode::Required, false)),
            Err(SessionError::Negotiation(NegotiationFailure::Auth(_)))
        ));
    }

    #[test]
    fn test_state_helpers() {
        assert!(NegotiationState::AuthNegotiation.is_negotiating());
        assert!(!NegotiationState::Connected.is_negotiating());
        assert_eq!(NegotiationState::Resuming.to_string(), "resuming");
    }
}
