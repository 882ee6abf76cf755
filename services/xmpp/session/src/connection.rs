//! Connection facade.
//!
//! A [`Connection`] owns one logical XMPP session across any number of transports.
//! While connected it runs two tasks per transport: the reader owns the decode side
//! and feeds the dispatcher, the writer owns the encode side and drains an unbounded
//! queue. Outbound stanzas are recorded in the stream-management session and pushed
//! onto that queue under one lock, so sequence numbers follow write order.
//!
//! Outbound stanzas pass through the interceptors before anything else; inbound iq
//! requests are answered through the same outbound path.
//!
//! Transport loss moves the connection to `Disconnected`, closes every collector and
//! hands over to the reconnection loop. Protocol violations and stream errors move it
//! to `Failed` and are never retried.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use xmpp_wire::{ExtensionRegistry, Frame, Nonza, Stanza};

use crate::collector::{Collector, CollectorOptions, CollectorRegistry};
use crate::config::{ConnectionConfig, OutboundPolicy};
use crate::dispatch::{
    Dispatcher, IqHandlerCallback, IqRequestType, ListenerId, ListenerMode, Responder,
};
use crate::error::{ErrorKind, SessionError};
use crate::filter::StanzaFilter;
use crate::keepalive::{AckRequestScheduler, WhitespaceKeepalive, TICK_PERIOD, WHITESPACE_PING};
use crate::negotiation::{NegotiationState, Negotiated, Negotiator, ResumeOutcome};
use crate::outbound::OutboundHooks;
use crate::reconnect::calculate_backoff;
use crate::reliability::{AckListeners, ReliabilitySession, SmCounters};
use crate::sasl::SaslAdapter;
use crate::stream::{FrameReader, FrameWriter, XmlStream};
use crate::transport::Connector;

const EVENT_CAPACITY: usize = 256;

/// Connection lifecycle notifications
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Negotiation finished
    Connected {
        /// Bound address
        jid: Option<String>,
        /// Previous stream-management session was resumed
        resumed: bool,
    },
    /// Transport went away unexpectedly
    ConnectionLost {
        /// Cause
        error: SessionError,
    },
    /// A reconnection attempt is scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Reconnection gave up
    ReconnectionFailed {
        /// Last error seen
        error: SessionError,
    },
    /// Server acknowledged these stanzas
    StanzasAcknowledged {
        /// Acknowledged stanzas, oldest first
        stanzas: Vec<Stanza>,
    },
    /// These stanzas may or may not have reached the server
    DeliveryUnknown {
        /// Affected stanzas, oldest first
        stanzas: Vec<Stanza>,
    },
    /// Connection failed and will not recover on its own
    Failed {
        /// Cause
        error: SessionError,
    },
    /// Connection closed by the caller
    Disconnected,
}

enum WriterCmd {
    Stanza(Stanza),
    Nonza(Nonza),
    RequestAck,
    Close(oneshot::Sender<()>),
}

struct Link {
    tx: mpsc::UnboundedSender<WriterCmd>,
    generation: u64,
}

#[derive(Default)]
struct Outbox {
    link: Option<Link>,
    sm: Option<ReliabilitySession>,
    pending: VecDeque<Stanza>,
    reconnecting: bool,
}

struct IoTasks {
    generation: u64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    sasl: Arc<dyn SaslAdapter>,
    registry: Arc<ExtensionRegistry>,
    dispatcher: Dispatcher,
    outbound: OutboundHooks,
    ack_listeners: AckListeners,
    state_tx: watch::Sender<NegotiationState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    outbox: Mutex<Outbox>,
    io_tasks: Mutex<Option<IoTasks>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    explicit_disconnect: AtomicBool,
    jid: RwLock<Option<String>>,
    last_error: Mutex<Option<SessionError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one XMPP connection; cheap to clone
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection with an empty extension registry
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        sasl: Arc<dyn SaslAdapter>,
    ) -> Result<Self, SessionError> {
        Self::with_registry(config, connector, sasl, ExtensionRegistry::new())
    }

    /// Create a connection decoding extensions through `registry`
    pub fn with_registry(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        sasl: Arc<dyn SaslAdapter>,
        registry: ExtensionRegistry,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(NegotiationState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let dispatcher = Dispatcher::new(
            CollectorRegistry::new(),
            config.async_listener_workers,
            config.async_listener_queue,
        )
        .with_unknown_iq_reply(config.unknown_iq_reply);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                sasl,
                registry: Arc::new(registry),
                dispatcher,
                outbound: OutboundHooks::new(),
                ack_listeners: AckListeners::default(),
                state_tx,
                events_tx,
                outbox: Mutex::new(Outbox::default()),
                io_tasks: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                explicit_disconnect: AtomicBool::new(false),
                jid: RwLock::new(None),
                last_error: Mutex::new(None),
            }),
        })
    }

    /// Open a transport and negotiate; only allowed from `Disconnected`
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != NegotiationState::Disconnected {
            return Err(SessionError::IllegalState(state));
        }
        self.inner.explicit_disconnect.store(false, Ordering::SeqCst);

        info!("Connecting to {}", self.inner.config.domain);
        match establish(&self.inner, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Connection to {} failed: {}", self.inner.config.domain, e);
                self.inner.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Close the stream and stop reconnecting; safe to call repeatedly
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let inner = &self.inner;
        inner.explicit_disconnect.store(true, Ordering::SeqCst);

        let reconnect = lock(&inner.reconnect_task).take();
        if let Some(handle) = reconnect {
            handle.abort();
            let _ = handle.await;
        }

        let (link, unknown) = {
            let mut guard = lock(&inner.outbox);
            let outbox = &mut *guard;
            let mut unknown = outbox
                .sm
                .take()
                .map(|mut sm| sm.take_unacked())
                .unwrap_or_default();
            unknown.extend(outbox.pending.drain(..));
            outbox.reconnecting = false;
            (outbox.link.take(), unknown)
        };
        inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(link) = link {
            let (done_tx, done_rx) = oneshot::channel();
            if link.tx.send(WriterCmd::Close(done_tx)).is_ok() {
                let _ = tokio::time::timeout(inner.config.reply_timeout, done_rx).await;
            }
        }

        let tasks = lock(&inner.io_tasks).take();
        if let Some(tasks) = tasks {
            tasks.reader.abort();
            tasks.writer.abort();
            let _ = tasks.reader.await;
            let _ = tasks.writer.await;
        }

        let previous = inner.state_tx.send_replace(NegotiationState::Disconnected);
        inner.dispatcher.collectors().close_all(SessionError::ConnectionClosed);
        inner.report_unknown(unknown);
        if previous != NegotiationState::Disconnected {
            info!("Disconnected from {}", inner.config.domain);
            inner.emit(ConnectionEvent::Disconnected);
        }
        Ok(())
    }

    /// Queue a stanza for sending; tracked for acknowledgement when enabled
    pub fn send(&self, stanza: Stanza) -> Result<(), SessionError> {
        self.inner.enqueue(stanza)
    }

    /// Send a stanza and wait for the first inbound stanza matching `filter`
    pub async fn send_and_collect(
        &self,
        stanza: Stanza,
        filter: StanzaFilter,
        timeout: Duration,
    ) -> Result<Stanza, SessionError> {
        // Register before sending so a fast reply cannot be missed
        let mut collector = self.create_collector(filter, CollectorOptions::default());
        self.send(stanza)?;
        collector.next(timeout).await
    }

    /// Send an iq request and wait for its result; an error reply becomes `SessionError::Stanza`
    pub async fn send_iq(&self, request: Stanza) -> Result<Stanza, SessionError> {
        let filter = StanzaFilter::reply_to(&request);
        let reply = self
            .send_and_collect(request, filter, self.inner.config.reply_timeout)
            .await?;
        if reply.stanza_type() == Some("error") {
            return Err(SessionError::Stanza {
                condition: reply
                    .error_condition()
                    .unwrap_or("undefined-condition")
                    .to_string(),
                text: reply.error_text(),
            });
        }
        Ok(reply)
    }

    /// Wait for the next inbound stanza matching `filter`
    pub async fn collect(
        &self,
        filter: StanzaFilter,
        timeout: Duration,
    ) -> Result<Stanza, SessionError> {
        let mut collector = self.create_collector(filter, CollectorOptions::default());
        if self.state() != NegotiationState::Connected {
            return Err(SessionError::NotConnected);
        }
        collector.next(timeout).await
    }

    /// Register a collector; it lives until dropped
    pub fn create_collector(&self, filter: StanzaFilter, options: CollectorOptions) -> Collector {
        self.inner.dispatcher.collectors().register(filter, options)
    }

    /// Register a listener for stanzas matching `filter`
    pub fn add_listener<F>(&self, filter: StanzaFilter, callback: F, mode: ListenerMode) -> ListenerId
    where
        F: Fn(&Stanza) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .add_listener(filter, Arc::new(callback), mode)
    }

    /// Remove a listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.remove_listener(id)
    }

    /// Answer iq requests of `iq_type` whose payload is `<name xmlns=namespace/>`
    ///
    /// The callback returns the reply, usually built from `request.reply()`. Returns
    /// true when a previous handler for the same key was replaced.
    pub fn register_iq_request_handler<F>(
        &self,
        name: &str,
        namespace: &str,
        iq_type: IqRequestType,
        mode: ListenerMode,
        callback: F,
    ) -> bool
    where
        F: Fn(&Stanza) -> anyhow::Result<Option<Stanza>> + Send + Sync + 'static,
    {
        let callback: IqHandlerCallback = Arc::new(callback);
        self.inner
            .dispatcher
            .register_iq_handler(name, namespace, iq_type, callback, mode)
    }

    /// Remove an iq request handler
    pub fn unregister_iq_request_handler(
        &self,
        name: &str,
        namespace: &str,
        iq_type: IqRequestType,
    ) -> bool {
        self.inner
            .dispatcher
            .unregister_iq_handler(name, namespace, iq_type)
    }

    /// Rewrite matching stanzas passed to `send` before they are tracked or queued
    pub fn add_stanza_interceptor<F>(&self, filter: StanzaFilter, callback: F) -> ListenerId
    where
        F: Fn(Stanza) -> Stanza + Send + Sync + 'static,
    {
        self.inner.outbound.add_interceptor(filter, Arc::new(callback))
    }

    /// Observe matching stanzas once they are written to the transport
    pub fn add_stanza_sending_listener<F>(&self, filter: StanzaFilter, callback: F) -> ListenerId
    where
        F: Fn(&Stanza) + Send + Sync + 'static,
    {
        self.inner.outbound.add_sending_listener(filter, Arc::new(callback))
    }

    /// Remove an interceptor or sending listener
    pub fn remove_outbound_hook(&self, id: ListenerId) -> bool {
        self.inner.outbound.remove(id)
    }

    /// Call `callback` once when the stanza with `id` is acknowledged
    pub fn add_stanza_id_acknowledged_listener<F>(&self, id: impl Into<String>, callback: F)
    where
        F: Fn(&Stanza) + Send + Sync + 'static,
    {
        self.inner.ack_listeners.add(id, Arc::new(callback));
    }

    /// Ask the server for an acknowledgement now
    pub fn request_ack(&self) -> Result<(), SessionError> {
        let guard = lock(&self.inner.outbox);
        match (&guard.link, &guard.sm) {
            (Some(link), Some(_)) => link
                .tx
                .send(WriterCmd::RequestAck)
                .map_err(|_| SessionError::NotConnected),
            (Some(_), None) => Err(SessionError::IllegalState(NegotiationState::Connected)),
            (None, _) => Err(SessionError::NotConnected),
        }
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Bound address of the current session
    pub fn jid(&self) -> Option<String> {
        self.inner.jid.read().ok().and_then(|jid| jid.clone())
    }

    /// Stream-management counters, when a session exists
    pub fn stream_management_counters(&self) -> Option<SmCounters> {
        lock(&self.inner.outbox).sm.as_ref().map(|sm| sm.counters())
    }

    /// Most recent failure
    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.inner.last_error).clone()
    }

    /// Extension registry used for inbound stanzas
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("domain", &self.inner.config.domain)
            .field("state", &self.state())
            .field("connector", &self.inner.connector)
            .finish()
    }
}

impl Inner {
    fn set_state(&self, state: NegotiationState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("State {} -> {}", previous, state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn record_error(&self, error: &SessionError) {
        *lock(&self.last_error) = Some(error.clone());
    }

    fn report_unknown(&self, stanzas: Vec<Stanza>) {
        if stanzas.is_empty() {
            return;
        }
        warn!("Delivery unknown for {} stanzas", stanzas.len());
        self.ack_listeners.forget(&stanzas);
        self.emit(ConnectionEvent::DeliveryUnknown { stanzas });
    }

    fn acknowledged(&self, stanzas: Vec<Stanza>) {
        if stanzas.is_empty() {
            return;
        }
        self.ack_listeners.notify(&stanzas);
        self.emit(ConnectionEvent::StanzasAcknowledged { stanzas });
    }

    fn enqueue(&self, stanza: Stanza) -> Result<(), SessionError> {
        let stanza = self.outbound.intercept(stanza);
        let mut guard = lock(&self.outbox);
        let outbox = &mut *guard;

        if let Some(link) = &outbox.link {
            let tracked = match outbox.sm.as_mut() {
                Some(sm) => {
                    sm.record_outbound(stanza.clone());
                    true
                }
                None => false,
            };
            return match link.tx.send(WriterCmd::Stanza(stanza)) {
                Ok(()) => Ok(()),
                // Writer is gone; a tracked stanza is resent on resumption
                Err(_) if tracked => Ok(()),
                Err(_) => Err(SessionError::NotConnected),
            };
        }

        if outbox.reconnecting && self.config.outbound_policy == OutboundPolicy::QueueWhileReconnecting {
            let unacked = outbox.sm.as_ref().map_or(0, |sm| sm.unacked_len());
            if unacked + outbox.pending.len() >= self.config.stream_management.max_unacked {
                return Err(SessionError::NotConnected);
            }
            debug!("Queueing stanza {:?} while reconnecting", stanza.id());
            outbox.pending.push_back(stanza);
            return Ok(());
        }
        Err(SessionError::NotConnected)
    }

    /// Move to `Failed` and drop every reliability guarantee
    fn fail(&self, error: SessionError) {
        let unknown = {
            let mut guard = lock(&self.outbox);
            let outbox = &mut *guard;
            outbox.link = None;
            outbox.reconnecting = false;
            let mut unknown = outbox
                .sm
                .take()
                .map(|mut sm| sm.take_unacked())
                .unwrap_or_default();
            unknown.extend(outbox.pending.drain(..));
            unknown
        };
        self.record_error(&error);
        self.set_state(NegotiationState::Failed);
        self.dispatcher
            .collectors()
            .close_all(SessionError::ConnectionClosed);
        self.report_unknown(unknown);
        self.emit(ConnectionEvent::Failed { error });
    }

    fn abort_io_tasks(&self, generation: u64) {
        let mut tasks = lock(&self.io_tasks);
        if tasks.as_ref().map(|t| t.generation) == Some(generation) {
            if let Some(tasks) = tasks.take() {
                tasks.reader.abort();
                tasks.writer.abort();
            }
        }
    }

    /// React to the end of the stream with `generation`
    fn handle_stream_end(self: &Arc<Self>, generation: u64, error: SessionError) {
        {
            let mut outbox = lock(&self.outbox);
            match &outbox.link {
                Some(link) if link.generation == generation => {}
                // Superseded or already closed
                _ => return,
            }
            outbox.link = None;
        }
        self.abort_io_tasks(generation);

        let fatal = matches!(error.kind(), ErrorKind::ProtocolViolation | ErrorKind::Stream);
        if fatal {
            error!("Connection failed: {}", error);
            self.fail(error);
            return;
        }

        warn!("Transport lost: {}", error);
        self.record_error(&error);
        let reconnect = self.config.reconnect.enabled
            && !self.explicit_disconnect.load(Ordering::SeqCst);
        let unknown = {
            let mut outbox = lock(&self.outbox);
            if reconnect {
                let now = Instant::now().into_std();
                if let Some(sm) = outbox.sm.as_mut() {
                    sm.mark_transport_lost(now);
                }
                outbox.reconnecting = true;
                Vec::new()
            } else {
                outbox
                    .sm
                    .take()
                    .map(|mut sm| sm.take_unacked())
                    .unwrap_or_default()
            }
        };

        self.set_state(NegotiationState::Disconnected);
        self.dispatcher
            .collectors()
            .close_all(SessionError::ConnectionClosed);
        self.report_unknown(unknown);
        self.emit(ConnectionEvent::ConnectionLost { error });

        if reconnect {
            let handle = tokio::spawn(reconnect_loop(self.clone()));
            *lock(&self.reconnect_task) = Some(handle);
        }
    }
}

/// Open a transport, negotiate and start the I/O tasks
async fn establish(inner: &Arc<Inner>, resume: bool) -> Result<(), SessionError> {
    inner.set_state(NegotiationState::Connecting);

    let connect_timeout = inner.config.connect_timeout;
    let io = match tokio::time::timeout(connect_timeout, inner.connector.open()).await {
        Ok(result) => result?,
        Err(_) => return Err(SessionError::timeout("transport", connect_timeout)),
    };
    debug!("Transport open ({})", io.kind());
    let stream = XmlStream::new(io, inner.registry.clone(), inner.config.max_element_size);

    let resume_request = if resume {
        let now = Instant::now().into_std();
        lock(&inner.outbox)
            .sm
            .as_ref()
            .filter(|sm| sm.resumption_possible(now))
            .and_then(|sm| sm.resume_request())
    } else {
        None
    };

    let negotiated = Negotiator::new(
        stream,
        &inner.config,
        inner.sasl.as_ref(),
        resume_request,
    )
    .run(|state| {
        // Connected is published once the I/O tasks run
        if state != NegotiationState::Connected {
            inner.set_state(state);
        }
    })
    .await?;

    install(inner, negotiated)
}

/// Wire a negotiated stream into the connection
fn install(inner: &Arc<Inner>, negotiated: Negotiated) -> Result<(), SessionError> {
    let Negotiated {
        stream,
        stream_id,
        jid,
        resumption,
        sm_enabled,
        early_stanzas,
    } = negotiated;
    let resumed = matches!(resumption, ResumeOutcome::Resumed { .. });

    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let mut acknowledged = Vec::new();
    let mut unknown = Vec::new();
    {
        let mut guard = lock(&inner.outbox);
        let outbox = &mut *guard;
        if inner.explicit_disconnect.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionClosed);
        }

        if let ResumeOutcome::Resumed { h } = resumption {
            if let Some(sm) = outbox.sm.as_mut() {
                let (acked, resend) = sm.on_resumed(h)?;
                acknowledged = acked;
                for stanza in resend {
                    sm.record_outbound(stanza.clone());
                    let _ = tx.send(WriterCmd::Stanza(stanza));
                }
            }
        } else {
            if let Some(mut previous) = outbox.sm.take() {
                // A failed resumption may still say how much the server handled
                if let ResumeOutcome::Rejected { h: Some(h) } = resumption {
                    match previous.process_ack(h) {
                        Ok(acked) => acknowledged = acked,
                        Err(e) => warn!("Ignoring handled count of failed resumption: {}", e),
                    }
                }
                unknown = previous.take_unacked();
            }
            outbox.sm = sm_enabled.as_ref().map(|enabled| {
                ReliabilitySession::enabled(
                    enabled,
                    inner.config.stream_management.preferred_max_resumption,
                )
            });
        }

        for stanza in outbox.pending.drain(..) {
            if let Some(sm) = outbox.sm.as_mut() {
                sm.record_outbound(stanza.clone());
            }
            let _ = tx.send(WriterCmd::Stanza(stanza));
        }
        outbox.link = Some(Link {
            tx: tx.clone(),
            generation,
        });
        outbox.reconnecting = false;
    }

    if let Some(jid) = &jid {
        if let Ok(mut current) = inner.jid.write() {
            *current = Some(jid.clone());
        }
    }
    let current_jid = inner.jid.read().ok().and_then(|j| j.clone());

    let writer_task = tokio::spawn(write_task(inner.clone(), writer, rx, generation));

    inner.set_state(NegotiationState::Connected);
    info!(
        "Connected to {} as {:?} (stream {:?}, resumed={})",
        inner.config.domain, current_jid, stream_id, resumed
    );
    inner.emit(ConnectionEvent::Connected {
        jid: current_jid,
        resumed,
    });
    inner.acknowledged(acknowledged);
    inner.report_unknown(unknown);

    let reader_task = tokio::spawn(read_task(inner.clone(), reader, generation, early_stanzas));
    *lock(&inner.io_tasks) = Some(IoTasks {
        generation,
        reader: reader_task,
        writer: writer_task,
    });
    Ok(())
}

async fn read_task(
    inner: Arc<Inner>,
    mut reader: FrameReader,
    generation: u64,
    early_stanzas: Vec<Stanza>,
) {
    let respond: Responder = {
        let weak = Arc::downgrade(&inner);
        Arc::new(move |reply: Stanza| {
            let Some(inner) = weak.upgrade() else { return };
            if let Err(e) = inner.enqueue(reply) {
                warn!("Cannot send reply: {}", e);
            }
        })
    };

    // Stanzas that arrived during negotiation go first
    for stanza in &early_stanzas {
        inner.dispatcher.dispatch(stanza, &respond).await;
    }

    let error = loop {
        let frame = match reader.next_frame().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        match frame {
            Frame::Stanza(stanza) => {
                {
                    let mut outbox = lock(&inner.outbox);
                    if let Some(sm) = outbox.sm.as_mut() {
                        sm.record_inbound();
                    }
                }
                inner.dispatcher.dispatch(&stanza, &respond).await;
            }
            Frame::Nonza(Nonza::SmAckRequest) => {
                let guard = lock(&inner.outbox);
                if let (Some(sm), Some(link)) = (&guard.sm, &guard.link) {
                    let _ = link.tx.send(WriterCmd::Nonza(sm.ack_answer()));
                }
            }
            Frame::Nonza(Nonza::SmAck { h }) => {
                let result = match lock(&inner.outbox).sm.as_mut() {
                    Some(sm) => sm.process_ack(h),
                    None => Ok(Vec::new()),
                };
                match result {
                    Ok(acked) => inner.acknowledged(acked),
                    Err(e) => {
                        error!("Invalid acknowledgement: {}", e);
                        break e;
                    }
                }
            }
            Frame::Nonza(Nonza::StreamError(cond)) => {
                break SessionError::Stream {
                    condition: cond.condition,
                    text: cond.text,
                }
            }
            Frame::StreamClose => break SessionError::ConnectionClosed,
            Frame::StreamOpen(_) => {
                break SessionError::ProtocolViolation("unexpected stream header".to_string())
            }
            Frame::Nonza(other) => debug!("Ignoring {} on established stream", other.name()),
        }
    };
    inner.handle_stream_end(generation, error);
}

async fn write_task(
    inner: Arc<Inner>,
    writer: FrameWriter,
    rx: mpsc::UnboundedReceiver<WriterCmd>,
    generation: u64,
) {
    if let Err(e) = write_loop(&inner, writer, rx).await {
        inner.handle_stream_end(generation, e);
    }
}

async fn write_loop(
    inner: &Arc<Inner>,
    mut writer: FrameWriter,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) -> Result<(), SessionError> {
    let now = Instant::now().into_std();
    let mut scheduler = AckRequestScheduler::new(inner.config.stream_management.ack_request, now);
    let mut keepalive = WhitespaceKeepalive::new(inner.config.keepalive_interval, now);
    let mut tick = interval(TICK_PERIOD);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            cmd = rx.recv() => {
                let now = Instant::now().into_std();
                match cmd {
                    Some(WriterCmd::Stanza(stanza)) => {
                        writer.send(&Frame::Stanza(stanza.clone())).await?;
                        inner.outbound.sent(&stanza);
                        keepalive.touch(now);
                        if sm_active(inner) && scheduler.on_stanza_written(now) {
                            writer.send(&Frame::Nonza(Nonza::SmAckRequest)).await?;
                        }
                    }
                    Some(WriterCmd::Nonza(nonza)) => {
                        writer.send(&Frame::Nonza(nonza)).await?;
                        keepalive.touch(now);
                    }
                    Some(WriterCmd::RequestAck) => {
                        writer.send(&Frame::Nonza(Nonza::SmAckRequest)).await?;
                        scheduler.requested(now);
                        keepalive.touch(now);
                    }
                    Some(WriterCmd::Close(done)) => {
                        let _ = writer.send(&Frame::StreamClose).await;
                        let _ = writer.shutdown().await;
                        let _ = done.send(());
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }

            _ = tick.tick() => {
                let now = Instant::now().into_std();
                let unacked = lock(&inner.outbox).sm.as_ref().map(|sm| sm.unacked_len() > 0);
                if let Some(has_unacked) = unacked {
                    if scheduler.on_tick(now, has_unacked) {
                        writer.send(&Frame::Nonza(Nonza::SmAckRequest)).await?;
                        keepalive.touch(now);
                    }
                }
                if keepalive.due(now) {
                    writer.send_raw(WHITESPACE_PING).await?;
                    keepalive.touch(now);
                }
            }
        }
    }
}

fn sm_active(inner: &Inner) -> bool {
    lock(&inner.outbox).sm.is_some()
}

async fn reconnect_loop(inner: Arc<Inner>) {
    let policy = inner.config.reconnect;
    let mut attempt: u32 = 0;
    let mut last_error = lock(&inner.last_error)
        .clone()
        .unwrap_or(SessionError::ConnectionClosed);

    loop {
        attempt = attempt.saturating_add(1);
        if !policy.allows(attempt) {
            error!(
                "Giving up on {} after {} reconnection attempts",
                inner.config.domain,
                attempt - 1
            );
            inner.fail(last_error.clone());
            inner.emit(ConnectionEvent::ReconnectionFailed { error: last_error });
            return;
        }

        let delay = calculate_backoff(policy.backoff, attempt);
        info!("Reconnecting to {} in {:?} (attempt {})", inner.config.domain, delay, attempt);
        inner.emit(ConnectionEvent::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;
        if inner.explicit_disconnect.load(Ordering::SeqCst) {
            return;
        }

        match establish(&inner, true).await {
            Ok(()) => {
                info!("Reconnected to {} on attempt {}", inner.config.domain, attempt);
                return;
            }
            Err(e) if e.is_retryable() => {
                warn!("Reconnection attempt {} failed: {}", attempt, e);
                inner.record_error(&e);
                inner.set_state(NegotiationState::Disconnected);
                last_error = e;
            }
            Err(e) => {
                error!("Reconnection stopped: {}", e);
                inner.fail(e);
                return;
            }
        }
    }
}
