//! Inbound stanza dispatch.
//!
//! The reader task hands every stanza to [`Dispatcher::dispatch`]. An iq request
//! (`get`/`set`) goes to the handler registered for its payload, or is answered with
//! an error when there is none; it is never offered to listeners or collectors.
//! Everything else is offered to the collectors first, then to synchronous listeners
//! in registration order, then queued for async listeners on the worker pool. A
//! failing listener is logged and skipped; it never stops delivery to the next one.
//!
//! ```text
//!   stanza --+-- iq get/set --> iq handler | error reply
//!            |
//!            +-- collectors
//!            +-- sync listeners (reader task, wire order)
//!            +-- async listeners --> bounded queue --> N workers
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use xmpp_wire::Stanza;

use crate::collector::CollectorRegistry;
use crate::filter::StanzaFilter;

/// Listener callback; a returned error is logged and swallowed
pub type ListenerCallback = Arc<dyn Fn(&Stanza) -> anyhow::Result<()> + Send + Sync>;

/// Iq request handler; `Ok(None)` sends no reply, an error sends `internal-server-error`
pub type IqHandlerCallback = Arc<dyn Fn(&Stanza) -> anyhow::Result<Option<Stanza>> + Send + Sync>;

/// Sends a stanza produced while dispatching, such as an iq reply
pub type Responder = Arc<dyn Fn(Stanza) + Send + Sync>;

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a listener runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerMode {
    /// On the reader task, in wire order
    #[default]
    Sync,
    /// On the worker pool, after the synchronous pass
    Async,
}

/// Iq request types that expect an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqRequestType {
    /// `type='get'`
    Get,
    /// `type='set'`
    Set,
}

impl IqRequestType {
    fn of(stanza: &Stanza) -> Option<Self> {
        match stanza.stanza_type() {
            Some("get") => Some(IqRequestType::Get),
            Some("set") => Some(IqRequestType::Set),
            _ => None,
        }
    }
}

/// Answer to an iq request nobody handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownIqReply {
    /// Reply with `feature-not-implemented`
    #[default]
    FeatureNotImplemented,
    /// Reply with `service-unavailable`
    ServiceUnavailable,
    /// Send nothing
    Ignore,
}

impl UnknownIqReply {
    fn condition(self) -> Option<&'static str> {
        match self {
            UnknownIqReply::FeatureNotImplemented => Some("feature-not-implemented"),
            UnknownIqReply::ServiceUnavailable => Some("service-unavailable"),
            UnknownIqReply::Ignore => None,
        }
    }
}

struct ListenerEntry {
    id: ListenerId,
    filter: StanzaFilter,
    callback: ListenerCallback,
    mode: ListenerMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IqHandlerKey {
    name: String,
    namespace: String,
    iq_type: IqRequestType,
}

impl IqHandlerKey {
    fn new(name: &str, namespace: &str, iq_type: IqRequestType) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            iq_type,
        }
    }
}

struct IqHandlerEntry {
    callback: IqHandlerCallback,
    mode: ListenerMode,
}

/// Fixed set of workers draining a bounded job queue
struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    fn start(workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    // Callbacks are plain closures that may block
                    if let Err(e) = tokio::task::spawn_blocking(job).await {
                        error!("Async worker {} lost a job: {}", worker, e);
                    }
                }
                trace!("Async worker {} stopped", worker);
            });
        }
        Self { tx }
    }

    /// Queue a job; waits while the queue is full
    async fn submit(&self, job: Job) {
        if self.tx.send(job).await.is_err() {
            warn!("Async worker pool is closed, dropping job");
        }
    }
}

/// Listener, iq handler and collector registry of one connection
pub struct Dispatcher {
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    iq_handlers: RwLock<HashMap<IqHandlerKey, Arc<IqHandlerEntry>>>,
    unknown_iq: UnknownIqReply,
    collectors: Arc<CollectorRegistry>,
    async_workers: usize,
    async_queue: usize,
    pool: OnceLock<WorkerPool>,
}

impl Dispatcher {
    /// Create a dispatcher with `async_workers` workers behind a queue of `async_queue` jobs
    pub fn new(collectors: Arc<CollectorRegistry>, async_workers: usize, async_queue: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            iq_handlers: RwLock::new(HashMap::new()),
            unknown_iq: UnknownIqReply::default(),
            collectors,
            async_workers,
            async_queue,
            pool: OnceLock::new(),
        }
    }

    /// Choose the answer to unhandled iq requests
    pub fn with_unknown_iq_reply(mut self, reply: UnknownIqReply) -> Self {
        self.unknown_iq = reply;
        self
    }

    /// Collector registry fed by this dispatcher
    pub fn collectors(&self) -> &Arc<CollectorRegistry> {
        &self.collectors
    }

    /// Register a listener
    pub fn add_listener(
        &self,
        filter: StanzaFilter,
        callback: ListenerCallback,
        mode: ListenerMode,
    ) -> ListenerId {
        let id = ListenerId::next();
        let entry = Arc::new(ListenerEntry {
            id,
            filter,
            callback,
            mode,
        });
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(entry);
        }
        id
    }

    /// Remove a listener; returns false when it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|entry| entry.id != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Handle iq requests of `iq_type` whose payload is `<name xmlns=namespace/>`
    ///
    /// Returns true when an existing handler was replaced.
    pub fn register_iq_handler(
        &self,
        name: &str,
        namespace: &str,
        iq_type: IqRequestType,
        callback: IqHandlerCallback,
        mode: ListenerMode,
    ) -> bool {
        let key = IqHandlerKey::new(name, namespace, iq_type);
        debug!("Registering {:?} handler for <{} xmlns='{}'/>", iq_type, name, namespace);
        match self.iq_handlers.write() {
            Ok(mut handlers) => handlers
                .insert(key, Arc::new(IqHandlerEntry { callback, mode }))
                .is_some(),
            Err(_) => false,
        }
    }

    /// Remove an iq handler; returns false when none was registered
    pub fn unregister_iq_handler(&self, name: &str, namespace: &str, iq_type: IqRequestType) -> bool {
        let key = IqHandlerKey::new(name, namespace, iq_type);
        match self.iq_handlers.write() {
            Ok(mut handlers) => handlers.remove(&key).is_some(),
            Err(_) => false,
        }
    }

    /// Deliver one inbound stanza; replies go out through `respond`
    pub async fn dispatch(&self, stanza: &Stanza, respond: &Responder) {
        if stanza.is_iq_request() {
            self.dispatch_iq_request(stanza, respond).await;
            return;
        }

        let collected = self.collectors.offer(stanza);

        // Snapshot so listeners may (de)register from inside a callback
        let snapshot: Vec<Arc<ListenerEntry>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => Vec::new(),
        };
        trace!(
            "Dispatching {} id={:?} to {} collectors, {} listeners",
            stanza.kind().element_name(),
            stanza.id(),
            collected,
            snapshot.len()
        );

        let mut deferred = Vec::new();
        for entry in snapshot {
            if !entry.filter.matches(stanza) {
                continue;
            }
            match entry.mode {
                ListenerMode::Sync => invoke(&entry, stanza),
                ListenerMode::Async => deferred.push(entry),
            }
        }

        for entry in deferred {
            let stanza = stanza.clone();
            self.pool()
                .submit(Box::new(move || invoke(&entry, &stanza)))
                .await;
        }
    }

    async fn dispatch_iq_request(&self, request: &Stanza, respond: &Responder) {
        let handler = match (IqRequestType::of(request), request.child_qname()) {
            (Some(iq_type), Some((name, namespace))) => {
                let key = IqHandlerKey::new(name, namespace, iq_type);
                self.iq_handlers
                    .read()
                    .ok()
                    .and_then(|handlers| handlers.get(&key).cloned())
            }
            _ => None,
        };

        let Some(handler) = handler else {
            match self.unknown_iq.condition() {
                Some(condition) => {
                    debug!(
                        "No handler for iq {:?} from {:?}, replying {}",
                        request.child_qname(),
                        request.from(),
                        condition
                    );
                    respond(request.error_reply("cancel", condition));
                }
                None => debug!("Ignoring unhandled iq {:?}", request.child_qname()),
            }
            return;
        };

        match handler.mode {
            ListenerMode::Sync => answer_iq(&handler, request, respond),
            ListenerMode::Async => {
                let request = request.clone();
                let respond = respond.clone();
                self.pool()
                    .submit(Box::new(move || answer_iq(&handler, &request, &respond)))
                    .await;
            }
        }
    }

    fn pool(&self) -> &WorkerPool {
        self.pool
            .get_or_init(|| WorkerPool::start(self.async_workers, self.async_queue))
    }
}

fn invoke(entry: &ListenerEntry, stanza: &Stanza) {
    match catch_unwind(AssertUnwindSafe(|| (entry.callback)(stanza))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            "Listener {:?} failed on {} id={:?}: {:#}",
            entry.id,
            stanza.kind().element_name(),
            stanza.id(),
            e
        ),
        Err(_) => error!(
            "Listener {:?} panicked on {} id={:?}",
            entry.id,
            stanza.kind().element_name(),
            stanza.id()
        ),
    }
}

fn answer_iq(handler: &IqHandlerEntry, request: &Stanza, respond: &Responder) {
    let reply = match catch_unwind(AssertUnwindSafe(|| (handler.callback)(request))) {
        Ok(Ok(Some(reply))) if reply.is_iq_response() => reply,
        Ok(Ok(Some(reply))) => {
            warn!(
                "Iq handler answered {:?} with a non-response {:?}",
                request.id(),
                reply.stanza_type()
            );
            request.error_reply("cancel", "internal-server-error")
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!("Iq handler failed on {:?}: {:#}", request.id(), e);
            request.error_reply("cancel", "internal-server-error")
        }
        Err(_) => {
            error!("Iq handler panicked on {:?}", request.id());
            request.error_reply("cancel", "internal-server-error")
        }
    };
    respond(reply);
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .field(
                "iq_handlers",
                &self.iq_handlers.read().map(|h| h.len()).unwrap_or(0),
            )
            .field("collectors", &self.collectors.len())
            .finish()
    }
}
