//! Outbound stanza hooks.
//!
//! Interceptors see every stanza handed to `send` before it is recorded for
//! acknowledgement or queued, and may replace it. Sending listeners observe each
//! stanza after the writer put it on the transport, resends included.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, trace};
use xmpp_wire::Stanza;

use crate::dispatch::ListenerId;
use crate::filter::StanzaFilter;

/// Rewrites an outbound stanza; return the input unchanged to leave it alone
pub type InterceptorCallback = Arc<dyn Fn(Stanza) -> Stanza + Send + Sync>;

/// Observes a stanza that was written
pub type SendingCallback = Arc<dyn Fn(&Stanza) + Send + Sync>;

struct Hook<C> {
    id: ListenerId,
    filter: StanzaFilter,
    callback: C,
}

/// Interceptors and sending listeners of one connection
#[derive(Default)]
pub struct OutboundHooks {
    interceptors: RwLock<Vec<Arc<Hook<InterceptorCallback>>>>,
    sending: RwLock<Vec<Arc<Hook<SendingCallback>>>>,
}

impl OutboundHooks {
    /// Create an empty hook set
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` on matching stanzas before they are queued
    pub fn add_interceptor(&self, filter: StanzaFilter, callback: InterceptorCallback) -> ListenerId {
        let id = ListenerId::next();
        if let Ok(mut hooks) = self.interceptors.write() {
            hooks.push(Arc::new(Hook { id, filter, callback }));
        }
        id
    }

    /// Run `callback` on matching stanzas once written
    pub fn add_sending_listener(&self, filter: StanzaFilter, callback: SendingCallback) -> ListenerId {
        let id = ListenerId::next();
        if let Ok(mut hooks) = self.sending.write() {
            hooks.push(Arc::new(Hook { id, filter, callback }));
        }
        id
    }

    /// Remove an interceptor or sending listener
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;
        if let Ok(mut hooks) = self.interceptors.write() {
            let before = hooks.len();
            hooks.retain(|h| h.id != id);
            removed |= hooks.len() != before;
        }
        if let Ok(mut hooks) = self.sending.write() {
            let before = hooks.len();
            hooks.retain(|h| h.id != id);
            removed |= hooks.len() != before;
        }
        removed
    }

    /// Pass `stanza` through every matching interceptor in registration order
    ///
    /// A panicking interceptor leaves the stanza as it was before that interceptor.
    pub fn intercept(&self, stanza: Stanza) -> Stanza {
        let hooks = match self.interceptors.read() {
            Ok(hooks) if !hooks.is_empty() => hooks.clone(),
            _ => return stanza,
        };
        hooks.iter().fold(stanza, |stanza, hook| {
            if !hook.filter.matches(&stanza) {
                return stanza;
            }
            let input = stanza.clone();
            match catch_unwind(AssertUnwindSafe(|| (hook.callback)(input))) {
                Ok(rewritten) => {
                    trace!("Interceptor {:?} ran on {:?}", hook.id, rewritten.id());
                    rewritten
                }
                Err(_) => {
                    error!("Interceptor {:?} panicked on {:?}", hook.id, stanza.id());
                    stanza
                }
            }
        })
    }

    /// Notify sending listeners about a written stanza
    pub fn sent(&self, stanza: &Stanza) {
        let hooks = match self.sending.read() {
            Ok(hooks) if !hooks.is_empty() => hooks.clone(),
            _ => return,
        };
        for hook in hooks.iter().filter(|h| h.filter.matches(stanza)) {
            if catch_unwind(AssertUnwindSafe(|| (hook.callback)(stanza))).is_err() {
                error!("Sending listener {:?} panicked on {:?}", hook.id, stanza.id());
            }
        }
    }
}

impl std::fmt::Debug for OutboundHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundHooks")
            .field("interceptors", &self.interceptors.read().map(|h| h.len()).unwrap_or(0))
            .field("sending", &self.sending.read().map(|h| h.len()).unwrap_or(0))
            .finish()
    }
}
