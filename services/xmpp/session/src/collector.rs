//! Request/response correlation.
//!
//! A [`Collector`] is a bounded queue that receives every inbound stanza matching
//! its filter. Callers await it with a deadline; the connection closes all
//! outstanding collectors with `ConnectionClosed` when the stream goes away.
//! Dropping a collector deregisters it.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};
use xmpp_wire::Stanza;

use crate::error::SessionError;
use crate::filter::StanzaFilter;

/// What happens to a matching stanza when the collector is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Keep what is queued, discard the newcomer
    #[default]
    RejectNew,
    /// Evict the oldest queued stanza
    DropOldest,
}

/// Collector sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Maximum queued stanzas
    pub capacity: usize,
    /// Full-queue behaviour
    pub overflow: OverflowPolicy,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            capacity: 1,
            overflow: OverflowPolicy::RejectNew,
        }
    }
}

#[derive(Default)]
struct SlotState {
    queue: VecDeque<Stanza>,
    closed: Option<SessionError>,
}

struct Slot {
    filter: StanzaFilter,
    options: CollectorOptions,
    state: Mutex<SlotState>,
    notify: Notify,
}

impl Slot {
    fn offer(&self, stanza: &Stanza) -> bool {
        if !self.filter.matches(stanza) {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.closed.is_some() {
            return false;
        }
        if state.queue.len() >= self.options.capacity.max(1) {
            match self.options.overflow {
                OverflowPolicy::RejectNew => {
                    debug!("Collector full, rejecting stanza {:?}", stanza.id());
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    state.queue.pop_front();
                }
            }
        }
        state.queue.push_back(stanza.clone());
        drop(state);
        self.notify.notify_one();
        true
    }

    fn close(&self, reason: SessionError) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_one();
    }

    fn poll(&self) -> Option<Result<Stanza, SessionError>> {
        let mut state = self.state.lock().ok()?;
        if let Some(stanza) = state.queue.pop_front() {
            return Some(Ok(stanza));
        }
        state.closed.clone().map(Err)
    }
}

/// Registry of live collectors owned by one connection
#[derive(Default)]
pub struct CollectorRegistry {
    slots: DashMap<u64, Arc<Slot>>,
    next_id: AtomicU64,
}

impl CollectorRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a collector; it receives stanzas from this call onward
    pub fn register(self: &Arc<Self>, filter: StanzaFilter, options: CollectorOptions) -> Collector {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            filter,
            options,
            state: Mutex::new(SlotState::default()),
            notify: Notify::new(),
        });
        self.slots.insert(id, slot.clone());
        trace!("Registered collector {}", id);
        Collector {
            id,
            slot,
            registry: Arc::downgrade(self),
        }
    }

    /// Offer an inbound stanza to every collector; returns how many accepted it
    pub fn offer(&self, stanza: &Stanza) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        slots.iter().filter(|slot| slot.offer(stanza)).count()
    }

    /// Resolve every outstanding collector with `reason`
    pub fn close_all(&self, reason: SessionError) {
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        if !slots.is_empty() {
            debug!("Closing {} collectors: {}", slots.len(), reason);
        }
        for slot in slots {
            slot.close(reason.clone());
        }
    }

    /// Number of registered collectors
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn remove(&self, id: u64) {
        self.slots.remove(&id);
        trace!("Deregistered collector {}", id);
    }
}

/// Handle to a registered collector
pub struct Collector {
    id: u64,
    slot: Arc<Slot>,
    registry: Weak<CollectorRegistry>,
}

impl Collector {
    /// Wait up to `timeout` for the next matching stanza
    pub async fn next(&mut self, timeout: Duration) -> Result<Stanza, SessionError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::timeout("matching stanza", timeout)),
        }
    }

    /// Wait until `deadline` for the next matching stanza
    pub async fn next_until(
        &mut self,
        deadline: tokio::time::Instant,
    ) -> Result<Stanza, SessionError> {
        let after = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout_at(deadline, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::timeout("matching stanza", after)),
        }
    }

    /// Take a queued stanza without waiting
    pub fn try_next(&mut self) -> Option<Stanza> {
        match self.slot.poll() {
            Some(Ok(stanza)) => Some(stanza),
            _ => None,
        }
    }

    /// Resolve this collector with `reason` (queued stanzas are still returned first)
    pub fn cancel(&self, reason: SessionError) {
        self.slot.close(reason);
    }

    /// Number of queued stanzas
    pub fn queued(&self) -> usize {
        self.slot.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    async fn wait(&self) -> Result<Stanza, SessionError> {
        loop {
            if let Some(result) = self.slot.poll() {
                return result;
            }
            self.slot.notify.notified().await;
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("id", &self.id)
            .field("filter", &self.slot.filter)
            .field("options", &self.slot.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq_result(id: &str) -> Stanza {
        Stanza::iq("result").id(id).build()
    }

    #[tokio::test]
    async fn test_collect_matching_only() {
        let registry = CollectorRegistry::new();
        let mut collector = registry.register(StanzaFilter::id("q1"), CollectorOptions::default());

        assert_eq!(registry.offer(&iq_result("q0")), 0);
        assert_eq!(registry.offer(&iq_result("q1")), 1);

        let got = collector.next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.id(), Some("q1"));
    }

    #[tokio::test]
    async fn test_reject_new_keeps_first() {
        let registry = CollectorRegistry::new();
        let mut collector = registry.register(StanzaFilter::any(), CollectorOptions::default());

        registry.offer(&iq_result("a"));
        assert_eq!(registry.offer(&iq_result("b")), 0);
        assert_eq!(collector.queued(), 1);
        assert_eq!(collector.try_next().unwrap().id(), Some("a"));
        assert!(collector.try_next().is_none());
    }

    #[tokio::test]
    async fn test_drop_oldest() {
        let registry = CollectorRegistry::new();
        let options = CollectorOptions {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        };
        let mut collector = registry.register(StanzaFilter::any(), options);

        for id in ["a", "b", "c"] {
            registry.offer(&iq_result(id));
        }
        assert_eq!(collector.try_next().unwrap().id(), Some("b"));
        assert_eq!(collector.try_next().unwrap().id(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds() {
        let registry = CollectorRegistry::new();
        let mut collector = registry.register(StanzaFilter::id("never"), CollectorOptions::default());

        let start = tokio::time::Instant::now();
        let err = collector.next(Duration::from_millis(50)).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_close_all_wakes_waiter() {
        let registry = CollectorRegistry::new();
        let mut collector = registry.register(StanzaFilter::any(), CollectorOptions::default());

        let reg = registry.clone();
        let waiter = tokio::spawn(async move { collector.next(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        reg.close_all(SessionError::ConnectionClosed);

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), SessionError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let registry = CollectorRegistry::new();
        let a = registry.register(StanzaFilter::any(), CollectorOptions::default());
        let b = registry.register(StanzaFilter::any(), CollectorOptions::default());
        assert_eq!(registry.len(), 2);
        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_collectors_are_independent() {
        let registry = CollectorRegistry::new();
        let mut c1 = registry.register(StanzaFilter::id("x"), CollectorOptions::default());
        let mut c2 = registry.register(StanzaFilter::id("x"), CollectorOptions::default());

        assert_eq!(registry.offer(&iq_result("x")), 2);
        assert!(c1.next(Duration::from_millis(10)).await.is_ok());
        assert!(c2.next(Duration::from_millis(10)).await.is_ok());
    }
}
