//! Stream management (XEP-0198) bookkeeping.
//!
//! [`ReliabilitySession`] holds the counters and the unacknowledged queue of one
//! stream-management session. It is a plain state machine: the connection keeps it
//! behind the same lock that guards the outbound queue, so sequence numbers are
//! assigned in exactly the order stanzas reach the writer.
//!
//! ## Counters
//!
//! ```text
//!   acked            sent
//!     |               |
//! ----+---+---+---+---+------>  sequence (u32, wrapping)
//!         \___________/
//!       unacknowledged queue
//! ```
//!
//! All counters wrap at 2^32. An ack is valid when `h - acked <= sent - acked`
//! in wrapping arithmetic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use xmpp_wire::{Nonza, SmEnabled, Stanza};

use crate::error::SessionError;

/// Snapshot of the stream-management counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmCounters {
    /// Stanzas recorded for sending
    pub sent: u32,
    /// Stanzas acknowledged by the server
    pub acked: u32,
    /// Stanzas received from the server
    pub received: u32,
    /// Length of the unacknowledged queue
    pub unacked: usize,
}

/// State of one stream-management session
#[derive(Debug)]
pub struct ReliabilitySession {
    stream_id: Option<String>,
    resumable: bool,
    max_resumption: Option<Duration>,
    location: Option<String>,
    sent: u32,
    acked: u32,
    received: u32,
    unacked: VecDeque<(u32, Stanza)>,
    lost_at: Option<Instant>,
}

impl ReliabilitySession {
    /// Start a session from the server's `<enabled/>`; counters start at zero
    pub fn enabled(reply: &SmEnabled, preferred_max: Option<Duration>) -> Self {
        let server_max = reply.max.map(|secs| Duration::from_secs(u64::from(secs)));
        let max_resumption = match (preferred_max, server_max) {
            (Some(client), Some(server)) => Some(client.min(server)),
            (client, None) => client,
            (None, server) => server,
        };
        let resumable = reply.resume && reply.id.is_some();

        info!(
            "Stream management enabled: id={:?}, resumable={}, max_resumption={:?}",
            reply.id, resumable, max_resumption
        );

        Self {
            stream_id: reply.id.clone(),
            resumable,
            max_resumption,
            location: reply.location.clone(),
            sent: 0,
            acked: 0,
            received: 0,
            unacked: VecDeque::new(),
            lost_at: None,
        }
    }

    /// Resumption token
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Server agreed to resumption
    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    /// Effective resumption window
    pub fn max_resumption(&self) -> Option<Duration> {
        self.max_resumption
    }

    /// Server's preferred reconnect location
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Assign the next sequence number and queue the stanza until acknowledged
    pub fn record_outbound(&mut self, stanza: Stanza) -> u32 {
        self.sent = self.sent.wrapping_add(1);
        self.unacked.push_back((self.sent, stanza));
        self.sent
    }

    /// Count one inbound stanza
    pub fn record_inbound(&mut self) -> u32 {
        self.received = self.received.wrapping_add(1);
        self.received
    }

    /// Answer to a server `<r/>`
    pub fn ack_answer(&self) -> Nonza {
        Nonza::SmAck { h: self.received }
    }

    /// Apply `<a h/>`; returns the stanzas it acknowledged, oldest first
    pub fn process_ack(&mut self, h: u32) -> Result<Vec<Stanza>, SessionError> {
        let delta = h.wrapping_sub(self.acked);
        let outstanding = self.sent.wrapping_sub(self.acked);
        if delta > outstanding {
            return Err(SessionError::ProtocolViolation(format!(
                "ack h={} outside [{}, {}]",
                h, self.acked, self.sent
            )));
        }

        self.acked = h;
        let mut acknowledged = Vec::with_capacity(delta as usize);
        for _ in 0..delta {
            match self.unacked.pop_front() {
                Some((_, stanza)) => acknowledged.push(stanza),
                None => break,
            }
        }
        if delta > 0 {
            debug!(
                "Ack h={} released {} stanzas, {} still unacknowledged",
                h,
                acknowledged.len(),
                self.unacked.len()
            );
        }
        Ok(acknowledged)
    }

    /// `<resume/>` for this session, if it is resumable
    pub fn resume_request(&self) -> Option<Nonza> {
        match (&self.stream_id, self.resumable) {
            (Some(previd), true) => Some(Nonza::SmResume {
                h: self.received,
                previd: previd.clone(),
            }),
            _ => None,
        }
    }

    /// Reconcile after `<resumed h/>`
    ///
    /// Returns the stanzas the server acknowledged and, in original order, the ones it
    /// never handled. The latter leave the queue and `sent` is rewound to `acked`; the
    /// caller records them again before any new traffic so they keep their order.
    pub fn on_resumed(&mut self, h: u32) -> Result<(Vec<Stanza>, Vec<Stanza>), SessionError> {
        let acknowledged = self.process_ack(h)?;
        let resend: Vec<Stanza> = self.unacked.drain(..).map(|(_, stanza)| stanza).collect();
        self.sent = self.acked;
        self.lost_at = None;
        info!(
            "Stream management resumed: {} acknowledged, {} to resend",
            acknowledged.len(),
            resend.len()
        );
        Ok((acknowledged, resend))
    }

    /// Remove every unacknowledged stanza, oldest first
    pub fn take_unacked(&mut self) -> Vec<Stanza> {
        self.unacked.drain(..).map(|(_, stanza)| stanza).collect()
    }

    /// Note that the transport went away
    pub fn mark_transport_lost(&mut self, now: Instant) {
        if self.lost_at.is_none() {
            self.lost_at = Some(now);
        }
    }

    /// Whether a resume attempt made at `now` can still succeed
    pub fn resumption_possible(&self, now: Instant) -> bool {
        if !self.resumable || self.stream_id.is_none() {
            return false;
        }
        match (self.lost_at, self.max_resumption) {
            (Some(lost_at), Some(max)) => now.saturating_duration_since(lost_at) <= max,
            _ => true,
        }
    }

    /// Number of unacknowledged stanzas
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Counter snapshot
    pub fn counters(&self) -> SmCounters {
        SmCounters {
            sent: self.sent,
            acked: self.acked,
            received: self.received,
            unacked: self.unacked.len(),
        }
    }
}

/// Callback fired once when a stanza with a given id is acknowledged
pub type AckCallback = Arc<dyn Fn(&Stanza) + Send + Sync>;

/// One-shot acknowledgement listeners keyed by stanza id
#[derive(Default)]
pub struct AckListeners {
    by_id: Mutex<HashMap<String, Vec<AckCallback>>>,
}

impl AckListeners {
    /// Register a callback for `id`
    pub fn add(&self, id: impl Into<String>, callback: AckCallback) {
        if let Ok(mut map) = self.by_id.lock() {
            map.entry(id.into()).or_default().push(callback);
        }
    }

    /// Fire and remove the callbacks of every acknowledged stanza
    pub fn notify(&self, acknowledged: &[Stanza]) {
        for stanza in acknowledged {
            let Some(id) = stanza.id() else { continue };
            let callbacks = match self.by_id.lock() {
                Ok(mut map) => map.remove(id),
                Err(_) => None,
            };
            for callback in callbacks.into_iter().flatten() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(stanza)
                }));
                if result.is_err() {
                    warn!("Ack listener for stanza {} panicked", id);
                }
            }
        }
    }

    /// Drop callbacks for stanzas that will never be acknowledged
    pub fn forget(&self, stanzas: &[Stanza]) {
        if let Ok(mut map) = self.by_id.lock() {
            for id in stanzas.iter().filter_map(Stanza::id) {
                map.remove(id);
            }
        }
    }

    /// Number of ids with pending callbacks
    pub fn len(&self) -> usize {
        self.by_id.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// True when no callbacks are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AckListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckListeners")
            .field("ids", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn enabled(resume: bool, max: Option<u32>) -> SmEnabled {
        SmEnabled {
            id: Some("sm-1".to_string()),
            resume,
            max,
            location: None,
        }
    }

    fn msg(id: &str) -> Stanza {
        Stanza::message().id(id).to("bob@example.com").body(id).build()
    }

    #[test]
    fn test_record_and_ack() {
        let mut sm = ReliabilitySession::enabled(&enabled(true, None), None);
        for id in ["s1", "s2", "s3"] {
            sm.record_outbound(msg(id));
        }
        assert_eq!(sm.counters().sent, 3);
        assert_eq!(sm.unacked_len(), 3);

        let acked = sm.process_ack(2).unwrap();
        let ids: Vec<_> = acked.iter().filter_map(|s| s.id()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        sm.process_ack(3).unwrap();
        let counters = sm.counters();
        assert_eq!(counters.acked, 3);
        assert_eq!(counters.unacked, 0);

        // Repeating the same h is harmless
        assert!(sm.process_ack(3).unwrap().is_empty());
    }

    #[test]
    fn test_ack_out_of_range() {
        let mut sm = ReliabilitySession::enabled(&enabled(true, None), None);
        sm.record_outbound(msg("s1"));
        let err = sm.process_ack(2).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        // Rejected ack leaves state untouched
        assert_eq!(sm.counters().acked, 0);
        assert_eq!(sm.unacked_len(), 1);
    }

    #[test]
    fn test_ack_below_acked_is_violation() {
        let mut sm = ReliabilitySession::enabled(&enabled(true, None), None);
        sm.record_outbound(msg("s1"));
        sm.record_outbound(msg("s2"));
        sm.process_ack(2).unwrap();
        assert!(sm.process_ack(1).is_err());
    }

    #[test]
    fn test_counters_wrap() {
        let mut sm = ReliabilitySession::enabled(&enabled(true, None), None);
        sm.sent = u32::MAX - 1;
        sm.acked = u32::MAX - 1;
        sm.record_outbound(msg("a"));
        sm.record_outbound(msg("b"));
        sm.record_outbound(msg("c"));
        assert_eq!(sm.counters().sent, 1);

        let acked = sm.process_ack(0).unwrap();
        assert_eq!(acked.len(), 2);
        assert_eq!(sm.unacked_len(), 1);
        sm.process_ack(1).unwrap();
        assert_eq!(sm.unacked_len(), 0);
    }

    #[test]
    fn test_resume_reconciles_and_returns_resend() {
        let mut sm = ReliabilitySession::enabled(&enabled(true, None), None);
        for id in ["s1", "s2", "s3", "s4", "s5"] {
            sm.record_outbound(msg(id));
        }
        sm.record_inbound();
        sm.mark_transport_lost(Instant::now());

        match sm.resume_request() {
            Some(Nonza::SmResume { h, previd }) => {
                assert_eq!(h, 1);
                assert_eq!(previd, "sm-1");
            }
            other => panic!("unexpected resume request {:?}", other),
        }

        let (acked, resend) = sm.on_resumed(2).unwrap();
        assert_eq!(acked.len(), 2);
        let ids: Vec<_> = resend.iter().filter_map(|s| s.id()).collect();
        assert_eq!(ids, vec!["s3", "s4", "s5"]);
        assert_eq!(sm.counters().sent, 2);

        for stanza in resend {
            sm.record_outbound(stanza);
        }
        assert_eq!(sm.counters().sent, 5);
        assert_eq!(sm.unacked_len(), 3);
    }

    #[test]
    fn test_resumption_window() {
        let sm = ReliabilitySession::enabled(&enabled(true, Some(60)), Some(Duration::from_secs(30)));
        assert_eq!(sm.max_resumption(), Some(Duration::from_secs(30)));

        let mut sm = ReliabilitySession::enabled(&enabled(true, Some(10)), None);
        assert_eq!(sm.max_resumption(), Some(Duration::from_secs(10)));
        let lost = Instant::now();
        sm.mark_transport_lost(lost);
        assert!(sm.resumption_possible(lost + Duration::from_secs(10)));
        assert!(!sm.resumption_possible(lost + Duration::from_secs(11)));

        let not_resumable = ReliabilitySession::enabled(&enabled(false, None), None);
        assert!(not_resumable.resume_request().is_none());
        assert!(!not_resumable.resumption_possible(lost));
    }

    #[test]
    fn test_ack_listeners_fire_once() {
        let listeners = AckListeners::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        listeners.add(
            "s1",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(listeners.len(), 1);

        listeners.notify(&[msg("s1")]);
        listeners.notify(&[msg("s1")]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }
}
