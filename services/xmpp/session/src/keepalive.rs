//! Ack-request scheduling and whitespace keepalive.
//!
//! Both timers are driven by the writer task: it reports every stanza it writes
//! and polls on a fixed tick. Neither type performs I/O.

use std::time::{Duration, Instant};

/// Single space written on an idle stream (RFC 6120 §4.6.1)
pub const WHITESPACE_PING: &[u8] = b" ";

/// Period of the writer's housekeeping tick
pub const TICK_PERIOD: Duration = Duration::from_millis(500);

/// When the client sends `<r/>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRequestPolicy {
    /// Request after this many stanzas written since the last request
    pub every_stanzas: Option<u32>,
    /// Request when unacknowledged stanzas are older than this
    pub interval: Option<Duration>,
}

impl Default for AckRequestPolicy {
    fn default() -> Self {
        Self {
            every_stanzas: Some(5),
            interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Decides when to request an acknowledgement, whichever threshold comes first
#[derive(Debug, Clone)]
pub struct AckRequestScheduler {
    policy: AckRequestPolicy,
    since_request: u32,
    last_request: Instant,
}

impl AckRequestScheduler {
    /// Create a scheduler starting at `now`
    pub fn new(policy: AckRequestPolicy, now: Instant) -> Self {
        Self {
            policy,
            since_request: 0,
            last_request: now,
        }
    }

    /// Record one written stanza; true when `<r/>` should follow it
    pub fn on_stanza_written(&mut self, now: Instant) -> bool {
        self.since_request = self.since_request.saturating_add(1);
        match self.policy.every_stanzas {
            Some(n) if self.since_request >= n => {
                self.requested(now);
                true
            }
            _ => false,
        }
    }

    /// Periodic check; true when the interval elapsed with stanzas still unacknowledged
    pub fn on_tick(&mut self, now: Instant, has_unacked: bool) -> bool {
        let Some(interval) = self.policy.interval else {
            return false;
        };
        if has_unacked && now.saturating_duration_since(self.last_request) >= interval {
            self.requested(now);
            return true;
        }
        if !has_unacked {
            // Nothing outstanding, restart the interval from here
            self.last_request = now;
        }
        false
    }

    /// Note an explicitly requested ack
    pub fn requested(&mut self, now: Instant) {
        self.since_request = 0;
        self.last_request = now;
    }
}

/// Tracks write activity for whitespace keepalives
#[derive(Debug, Clone)]
pub struct WhitespaceKeepalive {
    interval: Option<Duration>,
    last_write: Instant,
}

impl WhitespaceKeepalive {
    /// Disabled when `interval` is `None`
    pub fn new(interval: Option<Duration>, now: Instant) -> Self {
        Self {
            interval,
            last_write: now,
        }
    }

    /// Note that something was written
    pub fn touch(&mut self, now: Instant) {
        self.last_write = now;
    }

    /// True when the stream has been idle for the full interval
    pub fn due(&self, now: Instant) -> bool {
        match self.interval {
            Some(interval) => now.saturating_duration_since(self.last_write) >= interval,
            None => false,
        }
    }
}
