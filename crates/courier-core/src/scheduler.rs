//! Sync scheduler: when to attempt transmission and how to back off
//!
//! Per outbox entry the scheduler walks `Idle -> Attempting ->
//! {Acknowledged | BackingOff}`; `BackingOff` returns to `Attempting`
//! after an exponentially increasing delay (bounded by a maximum) or
//! immediately on a connectivity-restored signal.
//!
//! All durable scheduling state lives in the ledger: attempt counts and
//! last-attempt times ride on the message records themselves, so a process
//! restart recovers the exact backoff posture. The only in-memory state is
//! the in-flight set, which enforces at most one outstanding transmission
//! per entry; a watchdog forces entries stranded there (cancelled tasks,
//! app shutdown mid-send) back to `BackingOff`.

use crate::config::BackoffConfig;
use crate::error::CourierResult;
use crate::storage::Ledger;
use crate::types::{ConversationId, MessageId, MessageRecord, OutboxEntry};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Observable retry state of one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Never attempted; due immediately
    Idle,
    /// A transmission attempt is in flight
    Attempting,
    /// Waiting out the backoff delay until the given time (millis)
    BackingOff {
        /// Unix timestamp in milliseconds when the entry is due again
        due_at: i64,
    },
}

/// Decides which outbox entries are due and serializes their attempts.
pub struct SyncScheduler {
    ledger: Ledger,
    backoff: BackoffConfig,
    watchdog_millis: i64,
    /// In-flight attempts: message id -> attempt start time (millis)
    in_flight: Mutex<HashMap<MessageId, i64>>,
    online: AtomicBool,
}

impl SyncScheduler {
    /// Create a scheduler over the ledger.
    pub fn new(ledger: Ledger, backoff: BackoffConfig, watchdog_millis: i64) -> Self {
        Self {
            ledger,
            backoff,
            watchdog_millis,
            in_flight: Mutex::new(HashMap::new()),
            online: AtomicBool::new(false),
        }
    }

    /// Record a connectivity change. Returns whether the state changed.
    ///
    /// Going online makes every backed-off entry due immediately.
    pub fn notify_connectivity_changed(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            debug!(online, "Connectivity changed");
        }
        previous != online
    }

    /// Current connectivity as last signalled
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The retry state of a record at `now`.
    pub fn retry_state(&self, record: &MessageRecord, now: i64) -> RetryState {
        if self.in_flight.lock().contains_key(&record.id) {
            return RetryState::Attempting;
        }
        match record.last_attempt_at {
            None => RetryState::Idle,
            Some(last) => {
                let delay = self.backoff.delay_for(record.attempts).as_millis() as i64;
                let due_at = last + delay;
                if now >= due_at {
                    RetryState::Idle
                } else {
                    RetryState::BackingOff { due_at }
                }
            }
        }
    }

    /// The conversation's due outbox entries at `now`, in creation order.
    ///
    /// An entry is due when it is not in flight and its backoff delay has
    /// elapsed; a connectivity-restored signal shortcuts the delay.
    pub fn due_entries(
        &self,
        conversation_id: &ConversationId,
        now: i64,
        connectivity_restored: bool,
    ) -> CourierResult<Vec<OutboxEntry>> {
        let in_flight = self.in_flight.lock();
        Ok(self
            .ledger
            .pending_outbox(conversation_id)?
            .into_iter()
            .filter(|entry| !in_flight.contains_key(&entry.id()))
            .filter(|entry| {
                connectivity_restored
                    || match entry.message.last_attempt_at {
                        None => true,
                        Some(last) => {
                            let delay =
                                self.backoff.delay_for(entry.message.attempts).as_millis() as i64;
                            now >= last + delay
                        }
                    }
            })
            .collect())
    }

    /// Claim an entry for one transmission attempt.
    ///
    /// Returns `false` when an attempt is already in flight, which is what
    /// enforces at most one outstanding transmission per entry.
    pub fn begin_attempt(&self, id: MessageId, now: i64) -> bool {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&id) {
            return false;
        }
        in_flight.insert(id, now);
        true
    }

    /// Release an entry after its attempt resolved (either way).
    pub fn finish_attempt(&self, id: &MessageId) {
        self.in_flight.lock().remove(id);
    }

    /// Force entries stranded in `Attempting` back to `BackingOff`.
    ///
    /// A cancelled send (user retraction, app shutdown) must not pin its
    /// entry in flight forever; anything older than the watchdog timeout
    /// is released and retried on the normal schedule.
    pub fn watchdog_sweep(&self, now: i64) -> Vec<MessageId> {
        let mut in_flight = self.in_flight.lock();
        let stale: Vec<MessageId> = in_flight
            .iter()
            .filter(|(_, started)| now - **started >= self.watchdog_millis)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            warn!(message_id = %id, "Watchdog released stranded attempt");
            in_flight.remove(id);
        }
        stale
    }

    /// Number of attempts currently in flight (diagnostics).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}
