//! Pending-request queue with visibility-timeout leases.
//!
//! FIFO per priority class; a higher class is always dequeued first when
//! both are ready. A dequeued item is held under a lease and invisible to
//! other consumers; if the lease is neither acknowledged nor released
//! before it expires, the item automatically becomes visible again. That
//! re-delivery is the at-least-once mechanism the coordinator tolerates
//! through idempotent, fenced state transitions.
//!
//! Backoff re-entries are enqueued with a delay and stay invisible until
//! their delay elapses.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use forgeline_protocol::{Priority, RequestId};
use thiserror::Error;
use tracing::debug;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The lease was already reclaimed (expired) or acknowledged.
    #[error("stale lease {lease_id} for request {request_id}")]
    StaleLease { request_id: RequestId, lease_id: String },
}

/// A time-bounded claim on one dequeued request.
#[derive(Debug, Clone)]
pub struct LeaseToken {
    pub request_id: RequestId,
    pub lease_id: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct LeaseEntry {
    lease_id: String,
    priority: Priority,
    expires_at: Instant,
}

#[derive(Debug)]
struct DelayedEntry {
    visible_at: Instant,
    priority: Priority,
    request_id: RequestId,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Ready items, one FIFO lane per priority class (index 0 = High).
    ready: [VecDeque<RequestId>; 3],
    /// Items invisible until their backoff delay elapses.
    delayed: Vec<DelayedEntry>,
    /// Dequeued-but-unacknowledged items, keyed by request ID.
    in_flight: HashMap<String, LeaseEntry>,
    closed: bool,
}

fn rank(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

/// Ordered queue of pending request IDs.
#[derive(Debug, Default)]
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a request visible immediately.
    pub fn enqueue(&self, request_id: RequestId, priority: Priority) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready[rank(priority)].push_back(request_id);
        drop(inner);
        self.available.notify_one();
    }

    /// Make a request visible after a delay (retry backoff).
    pub fn enqueue_delayed(&self, request_id: RequestId, priority: Priority, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.delayed.push(DelayedEntry {
            visible_at: Instant::now() + delay,
            priority,
            request_id,
        });
        drop(inner);
        self.available.notify_one();
    }

    /// Dequeue the next visible request, blocking up to `wait`.
    ///
    /// The returned lease keeps the item invisible for `visibility`;
    /// an unacknowledged lease is reclaimed on expiry and the item
    /// returns to the head of its priority lane.
    pub fn dequeue(&self, visibility: Duration, wait: Duration) -> Option<LeaseToken> {
        let deadline = Instant::now() + wait;
        let mut inner = self.inner.lock().unwrap();
        loop {
            let now = Instant::now();

            // Promote delayed items whose backoff has elapsed.
            let mut idx = 0;
            while idx < inner.delayed.len() {
                if inner.delayed[idx].visible_at <= now {
                    let entry = inner.delayed.swap_remove(idx);
                    inner.ready[rank(entry.priority)].push_back(entry.request_id);
                } else {
                    idx += 1;
                }
            }

            // Reclaim expired leases: the item becomes visible again.
            let expired: Vec<String> = inner
                .in_flight
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(lease) = inner.in_flight.remove(&id) {
                    debug!(request_id = %id, lease_id = %lease.lease_id, "lease expired, requeueing");
                    inner.ready[rank(lease.priority)].push_front(RequestId::from_string(id));
                }
            }

            // Highest priority class first.
            for lane in 0..inner.ready.len() {
                if let Some(request_id) = inner.ready[lane].pop_front() {
                    let priority = match lane {
                        0 => Priority::High,
                        1 => Priority::Normal,
                        _ => Priority::Low,
                    };
                    let lease_id = uuid::Uuid::new_v4().to_string();
                    let expires_at = now + visibility;
                    inner.in_flight.insert(
                        request_id.as_str().to_string(),
                        LeaseEntry {
                            lease_id: lease_id.clone(),
                            priority,
                            expires_at,
                        },
                    );
                    return Some(LeaseToken {
                        request_id,
                        lease_id,
                        expires_at,
                    });
                }
            }

            if inner.closed || now >= deadline {
                return None;
            }

            // Sleep until something can change: enqueue notification,
            // the wait deadline, a delay elapsing, or a lease expiring.
            let mut wake = deadline;
            for entry in &inner.delayed {
                wake = wake.min(entry.visible_at);
            }
            for lease in inner.in_flight.values() {
                wake = wake.min(lease.expires_at);
            }
            let timeout = wake.saturating_duration_since(now).max(Duration::from_millis(1));
            let (guard, _) = self.available.wait_timeout(inner, timeout).unwrap();
            inner = guard;
        }
    }

    /// Acknowledge a processed item, retiring its lease.
    pub fn acknowledge(&self, token: &LeaseToken) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.in_flight.get(token.request_id.as_str()) {
            Some(lease) if lease.lease_id == token.lease_id => {
                inner.in_flight.remove(token.request_id.as_str());
                Ok(())
            }
            _ => Err(QueueError::StaleLease {
                request_id: token.request_id.clone(),
                lease_id: token.lease_id.clone(),
            }),
        }
    }

    /// Return a leased item to the head of its lane without processing it.
    pub fn release(&self, token: &LeaseToken) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.in_flight.get(token.request_id.as_str()) {
            Some(lease) if lease.lease_id == token.lease_id => {
                let lease = inner.in_flight.remove(token.request_id.as_str()).unwrap();
                inner.ready[rank(lease.priority)].push_front(token.request_id.clone());
                drop(inner);
                self.available.notify_one();
                Ok(())
            }
            _ => Err(QueueError::StaleLease {
                request_id: token.request_id.clone(),
                lease_id: token.lease_id.clone(),
            }),
        }
    }

    /// Wake all waiters and make further dequeues return immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    /// Number of immediately visible items.
    pub fn ready_len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.iter().map(|lane| lane.len()).sum()
    }

    /// Number of leased, unacknowledged items.
    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }
}
