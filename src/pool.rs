//! Connection pool with dial coalescing.
//!
//! The pool exclusively owns connections and hands out leases scoped to a
//! single request. Slots are keyed by the caller (host key + protocol);
//! concurrent callers that find no usable connection share a single dial.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{Error, Result};

/// A connection is unusable once idle longer than this.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A connection is unusable once older than this.
pub const MAX_AGE: Duration = Duration::from_secs(300);

/// Behavior the pool needs from a pooled connection.
pub trait Poolable: Send + Sync + 'static {
    /// Concurrent leases this connection supports (1 for exclusive H1,
    /// peer MAX_CONCURRENT_STREAMS for muxed transports).
    fn max_concurrent(&self) -> u32;

    /// False once the transport has observed a fatal error.
    fn is_healthy(&self) -> bool;
}

/// Result of a finished lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Connection stays reusable.
    Reusable,
    /// Connection must not be handed out again.
    Unhealthy,
}

/// Pool-owned connection entry.
pub struct Entry<C> {
    conn: C,
    created: Instant,
    last_used: Mutex<Instant>,
    in_flight: AtomicU32,
    use_count: AtomicU64,
    unhealthy: AtomicBool,
    closed: AtomicBool,
}

impl<C: Poolable> Entry<C> {
    fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created: now,
            last_used: Mutex::new(now),
            in_flight: AtomicU32::new(0),
            use_count: AtomicU64::new(0),
            unhealthy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::Relaxed);
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn usable(&self) -> bool {
        if self.unhealthy.load(Ordering::Relaxed)
            || self.closed.load(Ordering::Relaxed)
            || !self.conn.is_healthy()
        {
            return false;
        }
        if self.created.elapsed() > MAX_AGE {
            return false;
        }
        let idle = self.last_used.lock().expect("pool entry poisoned").elapsed();
        if self.in_flight() == 0 && idle > IDLE_TIMEOUT {
            return false;
        }
        self.in_flight() < self.conn.max_concurrent()
    }

    fn lease(self: &Arc<Self>) -> Lease<C> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.use_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock().expect("pool entry poisoned") = Instant::now();
        Lease {
            entry: Arc::clone(self),
            released: false,
        }
    }
}

/// A usage lease scoped to a single request. Dropping the lease releases
/// the slot with a `Reusable` outcome; use [`Lease::release`] to report a
/// transport failure.
pub struct Lease<C: Poolable> {
    entry: Arc<Entry<C>>,
    released: bool,
}

impl<C: Poolable> Lease<C> {
    pub fn conn(&self) -> &C {
        &self.entry.conn
    }

    /// Number of times this connection has been leased, including now.
    pub fn use_count(&self) -> u64 {
        self.entry.use_count()
    }

    /// True when this lease did not dial a new connection.
    pub fn is_reused(&self) -> bool {
        self.use_count() > 1
    }

    pub fn release(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.released {
            return;
        }
        self.released = true;
        if outcome == Outcome::Unhealthy {
            self.entry.mark_unhealthy();
        }
        *self.entry.last_used.lock().expect("pool entry poisoned") = Instant::now();
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<C: Poolable> Drop for Lease<C> {
    fn drop(&mut self) {
        self.finish(Outcome::Reusable);
    }
}

type DialWaiter<C> = watch::Receiver<Option<std::result::Result<Arc<Entry<C>>, SharedError>>>;

/// Dial errors are delivered to every coalesced waiter; the message and
/// classification carry over intact.
#[derive(Clone)]
struct SharedError(Arc<Error>);

impl SharedError {
    fn to_error(&self) -> Error {
        let e = &*self.0;
        Error::new(e.op, e.category, e.to_string())
            .with_endpoint(&e.host, e.port)
            .retryable(e.retryable)
    }
}

struct Slot<C> {
    conns: Vec<Arc<Entry<C>>>,
    dialing: Option<DialWaiter<C>>,
}

/// Releases a claimed dial slot if the dialing future is dropped.
struct DialCleanup<'a, K, C>
where
    K: Hash + Eq + Clone + Send + 'static,
    C: Poolable,
{
    pool: &'a Pool<K, C>,
    key: Option<K>,
}

impl<K, C> Drop for DialCleanup<'_, K, C>
where
    K: Hash + Eq + Clone + Send + 'static,
    C: Poolable,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut slots = self.pool.slots.lock().expect("pool poisoned");
            if let Some(slot) = slots.get_mut(&key) {
                slot.dialing = None;
            }
        }
    }
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            conns: Vec::new(),
            dialing: None,
        }
    }
}

/// Connection pool keyed by `K` (host key + protocol).
pub struct Pool<K, C> {
    slots: Mutex<HashMap<K, Slot<C>>>,
    closed: AtomicBool,
}

impl<K, C> Pool<K, C>
where
    K: Hash + Eq + Clone + Send + 'static,
    C: Poolable,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquire a connection for `key`, dialing with `dial` when no pooled
    /// connection is usable. Concurrent callers coalesce on one dial; its
    /// outcome (connection or error) is shared by every waiter.
    pub async fn acquire<F, Fut>(&self, key: K, dial: F) -> Result<Lease<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut dial = Some(dial);
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(Error::closed("pool_acquire"));
            }

            enum Plan<C> {
                Ready(Arc<Entry<C>>),
                Wait(DialWaiter<C>),
                Dial(watch::Sender<Option<std::result::Result<Arc<Entry<C>>, SharedError>>>),
            }

            let plan = {
                let mut slots = self.slots.lock().expect("pool poisoned");
                let slot = slots.entry(key.clone()).or_default();

                slot.conns.retain(|e| e.in_flight() > 0 || e.usable());

                // Among usable muxed candidates, favor fewest in-flight streams.
                if let Some(entry) = slot
                    .conns
                    .iter()
                    .filter(|e| e.usable())
                    .min_by_key(|e| e.in_flight())
                {
                    Plan::Ready(Arc::clone(entry))
                } else if let Some(rx) = &slot.dialing {
                    Plan::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    slot.dialing = Some(rx);
                    Plan::Dial(tx)
                }
            };

            match plan {
                Plan::Ready(entry) => return Ok(entry.lease()),
                Plan::Wait(mut rx) => loop {
                    if let Some(result) = rx.borrow().clone() {
                        return match result {
                            Ok(entry) => Ok(entry.lease()),
                            Err(shared) => Err(shared.to_error()),
                        };
                    }
                    if rx.changed().await.is_err() {
                        // The dialer was cancelled before reporting. Clear
                        // the stale slot and retake the decision.
                        self.clear_dialing(&key);
                        break;
                    }
                },
                Plan::Dial(tx) => {
                    // If this future is dropped mid-dial (a cancelled race
                    // branch), the guard releases the slot so waiters and
                    // later callers can dial again.
                    let guard = DialCleanup { pool: self, key: Some(key.clone()) };
                    let dial = dial.take().expect("dial consumed twice");
                    let result = dial().await;
                    std::mem::forget(guard);

                    let mut slots = self.slots.lock().expect("pool poisoned");
                    let slot = slots.entry(key).or_default();
                    slot.dialing = None;
                    return match result {
                        Ok(conn) => {
                            let entry = Arc::new(Entry::new(conn));
                            slot.conns.push(Arc::clone(&entry));
                            let _ = tx.send(Some(Ok(Arc::clone(&entry))));
                            Ok(entry.lease())
                        }
                        Err(err) => {
                            // Dial errors are never cached as connections.
                            let _ = tx.send(Some(Err(SharedError(Arc::new(
                                Error::new(err.op, err.category, err.to_string())
                                    .with_endpoint(&err.host, err.port)
                                    .retryable(err.retryable),
                            )))));
                            Err(err)
                        }
                    };
                }
            }

            // Only the Wait arm falls through; a cancelled dialer means the
            // dial closure is still ours to run on the next pass if needed.
            if dial.is_none() {
                return Err(Error::network("pool_dial", "coalesced dial abandoned"));
            }
        }
    }

    fn clear_dialing(&self, key: &K) {
        let mut slots = self.slots.lock().expect("pool poisoned");
        if let Some(slot) = slots.get_mut(key) {
            let stale = slot
                .dialing
                .as_ref()
                .map(|rx| rx.has_changed().is_err())
                .unwrap_or(false);
            if stale {
                slot.dialing = None;
            }
        }
    }

    /// Run `f` against every pooled connection (health sweeps, shutdown).
    pub fn for_each<F: FnMut(&C)>(&self, mut f: F) {
        let slots = self.slots.lock().expect("pool poisoned");
        for slot in slots.values() {
            for entry in &slot.conns {
                f(&entry.conn);
            }
        }
    }

    /// Drop every pooled connection, keeping the pool usable.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().expect("pool poisoned");
        for slot in slots.values() {
            for entry in &slot.conns {
                entry.mark_closed();
            }
        }
        slots.clear();
    }

    /// Drain all connections and refuse further acquires.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.clear();
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .expect("pool poisoned")
            .values()
            .map(|s| s.conns.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, C> Default for Pool<K, C>
where
    K: Hash + Eq + Clone + Send + 'static,
    C: Poolable,
{
    fn default() -> Self {
        Self::new()
    }
}
