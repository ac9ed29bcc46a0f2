//! Centralized revalidation timers.
//!
//! One long-lived task owns every timer in the engine: gc deadlines and
//! interval refetches share a single deadline heap, so there are no
//! per-key timer tasks to leak. Store events arm and disarm deadlines;
//! epoch counters cancel the ones a resubscribe or re-idle superseded.
//! Every trigger funnels through the coordinator, so overlapping causes
//! collapse into the one in-flight fetch per key.

use std::cmp::{self, Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::net::NetworkHandle;

use super::coordinator::FetchCoordinator;
use super::key::QueryKey;
use super::store::{QueryStore, StoreEvent};

// ===== Deadlines =====

enum DeadlineKind {
    /// Evict the entry if it is still subscriber-free.
    Gc,
    /// Periodic refetch for a subscribed entry.
    Interval { every: Duration },
}

struct Deadline {
    at: Instant,
    /// Tie-breaker so equal instants pop in push order.
    seq: u64,
    epoch: u64,
    kind: DeadlineKind,
    key: QueryKey,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Deadline {}

// ===== Scheduler =====

pub(crate) struct RevalidationScheduler {
    store: Arc<QueryStore>,
    coordinator: Arc<FetchCoordinator>,
    network: NetworkHandle,
    /// Open while a session is active; background triggers are skipped
    /// when closed.
    session_gate: watch::Receiver<bool>,
    heap: BinaryHeap<Reverse<Deadline>>,
    /// Current epoch per key; a pending deadline with an older epoch is
    /// void.
    gc_epochs: HashMap<QueryKey, u64>,
    interval_epochs: HashMap<QueryKey, u64>,
    next_seq: u64,
}

impl RevalidationScheduler {
    pub(crate) fn spawn(
        store: Arc<QueryStore>,
        coordinator: Arc<FetchCoordinator>,
        network: NetworkHandle,
        events: mpsc::UnboundedReceiver<StoreEvent>,
        session_gate: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = RevalidationScheduler {
            store,
            coordinator,
            network,
            session_gate,
            heap: BinaryHeap::new(),
            gc_epochs: HashMap::new(),
            interval_epochs: HashMap::new(),
            next_seq: 0,
        };
        tokio::spawn(scheduler.run(events))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
        let mut connectivity = self.network.receiver();
        let mut gate = self.session_gate.clone();
        let mut was_online = connectivity.borrow_and_update().is_online();
        let mut connectivity_live = true;
        let mut gate_live = true;
        loop {
            let wake_at = self.heap.peek().map(|Reverse(d)| d.at);
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                result = connectivity.changed(), if connectivity_live => {
                    match result {
                        Ok(()) => {
                            let online = connectivity.borrow_and_update().is_online();
                            if online && !was_online && self.gate_open() {
                                self.sweep_reconnect();
                            }
                            was_online = online;
                        }
                        Err(_) => connectivity_live = false,
                    }
                }
                result = gate.changed(), if gate_live => {
                    match result {
                        Ok(()) => {
                            // A session coming back online-side picks up
                            // whatever was deferred while gated.
                            if *gate.borrow_and_update() && was_online {
                                self.sweep_reconnect();
                            }
                        }
                        Err(_) => gate_live = false,
                    }
                }
                _ = sleep_until(wake_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(60))),
                    if wake_at.is_some() =>
                {
                    self.run_due();
                }
            }
        }
    }

    fn gate_open(&self) -> bool {
        *self.session_gate.borrow()
    }

    fn handle_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Subscribed {
                key,
                first,
                stale,
                refetch_interval,
            } => {
                // Any pending gc deadline for this key is now void.
                bump(&mut self.gc_epochs, &key);
                // The cadence follows the latest subscriber's options, the
                // same way the store lets the latest options win.
                let epoch = bump(&mut self.interval_epochs, &key);
                if let Some(every) = refetch_interval {
                    let kind = DeadlineKind::Interval { every };
                    self.push(Instant::now() + every, epoch, kind, key.clone());
                }
                if first && stale && self.gate_open() {
                    debug!(key = %key, "mount refetch");
                    self.coordinator.spawn_refetch(key);
                }
            }
            StoreEvent::Idle { key, gc_at } => {
                bump(&mut self.interval_epochs, &key);
                let epoch = bump(&mut self.gc_epochs, &key);
                self.push(gc_at, epoch, DeadlineKind::Gc, key);
            }
            StoreEvent::Invalidated { key } => {
                if self.gate_open() {
                    debug!(key = %key, "invalidation refetch");
                    self.coordinator.spawn_refetch(key);
                }
            }
            StoreEvent::Cleared => {
                self.heap.clear();
                self.gc_epochs.clear();
                self.interval_epochs.clear();
            }
        }
    }

    fn run_due(&mut self) {
        let now = Instant::now();
        loop {
            match self.heap.peek() {
                Some(Reverse(head)) if head.at <= now => {}
                _ => break,
            }
            if let Some(Reverse(deadline)) = self.heap.pop() {
                self.dispatch(deadline, now);
            }
        }
    }

    fn dispatch(&mut self, deadline: Deadline, now: Instant) {
        match deadline.kind {
            DeadlineKind::Gc => {
                if self.gc_epochs.get(&deadline.key) != Some(&deadline.epoch) {
                    trace!(key = %deadline.key, "gc deadline superseded");
                    return;
                }
                if self.store.evict_if_idle(&deadline.key) {
                    self.gc_epochs.remove(&deadline.key);
                    self.interval_epochs.remove(&deadline.key);
                }
            }
            DeadlineKind::Interval { every } => {
                if self.interval_epochs.get(&deadline.key) != Some(&deadline.epoch) {
                    trace!(key = %deadline.key, "interval deadline superseded");
                    return;
                }
                // Keep the cadence armed even while the trigger itself is
                // gated; ticks resume effect when the session returns.
                let next = cmp::max(deadline.at + every, now);
                let kind = DeadlineKind::Interval { every };
                self.push(next, deadline.epoch, kind, deadline.key.clone());
                if self.gate_open() {
                    trace!(key = %deadline.key, "interval refetch");
                    self.coordinator.spawn_refetch(deadline.key);
                }
            }
        }
    }

    /// One refetch per deferred or reconnect-eligible key.
    fn sweep_reconnect(&self) {
        let keys = self.store.reconnect_keys();
        if keys.is_empty() {
            return;
        }
        debug!(count = keys.len(), "reconnect sweep");
        for key in keys {
            self.coordinator.spawn_refetch(key);
        }
    }

    fn push(&mut self, at: Instant, epoch: u64, kind: DeadlineKind, key: QueryKey) {
        self.next_seq += 1;
        self.heap.push(Reverse(Deadline {
            at,
            seq: self.next_seq,
            epoch,
            kind,
            key,
        }));
    }
}

fn bump(epochs: &mut HashMap<QueryKey, u64>, key: &QueryKey) -> u64 {
    let epoch = epochs.entry(key.clone()).or_insert(0);
    *epoch += 1;
    *epoch
}
