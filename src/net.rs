//! Connectivity monitoring for offline-aware fetching.
//!
//! The engine never fetches while offline, so it needs a single source of
//! truth for connectivity. [`NetworkMonitor`] combines passive signals
//! (the embedding shell reports platform online/offline events) with an
//! active liveness probe that runs only while offline. A single failed
//! probe is enough to stay offline and a single success flips back online;
//! there is no multi-sample debouncing.
//!
//! Consumers hold a cheap [`NetworkHandle`] wrapping a watch channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default probe cadence while offline.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
/// Default timeout for a single probe attempt.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connectivity as seen by the engine. Probing gates fetches exactly like
/// offline; it only signals that a recovery attempt is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
    Probing,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Online => write!(f, "online"),
            Connectivity::Offline => write!(f, "offline"),
            Connectivity::Probing => write!(f, "probing"),
        }
    }
}

/// Probe timings. These are configuration defaults, not fixed constants;
/// `Config` overrides them from file or environment.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// One liveness check against the backend. Any error means unreachable.
pub trait ConnectivityProbe: Send + Sync {
    fn check(&self) -> BoxFuture<'static, Result<()>>;
}

/// Probes the API origin with a HEAD request. Any HTTP response counts as
/// reachable; only transport failures mean offline.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build probe client")?;
        Ok(HttpProbe {
            client,
            url: url.into(),
        })
    }
}

impl ConnectivityProbe for HttpProbe {
    fn check(&self) -> BoxFuture<'static, Result<()>> {
        let request = self.client.head(&self.url);
        Box::pin(async move {
            request.send().await.context("probe request failed")?;
            Ok(())
        })
    }
}

/// Owns the connectivity state and the probe task. Dropping the monitor
/// stops probing; handles keep reporting the last published state.
pub struct NetworkMonitor {
    state: watch::Sender<Connectivity>,
    probe_hint: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Starts the monitor in the online state with the probe task parked.
    pub fn spawn(probe: Arc<dyn ConnectivityProbe>, config: NetworkConfig) -> Self {
        let (state, _) = watch::channel(Connectivity::Online);
        let (probe_hint, hint_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(probe_loop(state.clone(), probe, config, hint_rx));
        NetworkMonitor {
            state,
            probe_hint,
            task,
        }
    }

    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            rx: self.state.subscribe(),
            hint: Some(self.probe_hint.clone()),
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Passive platform signal: connectivity reported available.
    pub fn report_online(&self) {
        set_state(&self.state, Connectivity::Online);
    }

    /// Passive platform signal: connectivity reported lost.
    pub fn report_offline(&self) {
        set_state(&self.state, Connectivity::Offline);
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn set_state(state: &watch::Sender<Connectivity>, next: Connectivity) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
    if changed {
        info!(state = %next, "connectivity changed");
    }
}

/// Cheap clonable view of connectivity, held by the coordinator and the
/// scheduler. [`NetworkHandle::always_online`] backs tests and embedders
/// that do not run a monitor.
#[derive(Clone)]
pub struct NetworkHandle {
    rx: watch::Receiver<Connectivity>,
    hint: Option<mpsc::UnboundedSender<()>>,
}

impl NetworkHandle {
    /// Handle pinned to the online state, with no probe behind it.
    ///
    /// The receiver outlives the dropped sender and keeps reporting the
    /// last value; `changed()` on it resolves to closed.
    pub fn always_online() -> Self {
        let (_, rx) = watch::channel(Connectivity::Online);
        NetworkHandle { rx, hint: None }
    }

    pub fn current(&self) -> Connectivity {
        *self.rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.rx.borrow().is_online()
    }

    /// Asks the monitor for an immediate probe. Called after a transient
    /// fetch failure; a no-op without a monitor.
    pub(crate) fn suspect_offline(&self) {
        if let Some(hint) = &self.hint {
            let _ = hint.send(());
        }
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<Connectivity> {
        self.rx.clone()
    }
}

/// Handle with no monitor behind it; tests flip the returned sender.
#[cfg(test)]
pub(crate) fn manual_handle() -> (NetworkHandle, watch::Sender<Connectivity>) {
    let (tx, rx) = watch::channel(Connectivity::Online);
    (NetworkHandle { rx, hint: None }, tx)
}

/// Parked while online; probes every `probe_interval` while offline.
/// A hint wakes it for one immediate probe regardless of state.
async fn probe_loop(
    state: watch::Sender<Connectivity>,
    probe: Arc<dyn ConnectivityProbe>,
    config: NetworkConfig,
    mut hints: mpsc::UnboundedReceiver<()>,
) {
    let mut rx = state.subscribe();
    loop {
        // Park until offline, or until a hint asks for an immediate probe.
        let hinted = loop {
            if !rx.borrow_and_update().is_online() {
                break false;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                hint = hints.recv() => match hint {
                    Some(()) => break true,
                    None => return,
                },
            }
        };

        if !hinted {
            // Offline cadence: wait out the interval, but react to hints
            // and to passive recovery immediately.
            tokio::select! {
                _ = tokio::time::sleep(config.probe_interval) => {}
                hint = hints.recv() => {
                    if hint.is_none() {
                        return;
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
            if rx.borrow_and_update().is_online() {
                continue;
            }
        }

        let was_online = rx.borrow_and_update().is_online();
        if !was_online {
            set_state(&state, Connectivity::Probing);
        }
        let outcome = tokio::time::timeout(config.probe_timeout, probe.check()).await;
        match outcome {
            Ok(Ok(())) => set_state(&state, Connectivity::Online),
            Ok(Err(error)) => {
                debug!(error = %error, "probe failed");
                set_state(&state, Connectivity::Offline);
            }
            Err(_) => {
                debug!("probe timed out");
                set_state(&state, Connectivity::Offline);
            }
        }
        // Mark our own transitions as seen so the park loop sleeps.
        rx.borrow_and_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProbe {
        reachable: AtomicBool,
        hang: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(FakeProbe {
                reachable: AtomicBool::new(reachable),
                hang: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ConnectivityProbe for FakeProbe {
        fn check(&self) -> BoxFuture<'static, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reachable = self.reachable.load(Ordering::SeqCst);
            let hang = self.hang.load(Ordering::SeqCst);
            Box::pin(async move {
                if hang {
                    futures::future::pending::<()>().await;
                }
                if reachable {
                    Ok(())
                } else {
                    anyhow::bail!("unreachable")
                }
            })
        }
    }

    fn fast_config() -> NetworkConfig {
        NetworkConfig {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_signals() {
        let probe = FakeProbe::new(true);
        let monitor = NetworkMonitor::spawn(probe.clone(), fast_config());
        let handle = monitor.handle();

        assert!(handle.is_online());
        monitor.report_offline();
        assert!(!handle.is_online());
        monitor.report_online();
        assert!(handle.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probing_while_online() {
        let probe = FakeProbe::new(true);
        let _monitor = NetworkMonitor::spawn(probe.clone(), fast_config());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_recovers_connectivity() {
        let probe = FakeProbe::new(false);
        let monitor = NetworkMonitor::spawn(probe.clone(), fast_config());
        let handle = monitor.handle();

        monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(!handle.is_online(), "failed probe keeps us offline");
        assert_eq!(probe.calls(), 1);

        probe.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(handle.is_online(), "single successful probe flips online");
        assert_eq!(probe.calls(), 2);

        // Back online: probing stops.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let probe = FakeProbe::new(true);
        probe.hang.store(true, Ordering::SeqCst);
        let monitor = NetworkMonitor::spawn(probe.clone(), fast_config());
        let handle = monitor.handle();

        monitor.report_offline();
        // One interval to start the probe, one timeout to give up on it.
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert!(!handle.is_online());
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspect_offline_probes_immediately() {
        let probe = FakeProbe::new(false);
        let monitor = NetworkMonitor::spawn(probe.clone(), fast_config());
        let handle = monitor.handle();

        assert!(handle.is_online());
        handle.suspect_offline();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_online(), "failed hint probe goes offline");
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_state_gates_like_offline() {
        let probe = FakeProbe::new(true);
        probe.hang.store(true, Ordering::SeqCst);
        let monitor = NetworkMonitor::spawn(probe.clone(), fast_config());
        let handle = monitor.handle();

        monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(handle.current(), Connectivity::Probing);
        assert!(!handle.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_online_handle() {
        let handle = NetworkHandle::always_online();
        assert!(handle.is_online());
        handle.suspect_offline();
        assert!(handle.is_online());
    }
}
