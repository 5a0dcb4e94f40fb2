//! Connectivity tracking.
//!
//! The [`NetworkMonitor`] combines three inputs into one [`NetworkState`]:
//! the manual forced-offline flag, a platform link signal, and a real
//! reachability probe against the API. The state is published through a
//! watch channel so the sync worker can react to transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handle::ServiceHandle;

/// Why the device is considered offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// The user switched on offline mode.
    Forced,
    /// The platform reports no network link.
    NoLink,
    /// There is a link but the API did not answer the probe.
    Unreachable,
}

impl std::fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forced => write!(f, "forced offline mode"),
            Self::NoLink => write!(f, "no network link"),
            Self::Unreachable => write!(f, "API unreachable"),
        }
    }
}

/// Connectivity as seen by the sync subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum NetworkState {
    /// The API is reachable and offline mode is off.
    Online,
    /// Requests must not be attempted.
    Offline(OfflineReason),
}

impl NetworkState {
    /// Whether requests may be attempted.
    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }

    /// The offline reason, if offline.
    #[must_use]
    pub fn offline_reason(self) -> Option<OfflineReason> {
        match self {
            Self::Online => None,
            Self::Offline(reason) => Some(reason),
        }
    }
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline(reason) => write!(f, "offline ({reason})"),
        }
    }
}

/// Platform connectivity signal.
#[async_trait]
pub trait LinkSignal: Send + Sync + std::fmt::Debug {
    /// Whether the platform reports a usable network link.
    async fn has_link(&self) -> bool;
}

/// Check that the API actually answers.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + std::fmt::Debug {
    /// Whether the API responded in time.
    async fn is_reachable(&self) -> bool;
}

/// Link signal that resolves the API host.
///
/// Name resolution failing is the cheapest portable hint that there is no
/// network link.
#[derive(Debug, Clone)]
pub struct DnsLinkSignal {
    authority: String,
}

impl DnsLinkSignal {
    /// Build a signal for the host of `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed or has no host.
    pub fn for_url(url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::invalid_input(format!("invalid URL {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::invalid_input(format!("URL has no host: {url}")))?;
        let port = parsed.port_or_known_default().unwrap_or(80);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Self { authority })
    }
}

#[async_trait]
impl LinkSignal for DnsLinkSignal {
    async fn has_link(&self) -> bool {
        match tokio::net::lookup_host(&self.authority).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(authority = %self.authority, error = %e, "Host lookup failed");
                false
            }
        }
    }
}

/// Reachability probe issuing a GET against the API.
///
/// Any response below 500 counts as reachable; an auth error still proves
/// the server is there.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Build a probe for `base_url` + `path` with its own timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Ok(Self { client, url })
    }

    /// The URL being probed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(url = %self.url, error = %e, "Reachability probe failed");
                false
            }
        }
    }
}

/// Publishes the current [`NetworkState`].
#[derive(Debug)]
pub struct NetworkMonitor {
    link: Arc<dyn LinkSignal>,
    probe: Arc<dyn ReachabilityProbe>,
    forced: AtomicBool,
    state: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
    /// Create a monitor. Until the first [`refresh`](Self::refresh) the
    /// device is treated as offline.
    #[must_use]
    pub fn new(
        link: Arc<dyn LinkSignal>,
        probe: Arc<dyn ReachabilityProbe>,
        forced_offline: bool,
    ) -> Self {
        let initial = if forced_offline {
            NetworkState::Offline(OfflineReason::Forced)
        } else {
            NetworkState::Offline(OfflineReason::Unreachable)
        };
        let (state, _) = watch::channel(initial);
        Self {
            link,
            probe,
            forced: AtomicBool::new(forced_offline),
            state,
        }
    }

    /// The last published state.
    #[must_use]
    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    /// Whether the last published state is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Whether forced offline mode is on.
    #[must_use]
    pub fn is_forced_offline(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Receive every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    /// Ensure requests may be attempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Offline`] if the last published state is offline.
    pub fn require_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Offline)
        }
    }

    /// Switch forced offline mode and re-evaluate.
    pub async fn set_forced_offline(&self, forced: bool) -> NetworkState {
        let previous = self.forced.swap(forced, Ordering::SeqCst);
        if previous != forced {
            info!(forced, "Offline mode changed");
        }
        self.refresh().await
    }

    /// Re-evaluate connectivity and publish the result.
    ///
    /// The probe only runs when the device is not forced offline and has a link.
    pub async fn refresh(&self) -> NetworkState {
        let next = if self.is_forced_offline() {
            NetworkState::Offline(OfflineReason::Forced)
        } else if !self.link.has_link().await {
            NetworkState::Offline(OfflineReason::NoLink)
        } else if !self.probe.is_reachable().await {
            NetworkState::Offline(OfflineReason::Unreachable)
        } else {
            NetworkState::Online
        };
        self.publish(next);
        next
    }

    fn publish(&self, next: NetworkState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "Network state changed");
            *current = next;
            true
        });
    }

    /// Re-evaluate connectivity every `interval` until `handle` is stopped.
    pub async fn watch(&self, interval: Duration, handle: ServiceHandle) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = handle.stopped() => break,
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
        debug!("Network watch stopped");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Link signal with a switchable answer.
    #[derive(Debug)]
    pub struct FakeLink(pub AtomicBool);

    #[async_trait]
    impl LinkSignal for FakeLink {
        async fn has_link(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Probe with a switchable answer that counts its calls.
    #[derive(Debug, Default)]
    pub struct FakeProbe {
        pub reachable: AtomicBool,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn is_reachable(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reachable.load(Ordering::SeqCst)
        }
    }

    /// A monitor backed by fakes, already refreshed.
    pub async fn monitor(online: bool, forced: bool) -> (Arc<NetworkMonitor>, Arc<FakeProbe>) {
        let link = Arc::new(FakeLink(AtomicBool::new(true)));
        let probe = Arc::new(FakeProbe {
            reachable: AtomicBool::new(online),
            calls: AtomicUsize::new(0),
        });
        let monitor = Arc::new(NetworkMonitor::new(link, probe.clone(), forced));
        monitor.refresh().await;
        (monitor, probe)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fakes(link: bool, reachable: bool) -> (Arc<FakeLink>, Arc<FakeProbe>) {
        (
            Arc::new(FakeLink(AtomicBool::new(link))),
            Arc::new(FakeProbe {
                reachable: AtomicBool::new(reachable),
                calls: AtomicUsize::new(0),
            }),
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(NetworkState::Online.to_string(), "online");
        assert_eq!(
            NetworkState::Offline(OfflineReason::Forced).to_string(),
            "offline (forced offline mode)"
        );
        assert_eq!(
            NetworkState::Offline(OfflineReason::NoLink).offline_reason(),
            Some(OfflineReason::NoLink)
        );
    }

    #[test]
    fn test_initial_state_is_offline() {
        let (link, probe) = fakes(true, true);
        let monitor = NetworkMonitor::new(link, probe, false);
        assert!(!monitor.is_online());
        assert!(matches!(monitor.require_online(), Err(Error::Offline)));
    }

    #[tokio::test]
    async fn test_refresh_online() {
        let (link, probe) = fakes(true, true);
        let monitor = NetworkMonitor::new(link, probe, false);
        assert_eq!(monitor.refresh().await, NetworkState::Online);
        assert!(monitor.require_online().is_ok());
    }

    #[tokio::test]
    async fn test_forced_offline_skips_probe() {
        let (link, probe) = fakes(true, true);
        let monitor = NetworkMonitor::new(link, probe.clone(), true);

        assert_eq!(
            monitor.refresh().await,
            NetworkState::Offline(OfflineReason::Forced)
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_link_skips_probe() {
        let (link, probe) = fakes(false, true);
        let monitor = NetworkMonitor::new(link, probe.clone(), false);

        assert_eq!(
            monitor.refresh().await,
            NetworkState::Offline(OfflineReason::NoLink)
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_link_without_reachability() {
        let (link, probe) = fakes(true, false);
        let monitor = NetworkMonitor::new(link, probe, false);
        assert_eq!(
            monitor.refresh().await,
            NetworkState::Offline(OfflineReason::Unreachable)
        );
    }

    #[tokio::test]
    async fn test_toggle_forced_offline_publishes_transitions() {
        let (link, probe) = fakes(true, true);
        let monitor = NetworkMonitor::new(link, probe, false);
        monitor.refresh().await;
        let mut rx = monitor.subscribe();

        monitor.set_forced_offline(true).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkState::Offline(OfflineReason::Forced));
        assert!(monitor.is_forced_offline());

        monitor.set_forced_offline(false).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkState::Online);
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_republished() {
        let (link, probe) = fakes(true, true);
        let monitor = NetworkMonitor::new(link, probe, false);
        monitor.refresh().await;
        let rx = monitor.subscribe();

        monitor.refresh().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_watch_stops_on_signal() {
        let (link, probe) = fakes(true, true);
        let monitor = Arc::new(NetworkMonitor::new(link, probe.clone(), false));
        let handle = ServiceHandle::new("network");

        let task = {
            let monitor = Arc::clone(&monitor);
            let handle = handle.clone();
            tokio::spawn(async move { monitor.watch(Duration::from_millis(5), handle).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watch did not stop")
            .unwrap();

        assert!(probe.calls.load(Ordering::SeqCst) >= 1);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_http_probe_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let base = format!("{}/api", server.uri());
        let timeout = Duration::from_secs(2);

        let healthy = HttpProbe::new(&base, "/health", timeout).unwrap();
        assert_eq!(healthy.url(), format!("{base}/health"));
        assert!(healthy.is_reachable().await);

        // Unmatched paths answer 404, which still proves the server is up.
        let missing = HttpProbe::new(&base, "missing", timeout).unwrap();
        assert!(missing.is_reachable().await);

        let broken = HttpProbe::new(&base, "/broken", timeout).unwrap();
        assert!(!broken.is_reachable().await);
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let probe =
            HttpProbe::new("http://127.0.0.1:9", "/health", Duration::from_millis(500)).unwrap();
        assert!(!probe.is_reachable().await);
    }

    #[tokio::test]
    async fn test_dns_link_signal() {
        let signal = DnsLinkSignal::for_url("http://127.0.0.1:8000/api").unwrap();
        assert!(signal.has_link().await);

        let ipv6 = DnsLinkSignal::for_url("http://[::1]:8000/api").unwrap();
        assert_eq!(ipv6.authority, "[::1]:8000");

        assert!(DnsLinkSignal::for_url("not a url").is_err());
    }
}
