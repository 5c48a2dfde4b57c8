use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::endpoint::{ConnectOutcome, DisconnectOutcome, Tunnel, TunnelEndpoint};
use super::http_relay::LocalHttp;
use super::policy::ReconnectPolicy;
use crate::config::TunnelConfig;
use crate::protocol::ClientId;

#[derive(Default)]
struct ReconnectState {
    attempts: u32,
    last_attempt_at: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

impl ReconnectState {
    fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

struct Entry {
    tunnel: Arc<dyn Tunnel>,
    reconnect: ReconnectState,
}

struct Inner {
    node_id: RwLock<String>,
    policy: ReconnectPolicy,
    liveness_interval: Duration,
    entries: Mutex<BTreeMap<String, Entry>>,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the tunnel endpoints and keeps them connected.
///
/// Reconnection is paced by one [`ReconnectPolicy`]: attempts on the same
/// endpoint are spaced by at least the cooldown (and the backoff delay), and
/// stop after the attempt cap until the next [`connect_all`].
///
/// [`connect_all`]: TunnelSupervisor::connect_all
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    pub fn new(node_id: &str, policy: ReconnectPolicy, liveness_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id: RwLock::new(node_id.to_string()),
                policy,
                liveness_interval,
                entries: Mutex::new(BTreeMap::new()),
                liveness: Mutex::new(None),
            }),
        }
    }

    /// Node id used for subsequent connects. Open tunnels keep their session.
    pub fn set_node_id(&self, node_id: &str) {
        let mut current = self
            .inner
            .node_id
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *current != node_id {
            info!("Tunnels will connect as node {}", node_id);
            *current = node_id.to_string();
        }
    }

    /// Track the client id the primary channel adopts from the server
    pub fn follow_node_id(&self, mut ids: watch::Receiver<Option<ClientId>>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while ids.changed().await.is_ok() {
                let id = ids.borrow_and_update().clone();
                if let Some(id) = id {
                    supervisor.set_node_id(id.as_str());
                }
            }
        })
    }

    /// Build and register an endpoint for `config`. Duplicate names are ignored.
    pub fn add_endpoint(&self, config: TunnelConfig, local: Arc<dyn LocalHttp>) -> bool {
        if self.inner.entries().contains_key(&config.name) {
            warn!(tunnel = %config.name, "Tunnel already registered, ignoring");
            return false;
        }
        let endpoint = TunnelEndpoint::new(config, local, self.inner.policy.connect_timeout);
        self.add_tunnel(endpoint)
    }

    pub fn add_tunnel(&self, tunnel: Arc<dyn Tunnel>) -> bool {
        let mut entries = self.inner.entries();
        let name = tunnel.name().to_string();
        if entries.contains_key(&name) {
            warn!(tunnel = %name, "Tunnel already registered, ignoring");
            return false;
        }
        debug!(tunnel = %name, "Registered tunnel");
        entries.insert(
            name,
            Entry {
                tunnel,
                reconnect: ReconnectState::default(),
            },
        );
        true
    }

    /// Connect every endpoint. Failures schedule a reconnect for that endpoint
    /// only. Starts the liveness loop.
    pub async fn connect_all(&self) {
        let tunnels: Vec<Arc<dyn Tunnel>> = {
            let mut entries = self.inner.entries();
            entries
                .values_mut()
                .map(|entry| {
                    entry.reconnect.cancel();
                    entry.reconnect.attempts = 0;
                    entry.tunnel.clone()
                })
                .collect()
        };

        let node_id = self.inner.node_id();
        for tunnel in tunnels {
            match tunnel.connect(&node_id).await {
                ConnectOutcome::Connected => info!(tunnel = %tunnel.name(), "Tunnel connected"),
                ConnectOutcome::AlreadyConnected => {}
                ConnectOutcome::Error(e) => {
                    warn!(tunnel = %tunnel.name(), "Tunnel connect failed: {}", e);
                    self.reconnect_proxy(tunnel.name());
                }
            }
        }

        self.start_liveness();
    }

    /// Schedule a supervised reconnect of `name`, honouring cooldown and cap.
    /// Returns whether an attempt was scheduled.
    pub fn reconnect_proxy(&self, name: &str) -> bool {
        self.inner.schedule_reconnect(name)
    }

    fn start_liveness(&self) {
        let mut liveness = self.inner.liveness_handle();
        if liveness.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let supervisor = self.clone();
        *liveness = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.inner.liveness_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let down: Vec<String> = supervisor
                    .inner
                    .entries()
                    .iter()
                    .filter(|(_, entry)| !entry.tunnel.is_connected())
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in down {
                    debug!(tunnel = %name, "Liveness check: not connected");
                    supervisor.reconnect_proxy(&name);
                }
            }
        }));
    }

    /// Stop the liveness loop and pending reconnects, then disconnect every
    /// endpoint. Individual failures are logged and do not stop the shutdown.
    pub async fn disconnect_all(&self) {
        let liveness = self.inner.liveness_handle().take();
        if let Some(liveness) = liveness {
            liveness.abort();
        }

        let tunnels: Vec<Arc<dyn Tunnel>> = {
            let mut entries = self.inner.entries();
            entries
                .values_mut()
                .map(|entry| {
                    entry.reconnect.cancel();
                    entry.tunnel.clone()
                })
                .collect()
        };

        for tunnel in tunnels {
            match tunnel.disconnect().await {
                DisconnectOutcome::Disconnected => info!(
                    tunnel = %tunnel.name(),
                    "Tunnel disconnected",
                ),
                DisconnectOutcome::AlreadyDisconnected => {}
                DisconnectOutcome::Error(e) => {
                    warn!(tunnel = %tunnel.name(), "Tunnel disconnect failed: {}", e)
                }
            }
        }
    }

    /// Name and connection status of every endpoint
    pub fn status(&self) -> Vec<(String, bool)> {
        self.inner
            .entries()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.tunnel.is_connected()))
            .collect()
    }

    #[cfg(test)]
    fn attempts(&self, name: &str) -> Option<u32> {
        self.inner
            .entries()
            .get(name)
            .map(|entry| entry.reconnect.attempts)
    }
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn liveness_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.liveness.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn node_id(&self) -> String {
        self.node_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn schedule_reconnect(self: &Arc<Self>, name: &str) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };
        let state = &mut entry.reconnect;

        if state.is_pending() {
            return false;
        }
        if state.attempts >= self.policy.max_attempts {
            debug!(
                tunnel = %name,
                "Reconnect cap of {} reached, waiting for connect_all",
                self.policy.max_attempts,
            );
            return false;
        }

        state.attempts += 1;
        let cooldown_left = state
            .last_attempt_at
            .map(|at| self.policy.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        let delay = cooldown_left.max(self.policy.backoff(state.attempts));

        info!(
            tunnel = %name,
            "Reconnect attempt {}/{} in {:?}",
            state.attempts,
            self.policy.max_attempts,
            delay,
        );

        let inner = self.clone();
        let tunnel = entry.tunnel.clone();
        let name = name.to_string();
        // The entry lock is held until the handle is stored, so the task
        // cannot clear `pending` before it is set.
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.attempt(&name, tunnel).await;
        }));
        true
    }

    async fn attempt(self: &Arc<Self>, name: &str, tunnel: Arc<dyn Tunnel>) {
        {
            let mut entries = self.entries();
            if let Some(entry) = entries.get_mut(name) {
                entry.reconnect.last_attempt_at = Some(Instant::now());
            }
        }

        if let DisconnectOutcome::Error(e) = tunnel.disconnect().await {
            debug!(tunnel = %name, "Disconnect before reconnect failed: {}", e);
        }
        let outcome = tunnel.connect(&self.node_id()).await;

        let succeeded = matches!(
            outcome,
            ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected
        );
        {
            let mut entries = self.entries();
            if let Some(entry) = entries.get_mut(name) {
                entry.reconnect.pending = None;
                if succeeded {
                    entry.reconnect.attempts = 0;
                }
            }
        }

        match outcome {
            ConnectOutcome::Error(e) => {
                warn!(tunnel = %name, "Reconnect failed: {}", e);
                self.schedule_reconnect(name);
            }
            _ => info!(tunnel = %name, "Reconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTunnel {
        name: String,
        failures_left: AtomicUsize,
        connected: AtomicBool,
        disconnect_fails: bool,
        connects: Mutex<Vec<Instant>>,
        node_ids: Mutex<Vec<String>>,
    }

    impl FakeTunnel {
        fn new(name: &str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failures_left: AtomicUsize::new(failures),
                connected: AtomicBool::new(false),
                disconnect_fails: false,
                connects: Mutex::new(Vec::new()),
                node_ids: Mutex::new(Vec::new()),
            })
        }

        fn always_failing(name: &str) -> Arc<Self> {
            Self::new(name, usize::MAX)
        }

        fn connects(&self) -> Vec<Instant> {
            self.connects.lock().unwrap().clone()
        }

        fn drop_connection(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self, node_id: &str) -> ConnectOutcome {
            self.connects.lock().unwrap().push(Instant::now());
            self.node_ids.lock().unwrap().push(node_id.to_string());
            if self.connected.load(Ordering::SeqCst) {
                return ConnectOutcome::AlreadyConnected;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                if left != usize::MAX {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                }
                return ConnectOutcome::Error("refused".to_string());
            }
            self.connected.store(true, Ordering::SeqCst);
            ConnectOutcome::Connected
        }

        async fn disconnect(&self) -> DisconnectOutcome {
            if self.disconnect_fails {
                return DisconnectOutcome::Error("socket wedged".to_string());
            }
            if self.connected.swap(false, Ordering::SeqCst) {
                DisconnectOutcome::Disconnected
            } else {
                DisconnectOutcome::AlreadyDisconnected
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn supervisor() -> TunnelSupervisor {
        TunnelSupervisor::new("node-1", ReconnectPolicy::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let sup = supervisor();
        assert!(sup.add_tunnel(FakeTunnel::new("cdp-proxy", 0)));
        assert!(!sup.add_tunnel(FakeTunnel::new("cdp-proxy", 0)));
        assert_eq!(sup.status().len(), 1);
    }

    #[tokio::test]
    async fn test_adopted_client_id_used_for_next_connect() {
        let sup = supervisor();
        let tunnel = FakeTunnel::new("cdp-proxy", 0);
        sup.add_tunnel(tunnel.clone());

        let (ids, rx) = watch::channel(Some(ClientId::from("node-1".to_string())));
        let follower = sup.follow_node_id(rx);
        ids.send_replace(Some(ClientId::from("node-9".to_string())));
        tokio::time::sleep(Duration::from_millis(50)).await;

        sup.connect_all().await;
        assert_eq!(*tunnel.node_ids.lock().unwrap(), vec!["node-9".to_string()]);

        drop(ids);
        follower.await.unwrap();
        sup.disconnect_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cap_and_cooldown() {
        let sup = supervisor();
        let tunnel = FakeTunnel::always_failing("vnc-proxy");
        sup.add_tunnel(tunnel.clone());

        sup.connect_all().await;
        tokio::time::sleep(Duration::from_secs(1000)).await;

        // One initial connect plus the ten supervised attempts
        let connects = tunnel.connects();
        assert_eq!(connects.len(), 11);
        for pair in connects[1..].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(30));
        }
        assert_eq!(sup.attempts("vnc-proxy"), Some(10));
        assert!(!sup.reconnect_proxy("vnc-proxy"));

        // Liveness keeps running but the cap holds.
        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(tunnel.connects().len(), 11);

        // connect_all resets the budget.
        sup.connect_all().await;
        assert_eq!(tunnel.connects().len(), 12);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(tunnel.connects().len() > 12);

        sup.disconnect_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let sup = supervisor();
        let tunnel = FakeTunnel::new("cdp-proxy", 3);
        sup.add_tunnel(tunnel.clone());

        sup.connect_all().await;
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(tunnel.is_connected());
        assert_eq!(tunnel.connects().len(), 4);
        assert_eq!(sup.attempts("cdp-proxy"), Some(0));

        // A later drop is noticed by the liveness loop.
        tunnel.drop_connection();
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(tunnel.is_connected());
        assert_eq!(tunnel.connects().len(), 5);

        sup.disconnect_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_isolates_failures() {
        let sup = supervisor();
        let good = FakeTunnel::new("node-server", 0);
        let bad = FakeTunnel::always_failing("cdp-proxy");
        sup.add_tunnel(bad.clone());
        sup.add_tunnel(good.clone());

        sup.connect_all().await;

        assert!(good.is_connected());
        assert_eq!(sup.attempts("cdp-proxy"), Some(1));
        assert_eq!(sup.attempts("node-server"), Some(0));
        assert_eq!(
            sup.status(),
            vec![
                ("cdp-proxy".to_string(), false),
                ("node-server".to_string(), true)
            ]
        );

        sup.disconnect_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_cancels_timers_and_swallows_errors() {
        let sup = supervisor();
        let failing = FakeTunnel::always_failing("vnc-proxy");
        let wedged = Arc::new(FakeTunnel {
            name: "node-server".to_string(),
            failures_left: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            disconnect_fails: true,
            connects: Mutex::new(Vec::new()),
            node_ids: Mutex::new(Vec::new()),
        });
        sup.add_tunnel(failing.clone());
        sup.add_tunnel(wedged.clone());

        sup.connect_all().await;
        assert_eq!(failing.connects().len(), 1);

        sup.disconnect_all().await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(failing.connects().len(), 1);
        assert_eq!(wedged.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_unknown_name() {
        let sup = supervisor();
        assert!(!sup.reconnect_proxy("missing"));
    }
}
