//! Registry-driven channel pools
//!
//! For every named service the gateway calls, a [`ChannelManager`] keeps a
//! pool of gRPC channels to the discovered instances and hands one out per
//! call with health-aware round robin. Pools are reconciled with the
//! registry on a fixed interval, on watch notifications, and on demand when
//! selection comes up empty.
//!
//! Dialing is always lazy: a refresh never waits for a connection to come
//! up, and selection never blocks on a dial. An earlier design that dialed
//! synchronously inside the refresh stalled the whole gateway when one
//! backend hung, so laziness here is a correctness requirement, not a
//! tuning choice.

use highpress::FabricError;
use highpress_registry::{Registry, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tonic::transport::{Channel, Endpoint};

const STATE_IDLE: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_CONNECTING: u8 = 2;
const STATE_TRANSIENT_FAILURE: u8 = 3;
const STATE_SHUTDOWN: u8 = 4;

/// Observed state of one pooled channel.
///
/// tonic does not expose transport connectivity, so state is fed from call
/// outcomes: lazily-dialed channels start `Idle`, move to `Ready` on the
/// first success and to `TransientFailure` when a call reports a transport
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Ready,
    Connecting,
    TransientFailure,
    Shutdown,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_READY => Self::Ready,
            STATE_CONNECTING => Self::Connecting,
            STATE_TRANSIENT_FAILURE => Self::TransientFailure,
            STATE_SHUTDOWN => Self::Shutdown,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => STATE_IDLE,
            Self::Ready => STATE_READY,
            Self::Connecting => STATE_CONNECTING,
            Self::TransientFailure => STATE_TRANSIENT_FAILURE,
            Self::Shutdown => STATE_SHUTDOWN,
        }
    }
}

/// Channel-pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on channels per service.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Delay before the first discovery after `register_service`.
    #[serde(default = "default_grace_delay_ms")]
    pub grace_delay_ms: u64,
    #[serde(default = "default_keepalive_time_ms")]
    pub keepalive_time_ms: u64,
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Channels idle longer than this may be recycled by the transport.
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
}

fn default_pool_size() -> usize {
    16
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_grace_delay_ms() -> u64 {
    200
}

fn default_keepalive_time_ms() -> u64 {
    15_000
}

fn default_keepalive_timeout_ms() -> u64 {
    4_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_max_idle_time_ms() -> u64 {
    300_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            refresh_interval_ms: default_refresh_interval_ms(),
            grace_delay_ms: default_grace_delay_ms(),
            keepalive_time_ms: default_keepalive_time_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
        }
    }
}

/// Errors from channel selection.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("service {0} is not tracked by the channel manager")]
    UnknownService(String),
    #[error("no healthy instances for service {0}")]
    NoHealthyInstances(String),
    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },
}

impl From<PoolError> for FabricError {
    fn from(err: PoolError) -> Self {
        FabricError::network(err.to_string()).with_source(err)
    }
}

#[derive(Clone)]
struct PooledChannel {
    channel: Channel,
    instance: ServiceInstance,
    state: Arc<AtomicU8>,
}

impl PooledChannel {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn is_selectable(&self) -> bool {
        matches!(self.state(), ChannelState::Ready | ChannelState::Idle)
    }
}

/// Introspection snapshot of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub endpoint: String,
    pub instance_id: String,
    pub state: ChannelState,
}

/// Introspection snapshot of one service pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub service: String,
    pub instance_count: usize,
    pub channel_count: usize,
    /// Milliseconds since the last completed refresh; `None` before the
    /// first one.
    pub last_refresh_ms_ago: Option<u64>,
    pub channels: Vec<ChannelSnapshot>,
}

struct ServicePool {
    service: String,
    channels: RwLock<Vec<PooledChannel>>,
    cursor: AtomicUsize,
    last_refresh: std::sync::Mutex<Option<Instant>>,
    nudge: mpsc::Sender<()>,
}

impl ServicePool {
    fn new(service: String, nudge: mpsc::Sender<()>) -> Self {
        Self {
            service,
            channels: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            last_refresh: std::sync::Mutex::new(None),
            nudge,
        }
    }

    /// Ask the refresh task for an immediate reconcile; never waits.
    fn nudge_refresh(&self) {
        let _ = self.nudge.try_send(());
    }

    async fn checkout(&self) -> Result<(Channel, String), PoolError> {
        let channels = self.channels.read().await;
        if channels.is_empty() {
            self.nudge_refresh();
            return Err(PoolError::NoHealthyInstances(self.service.clone()));
        }

        let len = channels.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let candidate = &channels[(start + offset) % len];
            if candidate.is_selectable() {
                return Ok((candidate.channel.clone(), candidate.instance.host_port()));
            }
        }

        // Nothing looks healthy: hand out a channel anyway and let the call
        // surface the failure to the resilience wrapper, while a refresh
        // runs in the background.
        self.nudge_refresh();
        Ok((channels[start].channel.clone(), channels[start].instance.host_port()))
    }

    async fn instances(&self) -> Vec<ServiceInstance> {
        self.channels.read().await.iter().map(|entry| entry.instance.clone()).collect()
    }

    async fn stats(&self) -> PoolStats {
        let channels = self.channels.read().await;
        let last_refresh_ms_ago = self
            .last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed().as_millis() as u64);
        PoolStats {
            service: self.service.clone(),
            instance_count: channels.len(),
            channel_count: channels.len(),
            last_refresh_ms_ago,
            channels: channels
                .iter()
                .map(|entry| ChannelSnapshot {
                    endpoint: entry.instance.host_port(),
                    instance_id: entry.instance.instance_id.clone(),
                    state: entry.state(),
                })
                .collect(),
        }
    }

    async fn report_outcome(&self, host_port: &str, ok: bool) {
        let channels = self.channels.read().await;
        if let Some(entry) = channels.iter().find(|entry| entry.instance.host_port() == host_port)
        {
            if ok {
                entry.set_state(ChannelState::Ready);
            } else if entry.state() != ChannelState::Shutdown {
                entry.set_state(ChannelState::TransientFailure);
                self.nudge_refresh();
            }
        }
    }

    fn mark_refreshed(&self) {
        *self.last_refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(Instant::now());
    }
}

/// Per-service pools of RPC channels, reconciled against the registry.
pub struct ChannelManager {
    registry: Arc<dyn Registry>,
    config: PoolConfig,
    pools: RwLock<HashMap<String, Arc<ServicePool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager").field("config", &self.config).finish()
    }
}

impl ChannelManager {
    pub fn new(registry: Arc<dyn Registry>, config: PoolConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            config,
            pools: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Start tracking a service. Returns immediately; the pool fills in the
    /// background and the target does not need to be up yet.
    pub async fn register_service(&self, name: &str) {
        {
            let pools = self.pools.read().await;
            if pools.contains_key(name) {
                return;
            }
        }

        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        let pool = Arc::new(ServicePool::new(name.to_owned(), nudge_tx));
        {
            let mut pools = self.pools.write().await;
            if pools.contains_key(name) {
                return;
            }
            pools.insert(name.to_owned(), pool.clone());
        }

        let task = tokio::spawn(refresh_loop(
            pool,
            self.registry.clone(),
            self.config.clone(),
            nudge_rx,
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().await.push(task);
        tracing::info!(service = name, "tracking service");
    }

    /// A channel ready for an RPC call. Never waits for a dial.
    pub async fn channel(&self, name: &str) -> Result<Channel, PoolError> {
        Ok(self.checkout(name).await?.0)
    }

    /// Like [`channel`](Self::channel), also returning the backing
    /// instance's `address:port` so the caller can report the call outcome
    /// via [`report_outcome`](Self::report_outcome).
    pub async fn checkout(&self, name: &str) -> Result<(Channel, String), PoolError> {
        let pool = self.pool(name).await?;
        pool.checkout().await
    }

    /// Snapshot of the instances currently backing a pool.
    pub async fn instances(&self, name: &str) -> Result<Vec<ServiceInstance>, PoolError> {
        let pool = self.pool(name).await?;
        Ok(pool.instances().await)
    }

    /// Per-service pool stats for introspection.
    pub async fn stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<ServicePool>> =
            self.pools.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.stats().await);
        }
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Feed an observed call outcome back into channel state.
    pub async fn report_outcome(&self, name: &str, host_port: &str, ok: bool) {
        if let Ok(pool) = self.pool(name).await {
            pool.report_outcome(host_port, ok).await;
        }
    }

    /// Close every pool and stop the refresh tasks.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut pools = self.pools.write().await;
        for pool in pools.values() {
            let channels = pool.channels.read().await;
            for entry in channels.iter() {
                entry.set_state(ChannelState::Shutdown);
            }
        }
        pools.clear();
        tracing::info!("channel manager closed");
    }

    async fn pool(&self, name: &str) -> Result<Arc<ServicePool>, PoolError> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownService(name.to_owned()))
    }
}

async fn refresh_loop(
    pool: Arc<ServicePool>,
    registry: Arc<dyn Registry>,
    config: PoolConfig,
    mut nudge: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::time::sleep(Duration::from_millis(config.grace_delay_ms)).await;

    let mut membership = registry.watch(&pool.service).await.ok();
    if membership.is_none() {
        tracing::warn!(service = %pool.service, "registry watch unavailable, relying on polling");
    }

    let period = Duration::from_millis(config.refresh_interval_ms.max(100));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        refresh(&pool, registry.as_ref(), &config).await;

        tokio::select! {
            _ = ticker.tick() => {}
            _ = nudge.recv() => {}
            changed = wait_for_change(&mut membership) => {
                if !changed {
                    // The watch stream died; try to re-subscribe and keep
                    // polling either way.
                    membership = registry.watch(&pool.service).await.ok();
                }
            }
            _ = shutdown.changed() => {
                return;
            }
        }
    }
}

/// Resolve to `true` on a membership notification, `false` when the watch
/// terminated; pends forever when no watch is attached.
async fn wait_for_change(membership: &mut Option<highpress_registry::MembershipWatch>) -> bool {
    match membership {
        Some(watch) => watch.changed().await.is_some(),
        None => std::future::pending().await,
    }
}

async fn refresh(pool: &ServicePool, registry: &dyn Registry, config: &PoolConfig) {
    let mut discovered = match registry.discover(&pool.service, true).await {
        Ok(instances) => instances,
        Err(e) => {
            tracing::warn!(service = %pool.service, error = %e, "discovery failed, keeping current pool");
            return;
        }
    };
    if discovered.len() > config.size {
        tracing::warn!(
            service = %pool.service,
            discovered = discovered.len(),
            cap = config.size,
            "discovered more instances than the pool cap, truncating"
        );
        discovered.truncate(config.size);
    }

    let next_keys: BTreeSet<String> =
        discovered.iter().map(|instance| instance.host_port()).collect();

    let reusable: HashMap<String, PooledChannel> = {
        let current = pool.channels.read().await;
        let current_keys: BTreeSet<String> =
            current.iter().map(|entry| entry.instance.host_port()).collect();
        if current_keys == next_keys {
            pool.mark_refreshed();
            return;
        }
        current
            .iter()
            .filter(|entry| next_keys.contains(&entry.instance.host_port()))
            .map(|entry| (entry.instance.host_port(), entry.clone()))
            .collect()
    };

    let mut next = Vec::with_capacity(discovered.len());
    let mut dialed = 0usize;
    for instance in discovered {
        let key = instance.host_port();
        match reusable.get(&key) {
            Some(existing) => {
                let mut entry = existing.clone();
                entry.instance = instance;
                next.push(entry);
            }
            None => match dial(&instance, config) {
                Ok(entry) => {
                    dialed += 1;
                    next.push(entry);
                }
                Err(e) => {
                    tracing::warn!(service = %pool.service, endpoint = %key, error = %e, "skipping undialable instance");
                }
            },
        }
    }

    let removed;
    {
        // The write lock covers only the swap.
        let mut guard = pool.channels.write().await;
        let old = std::mem::replace(&mut *guard, next);
        removed = old
            .into_iter()
            .filter(|entry| !next_keys.contains(&entry.instance.host_port()))
            .collect::<Vec<_>>();
    }
    for stale in &removed {
        stale.set_state(ChannelState::Shutdown);
    }
    pool.mark_refreshed();

    tracing::info!(
        service = %pool.service,
        dialed,
        removed = removed.len(),
        "pool refreshed"
    );
}

/// Create the channel without waiting for it to connect.
fn dial(instance: &ServiceInstance, config: &PoolConfig) -> Result<PooledChannel, PoolError> {
    let endpoint = Endpoint::from_shared(instance.endpoint())
        .map_err(|e| PoolError::InvalidEndpoint {
            endpoint: instance.endpoint(),
            message: e.to_string(),
        })?
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .http2_keep_alive_interval(Duration::from_millis(config.keepalive_time_ms))
        .keep_alive_timeout(Duration::from_millis(config.keepalive_timeout_ms))
        .keep_alive_while_idle(true)
        .tcp_nodelay(true);

    Ok(PooledChannel {
        channel: endpoint.connect_lazy(),
        instance: instance.clone(),
        state: Arc::new(AtomicU8::new(STATE_IDLE)),
    })
}
