//! Manager runtime: client, runnables, and leadership gating
//!
//! The [`Manager`] owns the rate-limited cluster client, the schema registry,
//! the cache-backed [`ClusterReader`], and every registered [`Runnable`].
//! `start` runs in two phases: runnables that do not require leadership start
//! immediately, leader-gated runnables start only once the
//! [`LeadershipGate`] grants a tenure and the read caches have synced.
//! Losing leadership is terminal; the process restarts and re-elects rather
//! than limping on with half-stopped controllers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::client::ClientBuilder;
use kube::runtime::reflector::store::Writer;
use kube::{Client, Config};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::limit::RateLimitLayer;
use tracing::{debug, info, warn};

use crate::cache::{self, CachedStore, ClientCachePolicy, ClusterReader};
use crate::config::{ConnectionTuning, LeadershipSettings};
use crate::leadership::{AlwaysLeader, LeadershipGate, LeaseLeadership};
use crate::schema::{GroupKind, SchemaRegistry};
use crate::{Error, Result};

/// How long a graceful drain waits for runnables to honor the shutdown token
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Runnables
// =============================================================================

/// A unit of work owned and supervised by the manager
///
/// The descriptor carries the one scheduling fact the manager needs: whether
/// the work may only run while this process holds leadership. Every runnable
/// must watch the manager's shutdown token and return promptly when it fires.
pub struct Runnable {
    name: String,
    requires_leadership: bool,
    future: BoxFuture<'static, Result<()>>,
}

impl Runnable {
    /// A runnable that starts as soon as the manager does
    pub fn new(
        name: impl Into<String>,
        future: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            requires_leadership: false,
            future: future.boxed(),
        }
    }

    /// A runnable that starts only after leadership is acquired
    pub fn leader_gated(
        name: impl Into<String>,
        future: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            requires_leadership: true,
            future: future.boxed(),
        }
    }

    /// The runnable's name, used in logs and failure reports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this runnable waits for leadership
    pub fn requires_leadership(&self) -> bool {
        self.requires_leadership
    }
}

// =============================================================================
// Manager Construction
// =============================================================================

/// Everything the manager consumes at construction
///
/// The registry and cache policy are injected here and immutable afterwards;
/// nothing can add kinds or change caching behavior on a running manager.
pub struct ManagerOptions {
    /// Namespace the operator works in
    pub namespace: String,
    /// Composed schema registry
    pub registry: SchemaRegistry,
    /// Which kinds bypass the local read cache
    pub cache_policy: ClientCachePolicy,
    /// Kinds to back with a watch-fed local store
    pub cached_kinds: Vec<GroupKind>,
    /// Leader-election settings; `None` disables election
    pub leadership: Option<LeadershipSettings>,
}

/// Owns the client, the reader, and every registered runnable
pub struct Manager {
    client: Client,
    namespace: String,
    registry: Arc<SchemaRegistry>,
    reader: ClusterReader,
    runnables: Vec<Runnable>,
    gate: Arc<dyn LeadershipGate>,
    shutdown: CancellationToken,
    ready: Arc<AtomicBool>,
    started: bool,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("namespace", &self.namespace)
            .field("runnables", &self.runnables.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Construct the manager from a tuned connection config
    ///
    /// Builds the rate-limited client first; any failure here is fatal to
    /// startup.
    pub fn new(
        config: Config,
        tuning: &ConnectionTuning,
        opts: ManagerOptions,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = build_client(config, tuning)?;
        Self::with_client(client, opts, shutdown)
    }

    /// Construct the manager around an existing client
    pub fn with_client(
        client: Client,
        opts: ManagerOptions,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let gate: Arc<dyn LeadershipGate> = match &opts.leadership {
            Some(settings) => Arc::new(LeaseLeadership::new(client.clone(), settings.clone())),
            None => Arc::new(AlwaysLeader),
        };
        Self::with_gate(client, opts, gate, shutdown)
    }

    /// Construct the manager with an explicit leadership gate
    pub fn with_gate(
        client: Client,
        opts: ManagerOptions,
        gate: Arc<dyn LeadershipGate>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(opts.registry);
        let policy = Arc::new(opts.cache_policy);

        let mut stores = BTreeMap::new();
        let mut runnables = Vec::new();
        for kind in &opts.cached_kinds {
            if policy.bypasses(kind) {
                return Err(Error::config(format!(
                    "kind {kind} is cached but the cache policy bypasses it"
                )));
            }
            let entry = registry.resolve(kind).ok_or_else(|| {
                Error::config(format!("cached kind {kind} is not in the schema registry"))
            })?;
            let mut writer = Writer::new(entry.resource.clone());
            stores.insert(
                kind.clone(),
                CachedStore::new(entry.resource.clone(), writer.as_reader()),
            );
            runnables.push(Runnable::new(
                format!("cache-{kind}"),
                cache::run_reflector(
                    client.clone(),
                    entry.resource.clone(),
                    writer,
                    shutdown.clone(),
                ),
            ));
        }

        let reader = ClusterReader::new(client.clone(), policy, stores);
        Ok(Self {
            client,
            namespace: opts.namespace,
            registry,
            reader,
            runnables,
            gate,
            shutdown,
            ready: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// The manager's cluster client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The operator namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The composed schema registry
    pub fn registry(&self) -> Arc<SchemaRegistry> {
        self.registry.clone()
    }

    /// Policy-aware read access shared by all controllers
    pub fn reader(&self) -> ClusterReader {
        self.reader.clone()
    }

    /// Token that stops every runnable when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Flag flipped once leader-only work is running; wired into readiness
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Whether `start` has been called
    pub fn started(&self) -> bool {
        self.started
    }

    /// Number of registered runnables
    pub fn runnable_count(&self) -> usize {
        self.runnables.len()
    }

    /// Register a runnable; rejected once the manager has started
    pub fn register(&mut self, runnable: Runnable) -> Result<()> {
        if self.started {
            return Err(Error::internal(format!(
                "cannot register {:?} on a started manager",
                runnable.name()
            )));
        }
        debug!(
            runnable = %runnable.name(),
            leader_gated = runnable.requires_leadership(),
            "Registered runnable"
        );
        self.runnables.push(runnable);
        Ok(())
    }

    /// Run until shutdown, a terminal runnable failure, or leadership loss
    ///
    /// Blocks for the life of the process. Immediate runnables are spawned
    /// right away; leader-gated ones wait for the gate, then for the read
    /// caches to finish their initial sync.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::internal("manager already started"));
        }
        self.started = true;

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut gated = Vec::new();
        for runnable in self.runnables.drain(..) {
            if runnable.requires_leadership {
                gated.push(runnable);
            } else {
                let Runnable { name, future, .. } = runnable;
                tasks.spawn(async move {
                    let result = future.await;
                    (name, result)
                });
            }
        }
        info!(
            immediate = tasks.len(),
            gated = gated.len(),
            "Manager starting"
        );

        // Phase 1: supervise immediate runnables while waiting for leadership.
        let gate = self.gate.clone();
        let acquire = gate.acquire();
        tokio::pin!(acquire);
        let tenure = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return self.drain(tasks).await,
                tenure = &mut acquire => match tenure {
                    Ok(tenure) => break tenure,
                    Err(e) => return self.abort(tasks, e).await,
                },
                Some(exit) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = runnable_outcome(exit) {
                        return self.abort(tasks, e).await;
                    }
                }
            }
        };

        // Leader-only work must see a synced view of the cached kinds.
        tokio::select! {
            _ = self.shutdown.cancelled() => return self.drain(tasks).await,
            synced = self.reader.wait_ready() => {
                if synced.is_err() {
                    return self.abort(tasks, Error::internal("cache stopped before initial sync")).await;
                }
            }
        }

        let lost = tenure.lost();
        for runnable in gated {
            let Runnable { name, future, .. } = runnable;
            tasks.spawn(async move {
                let result = future.await;
                (name, result)
            });
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("Manager started");

        // Phase 2: supervise everything; the tenure stays in scope so lease
        // renewal keeps running.
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return self.drain(tasks).await,
                _ = lost.cancelled() => return self.abort(tasks, Error::LeadershipLost).await,
                exit = tasks.join_next() => match exit {
                    None => {
                        info!("All runnables completed");
                        self.ready.store(false, Ordering::SeqCst);
                        return Ok(());
                    }
                    Some(exit) => {
                        if let Err(e) = runnable_outcome(exit) {
                            return self.abort(tasks, e).await;
                        }
                    }
                },
            }
        }
    }

    /// Graceful shutdown: let every runnable observe the token and stop
    async fn drain(&mut self, mut tasks: JoinSet<(String, Result<()>)>) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        info!(remaining = tasks.len(), "Manager draining runnables");
        let drain_all = async {
            while let Some(exit) = tasks.join_next().await {
                match exit {
                    Ok((name, Ok(()))) => debug!(runnable = %name, "Runnable stopped"),
                    Ok((name, Err(e))) => {
                        warn!(runnable = %name, error = %e, "Runnable failed during shutdown")
                    }
                    Err(join_err) => warn!(error = %join_err, "Runnable panicked during shutdown"),
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain_all).await.is_err() {
            warn!("Drain timed out, aborting remaining runnables");
            tasks.shutdown().await;
        }
        Ok(())
    }

    /// Terminal failure: stop peers, drain, and surface the error
    async fn abort(&mut self, tasks: JoinSet<(String, Result<()>)>, error: Error) -> Result<()> {
        warn!(error = %error, "Manager stopping on terminal error");
        self.shutdown.cancel();
        self.drain(tasks).await?;
        Err(error)
    }
}

fn runnable_outcome(exit: std::result::Result<(String, Result<()>), JoinError>) -> Result<()> {
    match exit {
        Ok((name, Ok(()))) => {
            info!(runnable = %name, "Runnable completed");
            Ok(())
        }
        Ok((name, Err(e))) => Err(Error::runnable(name, e)),
        Err(join_err) => Err(Error::internal(format!("runnable panicked: {join_err}"))),
    }
}

// =============================================================================
// Client Construction
// =============================================================================

/// Build the rate-limited client from a tuned connection config
fn build_client(config: Config, tuning: &ConnectionTuning) -> Result<Client> {
    let (permits, per) = rate_limit_window(tuning.qps, tuning.burst);
    let builder = ClientBuilder::try_from(config)
        .map_err(|e| Error::manager("building client from connection config", e))?;
    Ok(builder
        .with_layer(&RateLimitLayer::new(permits, per))
        .build())
}

/// Translate qps/burst into a token window
///
/// `burst` permits per `burst / qps` seconds sustains `qps` on average while
/// allowing `burst` back-to-back requests after an idle stretch.
fn rate_limit_window(qps: f32, burst: u32) -> (u64, Duration) {
    (u64::from(burst), Duration::from_secs_f32(burst as f32 / qps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leadership::NeverLeader;
    use std::convert::Infallible;

    fn offline_client() -> Client {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            let response = http::Response::builder()
                .status(404)
                .body(kube::client::Body::from(Vec::new()))
                .unwrap();
            Ok::<_, Infallible>(response)
        });
        Client::new(service, "default")
    }

    fn bare_options() -> ManagerOptions {
        ManagerOptions {
            namespace: "zonelet-system".to_string(),
            registry: SchemaRegistry::default(),
            cache_policy: ClientCachePolicy::standard(),
            cached_kinds: vec![],
            leadership: None,
        }
    }

    fn manager_with_gate(gate: Arc<dyn LeadershipGate>, shutdown: CancellationToken) -> Manager {
        Manager::with_gate(offline_client(), bare_options(), gate, shutdown).unwrap()
    }

    #[test]
    fn rate_limit_window_sustains_qps_with_burst_headroom() {
        let (permits, per) = rate_limit_window(100.0, 130);
        assert_eq!(permits, 130);
        assert!((per.as_secs_f32() - 1.3).abs() < 1e-4);

        let (permits, per) = rate_limit_window(50.0, 50);
        assert_eq!(permits, 50);
        assert_eq!(per, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cached_kind_must_be_in_the_registry() {
        let mut opts = bare_options();
        opts.cached_kinds = vec![GroupKind::new("extensions.arbor.dev", "Cluster")];
        let err = Manager::with_client(offline_client(), opts, CancellationToken::new())
            .expect_err("empty registry cannot back a cached kind");
        assert!(err.to_string().contains("not in the schema registry"));
    }

    #[tokio::test]
    async fn cached_kind_must_not_be_bypassed_by_policy() {
        let mut opts = bare_options();
        opts.registry = crate::schema::compose().unwrap();
        opts.cached_kinds = vec![GroupKind::new("", "Secret")];
        let err = Manager::with_client(offline_client(), opts, CancellationToken::new())
            .expect_err("bypassed kinds cannot also be cached");
        assert!(err.to_string().contains("bypasses"));
    }

    #[tokio::test]
    async fn registration_is_rejected_after_start() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut mgr = manager_with_gate(Arc::new(AlwaysLeader), shutdown);
        assert!(!mgr.started());
        mgr.start().await.unwrap();
        assert!(mgr.started());

        let err = mgr
            .register(Runnable::new("late", async { Ok(()) }))
            .expect_err("registration after start must fail");
        assert!(err.to_string().contains("started manager"));
    }

    #[tokio::test]
    async fn leader_gated_runnables_never_run_without_leadership() {
        let shutdown = CancellationToken::new();
        let mut mgr = manager_with_gate(Arc::new(NeverLeader), shutdown.clone());

        let immediate_ran = Arc::new(AtomicBool::new(false));
        let gated_ran = Arc::new(AtomicBool::new(false));

        let flag = immediate_ran.clone();
        let token = shutdown.clone();
        mgr.register(Runnable::new("immediate", async move {
            flag.store(true, Ordering::SeqCst);
            token.cancelled().await;
            Ok(())
        }))
        .unwrap();

        let flag = gated_ran.clone();
        mgr.register(Runnable::leader_gated("gated", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        let ready = mgr.ready_flag();
        let handle = tokio::spawn(async move { mgr.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(immediate_ran.load(Ordering::SeqCst), "immediate runnable started");
        assert!(!gated_ran.load(Ordering::SeqCst), "gated runnable must wait");
        assert!(!ready.load(Ordering::SeqCst), "not ready without leadership");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(
            !gated_ran.load(Ordering::SeqCst),
            "gated runnable must never start when leadership is never granted"
        );
    }

    #[tokio::test]
    async fn ready_flips_once_leadership_is_granted() {
        let shutdown = CancellationToken::new();
        let mut mgr = manager_with_gate(Arc::new(AlwaysLeader), shutdown.clone());

        let gated_ran = Arc::new(AtomicBool::new(false));
        let flag = gated_ran.clone();
        let token = shutdown.clone();
        mgr.register(Runnable::leader_gated("gated", async move {
            flag.store(true, Ordering::SeqCst);
            token.cancelled().await;
            Ok(())
        }))
        .unwrap();

        let ready = mgr.ready_flag();
        assert!(!ready.load(Ordering::SeqCst));
        let handle = tokio::spawn(async move { mgr.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(ready.load(Ordering::SeqCst), "ready after leadership");
        assert!(gated_ran.load(Ordering::SeqCst), "gated runnable started");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(!ready.load(Ordering::SeqCst), "ready drops on shutdown");
    }

    #[tokio::test]
    async fn a_failing_runnable_stops_the_manager_and_its_peers() {
        let shutdown = CancellationToken::new();
        let mut mgr = manager_with_gate(Arc::new(AlwaysLeader), shutdown.clone());

        let peer_stopped = Arc::new(AtomicBool::new(false));
        let flag = peer_stopped.clone();
        let token = shutdown.clone();
        mgr.register(Runnable::new("peer", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        mgr.register(Runnable::leader_gated("doomed", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(Error::internal("boom"))
        }))
        .unwrap();

        let err = mgr.start().await.expect_err("manager must surface the failure");
        match &err {
            Error::Runnable { name, .. } => assert_eq!(name, "doomed"),
            other => panic!("expected Runnable error, got {other:?}"),
        }
        assert!(
            peer_stopped.load(Ordering::SeqCst),
            "peers observe the shutdown token before the manager returns"
        );
    }
}
