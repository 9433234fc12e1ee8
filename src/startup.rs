//! Startup orchestration
//!
//! The path from parsed options to a running manager is a fixed sequence:
//! tune the cluster connection, compose the schema registry, build the
//! manager options, construct the manager, install owned resource
//! definitions, configure and register the controllers, register the
//! auxiliary runnables, and block on the manager. Every stage must fully
//! succeed before the next begins; a failure anywhere surfaces as the
//! process exit status. There is no partially-started mode.

use kube::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::ClientCachePolicy;
use crate::config::{CompletedOptions, ConnectionTuning};
use crate::controller::ControllerSwitches;
use crate::crd::Cluster;
use crate::manager::{Manager, ManagerOptions};
use crate::schema::{self, GroupKind};
use crate::{cleanup, probes, Error, Result};

/// Apply connection tuning to the cluster config
///
/// Runs before the manager is constructed so that every client the manager
/// hands out carries the timeouts. The request-rate half of the tuning is
/// layered onto the client itself during manager construction.
pub fn tune_connection(mut config: Config, tuning: &ConnectionTuning) -> Config {
    config.connect_timeout = Some(tuning.connect_timeout);
    config.read_timeout = Some(tuning.read_timeout);
    config
}

/// Run the operator until shutdown or failure
pub async fn run(opts: CompletedOptions, shutdown: CancellationToken) -> Result<()> {
    let config = Config::infer()
        .await
        .map_err(|e| Error::config(format!("inferring cluster connection: {e}")))?;
    let config = tune_connection(config, &opts.connection);

    let registry = schema::compose()?;
    info!(kinds = registry.len(), "Schema registry composed");

    let options = ManagerOptions {
        namespace: opts.namespace.clone(),
        registry,
        cache_policy: ClientCachePolicy::standard(),
        // The platform's Cluster object is read on every lifecycle
        // reconcile; serve it from a local cache.
        cached_kinds: vec![GroupKind::of::<Cluster>()],
        leadership: opts.leadership.clone(),
    };
    let mut manager = Manager::new(config, &opts.connection, options, shutdown)?;

    schema::ensure_crds(&manager.client()).await?;

    let switches = ControllerSwitches::defaults(&opts);
    switches.add_to_manager(&mut manager)?;

    manager.register(cleanup::runnable(manager.client()))?;
    manager.register(probes::runnable(
        opts.probe_addr,
        manager.ready_flag(),
        manager.shutdown_token(),
    ))?;

    info!(
        namespace = %opts.namespace,
        identity = %opts.identity,
        leader_election = opts.leadership.is_some(),
        runnables = manager.runnable_count(),
        "Starting the manager",
    );
    manager.start().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leadership::AlwaysLeader;
    use std::sync::Arc;
    use std::time::Duration;

    /// Timeouts land on the connection config, replacing the library
    /// defaults, before any client exists
    #[test]
    fn tuning_is_applied_to_the_connection_config() {
        let tuning = crate::config::tests::base_options()
            .complete()
            .unwrap()
            .connection;
        let base = Config::new("http://127.0.0.1:8080".parse().unwrap());
        let untuned = (base.connect_timeout, base.read_timeout);

        let tuned = tune_connection(base, &tuning);
        assert_eq!(tuned.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(tuned.read_timeout, Some(Duration::from_secs(30)));
        assert_ne!(
            (tuned.connect_timeout, tuned.read_timeout),
            untuned,
            "tuning must override the library defaults"
        );
    }

    /// The kinds this module asks the manager to cache are resolvable in the
    /// composed registry and not bypassed by the standard policy, so manager
    /// construction can never reject the startup wiring
    #[tokio::test]
    async fn story_startup_wiring_validates_against_the_composed_registry() {
        let registry = schema::compose().unwrap();
        let options = ManagerOptions {
            namespace: "zonelet-system".to_string(),
            registry,
            cache_policy: ClientCachePolicy::standard(),
            cached_kinds: vec![GroupKind::of::<Cluster>()],
            leadership: None,
        };

        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            let response = http::Response::builder()
                .status(404)
                .body(kube::client::Body::from(Vec::new()))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        });
        let manager = Manager::with_gate(
            kube::Client::new(service, "default"),
            options,
            Arc::new(AlwaysLeader),
            CancellationToken::new(),
        )
        .unwrap();

        // One runnable: the Cluster cache pump.
        assert_eq!(manager.runnable_count(), 1);
    }
}
