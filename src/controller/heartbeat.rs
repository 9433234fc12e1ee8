//! Heartbeat controller: renews the extension liveness lease
//!
//! The platform watches a Lease per extension controller to tell a live
//! operator from a wedged one. While this process leads, the lease is
//! re-applied on a fixed interval; a failed renewal is logged and retried on
//! the next tick rather than treated as fatal.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::controller::HEARTBEAT_CONTROLLER;
use crate::manager::{Manager, Runnable};
use crate::{Result, FIELD_MANAGER, HEARTBEAT_LEASE_NAME};

/// Build the heartbeat controller as a leader-gated runnable
pub fn runnable(mgr: &Manager, config: HeartbeatConfig, identity: String) -> Result<Runnable> {
    Ok(Runnable::leader_gated(
        HEARTBEAT_CONTROLLER,
        run(
            mgr.client(),
            mgr.namespace().to_string(),
            identity,
            config,
            mgr.shutdown_token(),
        ),
    ))
}

async fn run(
    client: Client,
    namespace: String,
    identity: String,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let api: Api<Lease> = Api::namespaced(client, &namespace);
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let mut ticker = tokio::time::interval(config.renew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        lease = HEARTBEAT_LEASE_NAME,
        namespace = %namespace,
        interval_secs = config.renew_interval.as_secs(),
        "Heartbeat started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Heartbeat stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                let lease = heartbeat_lease(&namespace, &identity, Utc::now());
                match api.patch(HEARTBEAT_LEASE_NAME, &params, &Patch::Apply(&lease)).await {
                    Ok(_) => debug!("Heartbeat lease renewed"),
                    Err(e) => warn!(error = %e, "Failed to renew heartbeat lease"),
                }
            }
        }
    }
}

/// The heartbeat lease as of `now`
fn heartbeat_lease(namespace: &str, identity: &str, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(HEARTBEAT_LEASE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn heartbeat_lease_stamps_holder_and_renew_time() {
        let now = Utc::now();
        let lease = heartbeat_lease("cluster--dev--one", "zonelet-0", now);
        assert_eq!(lease.metadata.name.as_deref(), Some(HEARTBEAT_LEASE_NAME));
        assert_eq!(lease.metadata.namespace.as_deref(), Some("cluster--dev--one"));
        let spec = lease.spec.expect("spec");
        assert_eq!(spec.holder_identity.as_deref(), Some("zonelet-0"));
        assert_eq!(spec.renew_time, Some(MicroTime(now)));
    }

    #[tokio::test]
    async fn renewal_keeps_ticking_through_api_failures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = http::Response::builder()
                    .status(500)
                    .body(kube::client::Body::from(Vec::new()))
                    .unwrap();
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            Client::new(service, "default"),
            "zonelet-system".to_string(),
            "zonelet-0".to_string(),
            HeartbeatConfig {
                renew_interval: Duration::from_millis(5),
            },
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert!(
            hits.load(Ordering::SeqCst) >= 2,
            "renewals must continue after failed attempts"
        );
    }
}
