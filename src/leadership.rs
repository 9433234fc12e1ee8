//! Leader election using Kubernetes Leases
//!
//! Leadership is expressed as a [`LeadershipGate`]: the manager asks the gate
//! for a [`Tenure`] and only then starts the runnables that require
//! leadership. The production gate ([`LeaseLeadership`]) claims a
//! coordination.k8s.io/v1 Lease; [`AlwaysLeader`] grants immediately when
//! election is disabled.
//!
//! # Atomicity
//!
//! Lease updates use resourceVersion for compare-and-swap semantics. If the
//! lease changes between read and write, the replace fails with 409 Conflict
//! and the claim attempt reports "not leader" instead of clobbering the other
//! holder.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeadershipSettings;
use crate::{Error, Result};

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A granted leadership tenure
///
/// Holds the renewal task alive; dropping the tenure stops renewal. The
/// `lost` token fires if renewal fails or the lease is taken over, at which
/// point leader-only work must stop.
pub struct Tenure {
    lost: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl Tenure {
    /// A tenure that is never lost and needs no renewal
    pub fn perpetual() -> Self {
        Self {
            lost: CancellationToken::new(),
            renewal: None,
        }
    }

    /// A tenure backed by a renewal task; `lost` fires when renewal fails
    pub fn with_renewal(lost: CancellationToken, renewal: JoinHandle<()>) -> Self {
        Self {
            lost,
            renewal: Some(renewal),
        }
    }

    /// Token that fires when leadership is lost
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }
}

impl Drop for Tenure {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

/// Grants leadership tenures
///
/// `acquire` blocks until this process is the leader. Every acquisition is a
/// fresh tenure: work scoped to "once per leadership acquisition" keys off
/// one `acquire` call returning.
#[async_trait]
pub trait LeadershipGate: Send + Sync {
    /// Block until leadership is held, then return the tenure
    async fn acquire(&self) -> Result<Tenure>;
}

/// Gate used when leader election is disabled: every caller is the leader
pub struct AlwaysLeader;

#[async_trait]
impl LeadershipGate for AlwaysLeader {
    async fn acquire(&self) -> Result<Tenure> {
        Ok(Tenure::perpetual())
    }
}

/// Gate that never grants leadership; for exercising gating in tests
#[cfg(test)]
pub struct NeverLeader;

#[cfg(test)]
#[async_trait]
impl LeadershipGate for NeverLeader {
    async fn acquire(&self) -> Result<Tenure> {
        std::future::pending().await
    }
}

// =============================================================================
// Lease-Based Leadership
// =============================================================================

/// Lease-based leader election
///
/// Only one process holds the lease at a time. The holder renews it on a
/// fixed interval; a holder that stops renewing is taken over after the lease
/// duration elapses.
#[derive(Clone)]
pub struct LeaseLeadership {
    client: Client,
    settings: LeadershipSettings,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaseLeadership {
    /// Create a gate with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, settings: LeadershipSettings) -> Self {
        Self {
            client,
            settings,
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    /// The lease this process wants to hold, stamped at `now`
    fn desired_lease(
        &self,
        now: DateTime<Utc>,
        resource_version: Option<String>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.settings.lease_name.clone()),
                namespace: Some(self.settings.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.settings.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// One claim attempt: create, renew, or take over the lease atomically
    ///
    /// `Ok(false)` means another holder has it (or won a race); both are
    /// normal answers, not errors.
    async fn try_claim(&self) -> Result<bool> {
        let api = self.api();
        let now = Utc::now();

        let existing = match api.get(&self.settings.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let Some(lease) = existing else {
            // No lease yet: create it. A 409 means someone beat us to it.
            return match api
                .create(&PostParams::default(), &self.desired_lease(now, None, 0))
                .await
            {
                Ok(_) => {
                    info!(identity = %self.settings.identity, "Created leader lease");
                    Ok(true)
                }
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        let resource_version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| Error::internal("lease missing resourceVersion"))?;

        if holder == Some(self.settings.identity.as_str()) {
            // We hold it: renew in place, keeping the transition count.
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            return self
                .replace_lease(&api, now, resource_version, transitions)
                .await;
        }

        if lease_expired(spec, now) {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            return self
                .replace_lease(&api, now, resource_version, transitions + 1)
                .await;
        }

        Ok(false)
    }

    /// Atomic lease replace; 409 means the CAS lost and we are not leader
    async fn replace_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
        resource_version: String,
        transitions: i32,
    ) -> Result<bool> {
        let desired = self.desired_lease(now, Some(resource_version), transitions);
        match api
            .replace(&self.settings.lease_name, &PostParams::default(), &desired)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.settings.identity, "Lease replace conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew until renewal fails, then fire the lost token
    async fn renewal_loop(self, lost: CancellationToken) {
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.try_claim().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.settings.identity, "Leadership lost to another holder");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.settings.identity, error = %e, "Lease renewal failed");
                    lost.cancel();
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl LeadershipGate for LeaseLeadership {
    async fn acquire(&self) -> Result<Tenure> {
        info!(
            identity = %self.settings.identity,
            lease = %self.settings.lease_name,
            namespace = %self.settings.namespace,
            "Waiting for leadership"
        );
        loop {
            match self.try_claim().await {
                Ok(true) => {
                    info!(identity = %self.settings.identity, "Leadership acquired");
                    let lost = CancellationToken::new();
                    let renewal = tokio::spawn(self.clone().renewal_loop(lost.clone()));
                    return Ok(Tenure::with_renewal(lost, renewal));
                }
                Ok(false) => {
                    debug!(identity = %self.settings.identity, "Lease held by another, waiting");
                }
                Err(e) => {
                    // Transient claim errors must not stop the candidate.
                    warn!(identity = %self.settings.identity, error = %e, "Lease claim failed, retrying");
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// Whether the lease is past its renewal deadline at `now`
///
/// A lease without a renew time or duration is treated as expired: a malformed
/// lease must not block election forever.
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other-holder".to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn freshly_renewed_lease_is_not_expired() {
        assert!(!lease_expired(Some(&spec(1, 30)), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_expired(Some(&spec(31, 30)), Utc::now()));
    }

    #[test]
    fn malformed_lease_counts_as_expired() {
        assert!(lease_expired(None, Utc::now()));
        assert!(lease_expired(Some(&LeaseSpec::default()), Utc::now()));
    }

    #[tokio::test]
    async fn desired_lease_carries_identity_and_transitions() {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(
                http::Response::builder()
                    .status(404)
                    .body(kube::client::Body::from(Vec::new()))
                    .unwrap(),
            )
        });
        let gate = LeaseLeadership::new(
            Client::new(service, "default"),
            LeadershipSettings {
                lease_name: "zonelet-operator-leader".to_string(),
                namespace: "zonelet-system".to_string(),
                identity: "zonelet-0".to_string(),
            },
        );

        let now = Utc::now();
        let lease = gate.desired_lease(now, Some("42".to_string()), 3);
        assert_eq!(lease.metadata.resource_version.as_deref(), Some("42"));
        let spec = lease.spec.expect("spec set");
        assert_eq!(spec.holder_identity.as_deref(), Some("zonelet-0"));
        assert_eq!(spec.lease_transitions, Some(3));
        assert_eq!(spec.lease_duration_seconds, Some(30));
        assert_eq!(spec.acquire_time, Some(MicroTime(now)));
        assert_eq!(spec.renew_time, Some(MicroTime(now)));
    }

    #[tokio::test]
    async fn always_leader_grants_immediately() {
        let tenure = AlwaysLeader.acquire().await.unwrap();
        assert!(!tenure.lost().is_cancelled());
    }

    #[tokio::test]
    async fn never_leader_blocks_forever() {
        let acquired =
            tokio::time::timeout(Duration::from_millis(20), NeverLeader.acquire()).await;
        assert!(acquired.is_err(), "NeverLeader must not grant a tenure");
    }

    #[tokio::test]
    async fn dropping_a_tenure_stops_its_renewal_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let renewal = tokio::spawn(async move {
            let _keep_alive = tx;
            std::future::pending::<()>().await
        });
        let tenure = Tenure::with_renewal(CancellationToken::new(), renewal);
        drop(tenure);
        assert!(rx.await.is_err(), "renewal task must be aborted on drop");
    }
}
