//! Healthcheck controller: mirrors component availability into extension status
//!
//! On every sync period the controller reads the zone-manager Deployment and
//! translates its `Available` condition into a `Healthy` condition on the
//! extension, so platform tooling can judge the DNS service without knowing
//! how it is deployed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{debug, error};

use crate::cache::ClusterReader;
use crate::config::HealthCheckConfig;
use crate::controller::{log_reconcile_result, patch_extension_status, HEALTHCHECK_CONTROLLER};
use crate::crd::{Extension, ExtensionCondition, ExtensionStatus};
use crate::manager::{Manager, Runnable};
use crate::{Error, Result, COMPONENT_NAME, WATCH_TIMEOUT_SECS};

/// Condition type written onto extensions
const HEALTHY_CONDITION: &str = "Healthy";

pub(crate) struct Context {
    client: Client,
    reader: ClusterReader,
    config: HealthCheckConfig,
}

/// Build the healthcheck controller as a leader-gated runnable
pub fn runnable(mgr: &Manager, config: HealthCheckConfig) -> Result<Runnable> {
    let client = mgr.client();
    let extensions: Api<Extension> = Api::all(client.clone());
    let ctx = Arc::new(Context {
        client,
        reader: mgr.reader(),
        config: config.clone(),
    });
    let controller = Controller::new(
        extensions,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(config.max_concurrent))
    .graceful_shutdown_on(mgr.shutdown_token().cancelled_owned())
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result(HEALTHCHECK_CONTROLLER));

    Ok(Runnable::leader_gated(HEALTHCHECK_CONTROLLER, async move {
        controller.await;
        Ok(())
    }))
}

pub(crate) async fn reconcile(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    if !ext.is_zonelet_service() || ext.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let namespace = ext
        .namespace()
        .ok_or_else(|| Error::internal("extension without a namespace"))?;

    let deployment: Option<Deployment> =
        ctx.reader.get(COMPONENT_NAME, Some(&namespace)).await?;
    let health = availability(deployment.as_ref());
    debug!(
        extension = %ext.name_any(),
        namespace = %namespace,
        healthy = health.healthy,
        reason = health.reason,
        "Component health checked"
    );

    let previous = ext
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == HEALTHY_CONDITION));
    let condition = healthy_condition(&health, previous, Utc::now().to_rfc3339());

    patch_extension_status(
        &ctx.client,
        &ext,
        ExtensionStatus {
            conditions: Some(vec![condition]),
            ..Default::default()
        },
    )
    .await?;

    Ok(Action::requeue(ctx.config.sync_period))
}

pub(crate) fn error_policy(ext: Arc<Extension>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, extension = %ext.name_any(), "Health check failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}

pub(crate) struct ComponentHealth {
    healthy: bool,
    reason: &'static str,
    message: String,
}

/// Judge component health from the Deployment's `Available` condition
fn availability(deployment: Option<&Deployment>) -> ComponentHealth {
    let Some(deployment) = deployment else {
        return ComponentHealth {
            healthy: false,
            reason: "DeploymentMissing",
            message: format!("deployment {COMPONENT_NAME} does not exist"),
        };
    };
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Available"));
    match available {
        Some(cond) if cond.status == "True" => ComponentHealth {
            healthy: true,
            reason: "DeploymentAvailable",
            message: format!("deployment {COMPONENT_NAME} is available"),
        },
        Some(cond) => ComponentHealth {
            healthy: false,
            reason: "DeploymentUnavailable",
            message: cond
                .message
                .clone()
                .unwrap_or_else(|| format!("deployment {COMPONENT_NAME} is not available")),
        },
        None => ComponentHealth {
            healthy: false,
            reason: "AvailabilityUnknown",
            message: format!("deployment {COMPONENT_NAME} has not reported availability"),
        },
    }
}

/// Build the `Healthy` condition, keeping the transition time stable while
/// the status does not change
fn healthy_condition(
    health: &ComponentHealth,
    previous: Option<&ExtensionCondition>,
    now: String,
) -> ExtensionCondition {
    let status = if health.healthy { "True" } else { "False" };
    let last_transition_time = match previous {
        Some(prev) if prev.status == status => prev.last_transition_time.clone(),
        _ => Some(now),
    };
    ExtensionCondition {
        type_: HEALTHY_CONDITION.to_string(),
        status: status.to_string(),
        reason: Some(health.reason.to_string()),
        message: Some(health.message.clone()),
        last_transition_time,
    }
}
