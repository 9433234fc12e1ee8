//! Lifecycle controller: deploys and supervises the zone-manager component
//!
//! Watches `Extension` objects, keeps the zone-manager Deployment applied in
//! each extension's namespace, and records the outcome in extension status.
//! Record management itself belongs to the deployed component; this
//! controller only makes sure the component exists and matches configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info};

use crate::cache::ClusterReader;
use crate::config::{LifecycleConfig, ServiceConfig};
use crate::controller::{log_reconcile_result, patch_extension_status, LIFECYCLE_CONTROLLER};
use crate::crd::{Cluster, Extension, ExtensionPhase, ExtensionStatus};
use crate::manager::{Manager, Runnable};
use crate::{
    Error, Result, COMPONENT_NAME, FIELD_MANAGER, PROVIDER_SECRET_NAME, WATCH_TIMEOUT_SECS,
};

/// Where provider credentials appear inside the component container
const CREDENTIALS_MOUNT_PATH: &str = "/etc/zonelet/credentials";

pub(crate) struct Context {
    client: Client,
    reader: ClusterReader,
    config: LifecycleConfig,
    service: ServiceConfig,
}

/// Build the lifecycle controller as a leader-gated runnable
pub fn runnable(mgr: &Manager, config: LifecycleConfig, service: ServiceConfig) -> Result<Runnable> {
    let client = mgr.client();
    let extensions: Api<Extension> = Api::all(client.clone());
    let ctx = Arc::new(Context {
        client,
        reader: mgr.reader(),
        config: config.clone(),
        service,
    });
    let controller = Controller::new(
        extensions,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(config.max_concurrent))
    .graceful_shutdown_on(mgr.shutdown_token().cancelled_owned())
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result(LIFECYCLE_CONTROLLER));

    Ok(Runnable::leader_gated(LIFECYCLE_CONTROLLER, async move {
        controller.await;
        Ok(())
    }))
}

pub(crate) async fn reconcile(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    if !ext.is_zonelet_service() {
        return Ok(Action::await_change());
    }
    if ext.metadata.deletion_timestamp.is_some() {
        // Teardown rides on the extension's own deletion; nothing to unwind
        // here beyond what garbage collection already does.
        return Ok(Action::await_change());
    }
    if !ctx.config.ignore_operation_annotation && !ext.wants_reconcile() {
        debug!(extension = %ext.name_any(), "No operation requested, waiting");
        return Ok(Action::requeue(ctx.config.sync_period));
    }

    let namespace = ext
        .namespace()
        .ok_or_else(|| Error::internal("extension without a namespace"))?;
    let name = ext.name_any();
    info!(extension = %name, namespace = %namespace, "Reconciling DNS service extension");

    // Cluster identity is platform metadata, served from the local cache. The
    // Cluster object shares its name with the extension's namespace.
    let cluster: Option<Cluster> = ctx.reader.get(&namespace, None).await?;
    let cluster_domain = cluster.and_then(|c| c.spec.dns_domain);

    // Provider credentials are secret-like and always read straight from the
    // API server.
    let credentials: Option<Secret> = ctx
        .reader
        .get(PROVIDER_SECRET_NAME, Some(&namespace))
        .await?;

    let deployment = component_deployment(
        &namespace,
        &ctx.service,
        cluster_domain.as_deref(),
        credentials.is_some(),
    );
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch(
        COMPONENT_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&deployment),
    )
    .await?;
    debug!(namespace = %namespace, "Applied zone-manager deployment");

    patch_extension_status(
        &ctx.client,
        &ext,
        ExtensionStatus {
            observed_generation: ext.metadata.generation,
            phase: Some(ExtensionPhase::Succeeded),
            message: None,
            conditions: None,
        },
    )
    .await?;

    Ok(Action::requeue(ctx.config.sync_period))
}

pub(crate) fn error_policy(ext: Arc<Extension>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, extension = %ext.name_any(), "Reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}

fn component_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            COMPONENT_NAME.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// The zone-manager Deployment for one extension namespace
///
/// Credentials are mounted only when the provider secret exists; providers
/// that authenticate through workload identity run without a mount.
fn component_deployment(
    namespace: &str,
    service: &ServiceConfig,
    cluster_domain: Option<&str>,
    with_credentials: bool,
) -> Deployment {
    let mut env = vec![EnvVar {
        name: "DNS_CLASS".to_string(),
        value: Some(service.dns_class.clone()),
        ..Default::default()
    }];
    if let Some(domain) = cluster_domain {
        env.push(EnvVar {
            name: "CLUSTER_DOMAIN".to_string(),
            value: Some(domain.to_string()),
            ..Default::default()
        });
    }
    if with_credentials {
        env.push(EnvVar {
            name: "CREDENTIALS_DIR".to_string(),
            value: Some(CREDENTIALS_MOUNT_PATH.to_string()),
            ..Default::default()
        });
    }

    let volume_mounts = with_credentials.then(|| {
        vec![VolumeMount {
            name: "provider-credentials".to_string(),
            mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]
    });
    let volumes = with_credentials.then(|| {
        vec![Volume {
            name: "provider-credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PROVIDER_SECRET_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(COMPONENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(service.replicas),
            selector: LabelSelector {
                match_labels: Some(component_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(component_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "zone-manager".to_string(),
                        image: Some(service.image.clone()),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            name: Some("metrics".to_string()),
                            container_port: 8080,
                            ..Default::default()
                        }]),
                        volume_mounts,
                        ..Default::default()
                    }],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
