//! Controller registration switches and the controllers themselves
//!
//! The registration set is an ordered list of switches, one per controller.
//! Each switch pairs a name and an enabled flag with a factory that builds
//! the controller against a constructed manager. Registration is
//! all-or-nothing: the first factory failure aborts startup and no further
//! factory runs, so the operator never comes up with a silently degraded
//! controller set.

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::config::CompletedOptions;
use crate::crd::{Extension, ExtensionStatus};
use crate::manager::{Manager, Runnable};
use crate::{Error, Result};

pub mod healthcheck;
pub mod heartbeat;
pub mod lifecycle;

/// Name of the lifecycle controller
pub const LIFECYCLE_CONTROLLER: &str = "lifecycle";
/// Name of the healthcheck controller
pub const HEALTHCHECK_CONTROLLER: &str = "healthcheck";
/// Name of the heartbeat controller
pub const HEARTBEAT_CONTROLLER: &str = "heartbeat";

/// Every controller this operator knows, in registration order
pub const KNOWN_CONTROLLERS: [&str; 3] = [
    LIFECYCLE_CONTROLLER,
    HEALTHCHECK_CONTROLLER,
    HEARTBEAT_CONTROLLER,
];

/// Builds one controller against a constructed manager
pub type Factory = Box<dyn FnOnce(&Manager) -> Result<Runnable> + Send>;

/// One registration switch: a named, toggleable controller factory
pub struct ControllerSwitch {
    /// Controller name, matching [`KNOWN_CONTROLLERS`]
    pub name: &'static str,
    /// Whether the controller will be registered
    pub enabled: bool,
    factory: Factory,
}

impl ControllerSwitch {
    /// Pair a named switch with its factory
    pub fn new(name: &'static str, enabled: bool, factory: Factory) -> Self {
        Self {
            name,
            enabled,
            factory,
        }
    }
}

/// The ordered controller registration set
pub struct ControllerSwitches {
    switches: Vec<ControllerSwitch>,
}

impl ControllerSwitches {
    /// A set from explicit switches, kept in the given order
    pub fn new(switches: Vec<ControllerSwitch>) -> Self {
        Self { switches }
    }

    /// The standard set, with each controller's configuration bound into its
    /// factory before any registration happens
    pub fn defaults(opts: &CompletedOptions) -> Self {
        let lifecycle_cfg = opts.lifecycle.clone();
        let service_cfg = opts.service.clone();
        let healthcheck_cfg = opts.healthcheck.clone();
        let heartbeat_cfg = opts.heartbeat.clone();
        let identity = opts.identity.clone();

        Self::new(vec![
            ControllerSwitch::new(
                LIFECYCLE_CONTROLLER,
                opts.controller_enabled(LIFECYCLE_CONTROLLER),
                Box::new(move |mgr| lifecycle::runnable(mgr, lifecycle_cfg, service_cfg)),
            ),
            ControllerSwitch::new(
                HEALTHCHECK_CONTROLLER,
                opts.controller_enabled(HEALTHCHECK_CONTROLLER),
                Box::new(move |mgr| healthcheck::runnable(mgr, healthcheck_cfg)),
            ),
            ControllerSwitch::new(
                HEARTBEAT_CONTROLLER,
                opts.controller_enabled(HEARTBEAT_CONTROLLER),
                Box::new(move |mgr| heartbeat::runnable(mgr, heartbeat_cfg, identity)),
            ),
        ])
    }

    /// The switches in registration order
    pub fn switches(&self) -> &[ControllerSwitch] {
        &self.switches
    }

    /// Run every enabled factory and register the results, in order
    ///
    /// Stops at the first failure: a set that cannot register completely does
    /// not register at all, and the startup error names the controller.
    pub fn add_to_manager(self, mgr: &mut Manager) -> Result<()> {
        for switch in self.switches {
            if !switch.enabled {
                info!(controller = switch.name, "Controller disabled, skipping");
                continue;
            }
            let runnable = (switch.factory)(mgr)
                .map_err(|e| Error::registration(switch.name, e.to_string()))?;
            mgr.register(runnable)?;
            info!(controller = switch.name, "Registered controller");
        }
        Ok(())
    }
}

/// Creates a closure for logging reconciliation results.
pub(crate) fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => {
                tracing::debug!(?action, controller = controller_name, "Reconciliation completed")
            }
            Err(e) => {
                tracing::error!(error = ?e, controller = controller_name, "Reconciliation error")
            }
        }
        std::future::ready(())
    }
}

/// Merge-patch an extension's status subresource
pub(crate) async fn patch_extension_status(
    client: &Client,
    ext: &Extension,
    status: ExtensionStatus,
) -> Result<()> {
    let namespace = ext
        .namespace()
        .ok_or_else(|| Error::internal("extension without a namespace"))?;
    let api: Api<Extension> = Api::namespaced(client.clone(), &namespace);
    api.patch_status(
        &ext.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClientCachePolicy;
    use crate::config::tests::base_options;
    use crate::manager::ManagerOptions;
    use crate::schema::SchemaRegistry;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn offline_manager() -> Manager {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            let response = http::Response::builder()
                .status(404)
                .body(kube::client::Body::from(Vec::new()))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        });
        Manager::with_client(
            kube::Client::new(service, "default"),
            ManagerOptions {
                namespace: "zonelet-system".to_string(),
                registry: SchemaRegistry::default(),
                cache_policy: ClientCachePolicy::standard(),
                cached_kinds: vec![],
                leadership: None,
            },
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn marker_switch(
        name: &'static str,
        enabled: bool,
        invoked: Arc<AtomicBool>,
    ) -> ControllerSwitch {
        ControllerSwitch::new(
            name,
            enabled,
            Box::new(move |_mgr| {
                invoked.store(true, Ordering::SeqCst);
                Ok(Runnable::leader_gated(name, async { Ok(()) }))
            }),
        )
    }

    #[test]
    fn defaults_keep_the_registration_order() {
        let opts = base_options().complete().unwrap();
        let set = ControllerSwitches::defaults(&opts);
        let names: Vec<_> = set.switches().iter().map(|s| s.name).collect();
        assert_eq!(names, KNOWN_CONTROLLERS);
        assert!(set.switches().iter().all(|s| s.enabled));
    }

    #[test]
    fn disabled_controllers_stay_in_the_set_but_off() {
        let mut raw = base_options();
        raw.disable_controllers = vec!["healthcheck".to_string()];
        let opts = raw.complete().unwrap();
        let set = ControllerSwitches::defaults(&opts);
        let flags: Vec<_> = set.switches().iter().map(|s| (s.name, s.enabled)).collect();
        assert_eq!(
            flags,
            vec![("lifecycle", true), ("healthcheck", false), ("heartbeat", true)]
        );
    }

    #[tokio::test]
    async fn registration_stops_at_the_first_failing_factory() {
        let mut mgr = offline_manager();
        let first = Arc::new(AtomicBool::new(false));
        let third = Arc::new(AtomicBool::new(false));
        let set = ControllerSwitches::new(vec![
            marker_switch("lifecycle", true, first.clone()),
            ControllerSwitch::new(
                "healthcheck",
                true,
                Box::new(|_mgr| Err(Error::internal("watch stream could not be built"))),
            ),
            marker_switch("heartbeat", true, third.clone()),
        ]);

        let err = set.add_to_manager(&mut mgr).expect_err("must fail closed");
        match &err {
            Error::Registration { controller, message } => {
                assert_eq!(*controller, "healthcheck");
                assert!(message.contains("watch stream"));
            }
            other => panic!("expected Registration error, got {other:?}"),
        }
        assert!(first.load(Ordering::SeqCst), "earlier factory ran");
        assert!(
            !third.load(Ordering::SeqCst),
            "factories after the failure must never run"
        );
        assert!(!mgr.started(), "a failed registration never starts the manager");
    }

    #[tokio::test]
    async fn disabled_switches_are_never_invoked() {
        let mut mgr = offline_manager();
        let invoked = Arc::new(AtomicBool::new(false));
        let set = ControllerSwitches::new(vec![marker_switch("lifecycle", false, invoked.clone())]);
        set.add_to_manager(&mut mgr).unwrap();
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(mgr.runnable_count(), 0);
    }
}
