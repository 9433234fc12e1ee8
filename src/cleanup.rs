//! Legacy resource-definition cleanup
//!
//! Releases before the zone-state redesign installed a `dnsowners` CRD that
//! nothing writes anymore. Once per leadership acquisition the operator walks
//! a short sequence to remove it: look the definition up, confirm deletion
//! with the platform's confirmation annotation, then delete it. A definition
//! that is already gone means a previous run finished the job. Any API error
//! stops the walk where it stands; the next leadership acquisition picks the
//! sequence up from the top, and every step tolerates being repeated.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{info, warn};

use crate::manager::Runnable;
use crate::{Error, Result};

/// CRD left behind by releases before the zone-state redesign
pub const LEGACY_CRD_NAME: &str = "dnsowners.dns.arbor.dev";

/// Annotation the platform requires before a protected definition may be
/// deleted
pub const DELETION_CONFIRMATION_ANNOTATION: &str = "confirmation.arbor.dev/deletion";

const DELETION_CONFIRMED: &str = "true";

/// Stage of the cleanup sequence a failure occurred in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupStage {
    /// Reading the legacy definition
    Lookup,
    /// Applying the deletion-confirmation annotation
    Patch,
    /// Deleting the definition
    Delete,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStage::Lookup => write!(f, "lookup"),
            CleanupStage::Patch => write!(f, "patch"),
            CleanupStage::Delete => write!(f, "delete"),
        }
    }
}

/// Answer to "does the legacy definition exist?"
///
/// Absence is a first-class answer, distinct from failing to find out.
#[derive(Debug)]
pub enum Lookup {
    /// The definition does not exist
    Absent,
    /// The definition exists as fetched
    Found(Box<CustomResourceDefinition>),
    /// The API could not answer; retry next tenure
    TransientFailure(kube::Error),
}

/// The API operations the cleanup sequence needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdOps: Send + Sync {
    /// Look up a definition by name
    async fn fetch(&self, name: &str) -> Lookup;
    /// Merge-patch a definition
    async fn merge_patch(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> std::result::Result<(), kube::Error>;
    /// Delete a definition
    async fn delete(&self, name: &str) -> std::result::Result<(), kube::Error>;
}

/// Real implementation over the cluster API
pub struct CrdClient {
    api: Api<CustomResourceDefinition>,
}

impl CrdClient {
    /// Definition operations against the given cluster
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdOps for CrdClient {
    async fn fetch(&self, name: &str) -> Lookup {
        match self.api.get(name).await {
            Ok(crd) => Lookup::Found(Box::new(crd)),
            Err(kube::Error::Api(e)) if e.code == 404 => Lookup::Absent,
            Err(e) => Lookup::TransientFailure(e),
        }
    }

    async fn merge_patch(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> std::result::Result<(), kube::Error> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
    }

    async fn delete(&self, name: &str) -> std::result::Result<(), kube::Error> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}

/// How a cleanup run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The definition was gone before this run touched anything
    AlreadyAbsent,
    /// This run confirmed and deleted the definition
    Removed,
}

/// The merge patch carrying only the confirmation-annotation delta
///
/// Nothing else about the definition is touched, so a concurrent writer
/// cannot conflict with this patch.
pub fn confirmation_patch() -> serde_json::Value {
    json!({
        "metadata": {
            "annotations": {
                DELETION_CONFIRMATION_ANNOTATION: DELETION_CONFIRMED
            }
        }
    })
}

/// The cleanup sequence against one target definition
pub struct LegacyCrdCleanup {
    ops: Arc<dyn CrdOps>,
    target: String,
}

impl LegacyCrdCleanup {
    /// Cleanup of [`LEGACY_CRD_NAME`] against the cluster
    pub fn new(client: Client) -> Self {
        Self::with_ops(Arc::new(CrdClient::new(client)), LEGACY_CRD_NAME)
    }

    /// Cleanup with explicit operations and target, for tests
    pub fn with_ops(ops: Arc<dyn CrdOps>, target: impl Into<String>) -> Self {
        Self {
            ops,
            target: target.into(),
        }
    }

    /// Walk the sequence once: lookup, confirm, delete
    ///
    /// Safe to repeat; a rerun after any outcome converges on
    /// `AlreadyAbsent`.
    pub async fn run(&self) -> Result<CleanupOutcome> {
        match self.ops.fetch(&self.target).await {
            Lookup::Absent => {
                info!(crd = %self.target, "Legacy definition absent, nothing to clean up");
                return Ok(CleanupOutcome::AlreadyAbsent);
            }
            Lookup::TransientFailure(e) => return Err(Error::cleanup(CleanupStage::Lookup, e)),
            Lookup::Found(_) => {}
        }

        if let Err(e) = self
            .ops
            .merge_patch(&self.target, confirmation_patch())
            .await
        {
            if is_gone(&e) {
                info!(crd = %self.target, "Legacy definition vanished before confirmation");
                return Ok(CleanupOutcome::AlreadyAbsent);
            }
            return Err(Error::cleanup(CleanupStage::Patch, e));
        }

        match self.ops.delete(&self.target).await {
            Ok(()) => {}
            // Someone else finished the deletion between our steps.
            Err(e) if is_gone(&e) => {}
            Err(e) => return Err(Error::cleanup(CleanupStage::Delete, e)),
        }
        info!(crd = %self.target, "Legacy definition removed");
        Ok(CleanupOutcome::Removed)
    }
}

fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// The cleanup sequence as a manager runnable
///
/// Requires leadership: exactly one operator replica may delete shared
/// definitions, and each leadership acquisition gets one run. Failures are
/// logged, not fatal; the definition stays put until a later tenure
/// succeeds.
pub fn runnable(client: Client) -> Runnable {
    Runnable::leader_gated("legacy-crd-cleanup", async move {
        let task = LegacyCrdCleanup::new(client);
        match task.run().await {
            Ok(outcome) => info!(?outcome, "Legacy cleanup finished"),
            Err(e) => {
                warn!(error = %e, "Legacy cleanup failed, deferred to the next leadership acquisition")
            }
        }
        Ok(())
    })
}
