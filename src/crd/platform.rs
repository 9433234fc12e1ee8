//! Arbor platform extension types (`extensions.arbor.dev`)
//!
//! The platform owns these CRDs; they are declared here so the operator can
//! watch them with typed APIs. `Extension` is the per-cluster request to run
//! an extension of a given type; `Cluster` is the cluster-scoped metadata
//! object named after the workload cluster's namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{EXTENSION_TYPE, OPERATION_ANNOTATION, OPERATION_RECONCILE};

/// API group for the platform's shared extension types
pub const PLATFORM_GROUP: &str = "extensions.arbor.dev";

// =============================================================================
// Extension
// =============================================================================

/// Spec for an Extension: a request to run one extension type in a
/// workload cluster's control-plane namespace
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.arbor.dev",
    version = "v1alpha1",
    kind = "Extension",
    plural = "extensions",
    namespaced,
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Extension type; this operator only acts on `zonelet-service`
    #[serde(rename = "type")]
    pub type_: String,

    /// Opaque extension-specific configuration forwarded by the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
}

/// Status of an Extension
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Generation last acted on by the extension controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ExtensionPhase>,

    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Health and progress conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ExtensionCondition>>,
}

/// Extension lifecycle phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExtensionPhase {
    /// Reconciliation in progress
    Processing,
    /// Last reconciliation completed successfully
    Succeeded,
    /// Last reconciliation failed
    Error,
}

/// A single status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionCondition {
    /// Condition type, e.g. `Healthy`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False`, or `Unknown`
    pub status: String,
    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Extension {
    /// Whether this extension is the type this operator owns
    pub fn is_zonelet_service(&self) -> bool {
        self.spec.type_ == EXTENSION_TYPE
    }

    /// Whether the platform has requested a reconcile via the operation
    /// annotation
    pub fn wants_reconcile(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OPERATION_ANNOTATION))
            .is_some_and(|v| v == OPERATION_RECONCILE)
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// Spec for a Cluster: platform metadata about one workload cluster.
/// Cluster objects are cluster-scoped and named after the workload cluster's
/// control-plane namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.arbor.dev",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Base DNS domain of the workload cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,

    /// Cluster purpose (`production`, `evaluation`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn extension(type_: &str, annotations: Option<BTreeMap<String, String>>) -> Extension {
        Extension {
            metadata: ObjectMeta {
                name: Some("zonelet".to_string()),
                namespace: Some("cluster--dev--one".to_string()),
                annotations,
                ..Default::default()
            },
            spec: ExtensionSpec {
                type_: type_.to_string(),
                provider_config: None,
            },
            status: None,
        }
    }

    #[test]
    fn only_zonelet_service_extensions_are_ours() {
        assert!(extension(EXTENSION_TYPE, None).is_zonelet_service());
        assert!(!extension("cert-service", None).is_zonelet_service());
    }

    #[test]
    fn reconcile_annotation_gates_work() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            OPERATION_ANNOTATION.to_string(),
            OPERATION_RECONCILE.to_string(),
        );
        assert!(extension(EXTENSION_TYPE, Some(annotations)).wants_reconcile());

        // missing annotation means wait
        assert!(!extension(EXTENSION_TYPE, None).wants_reconcile());

        // other operation values do not trigger a reconcile
        let mut other = BTreeMap::new();
        other.insert(OPERATION_ANNOTATION.to_string(), "migrate".to_string());
        assert!(!extension(EXTENSION_TYPE, Some(other)).wants_reconcile());
    }

    #[test]
    fn condition_wire_format_uses_type_key() {
        let cond = ExtensionCondition {
            type_: "Healthy".to_string(),
            status: "True".to_string(),
            reason: Some("ComponentAvailable".to_string()),
            message: None,
            last_transition_time: None,
        };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Healthy");
        assert_eq!(json["status"], "True");
        assert!(json.get("message").is_none());
    }
}
