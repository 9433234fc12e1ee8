//! Extension-owned state type (`zonelet.dev`)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group owned by this extension
pub const SERVICE_GROUP: &str = "zonelet.dev";

/// Spec for a ZoneState: a checkpoint of the records the zone-manager
/// component currently serves for one cluster. Written by the component,
/// read back during cluster migration so records survive a control-plane
/// move without a re-resolve from scratch.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "zonelet.dev",
    version = "v1alpha1",
    kind = "ZoneState",
    plural = "zonestates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStateSpec {
    /// Provider type the checkpoint was taken against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,

    /// Records in the checkpoint
    #[serde(default)]
    pub entries: Vec<StoredEntry>,
}

/// One checkpointed record
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    /// Name of the originating DnsEntry object
    pub name: String,
    /// Fully qualified record name
    pub dns_name: String,
    /// Record targets at checkpoint time
    #[serde(default)]
    pub targets: Vec<String>,
    /// TTL at checkpoint time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn zone_state_crd_identity() {
        let crd = ZoneState::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("zonestates.zonelet.dev"));
        assert_eq!(crd.spec.group, SERVICE_GROUP);
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
