//! DNS-management resource types (`dns.arbor.dev`)
//!
//! These are the records and provider declarations consumed by the deployed
//! `zone-manager` component. The operator installs the CRDs and otherwise
//! leaves the objects alone; record reconciliation happens in the component.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for the DNS-management types
pub const DNS_GROUP: &str = "dns.arbor.dev";

// =============================================================================
// DnsEntry
// =============================================================================

/// Spec for a DnsEntry: one requested DNS record set
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dns.arbor.dev",
    version = "v1alpha1",
    kind = "DnsEntry",
    plural = "dnsentries",
    shortname = "dnse",
    namespaced,
    status = "DnsEntryStatus",
    printcolumn = r#"{"name":"DNS Name","type":"string","jsonPath":".spec.dnsName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DnsEntrySpec {
    /// Fully qualified name the record answers for
    pub dns_name: String,

    /// Record targets (IPs become A/AAAA records, names become CNAMEs)
    #[serde(default)]
    pub targets: Vec<String>,

    /// TXT record values; a record set may carry targets, text, or both
    #[serde(default)]
    pub text: Vec<String>,

    /// Time to live in seconds; the provider default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Status written by the zone-manager component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsEntryStatus {
    /// Current phase of the record (Pending, Ready, Error, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Hosted zone the record landed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

// =============================================================================
// DnsProvider
// =============================================================================

/// Spec for a DnsProvider: credentials and domain scope for one DNS backend
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dns.arbor.dev",
    version = "v1alpha1",
    kind = "DnsProvider",
    plural = "dnsproviders",
    shortname = "dnsp",
    namespaced,
    status = "DnsProviderStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DnsProviderSpec {
    /// Backend type, e.g. `route53`, `clouddns`, `rfc2136`
    #[serde(rename = "type")]
    pub type_: String,

    /// Secret holding the backend credentials
    pub secret_ref: SecretReference,

    /// Domains this provider is allowed to serve; unrestricted when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainSelection>,
}

/// Reference to a credentials secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace; defaults to the provider's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Include/exclude domain filters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSelection {
    /// Domains the provider serves
    #[serde(default)]
    pub include: Vec<String>,
    /// Domains carved out of the included set
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Status written by the zone-manager component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsProviderStatus {
    /// Current phase of the provider (Ready, Error, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn dns_entry_crd_identity() {
        let crd = DnsEntry::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("dnsentries.dns.arbor.dev"));
        assert_eq!(crd.spec.group, DNS_GROUP);
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn dns_provider_crd_identity() {
        let crd = DnsProvider::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("dnsproviders.dns.arbor.dev")
        );
        assert_eq!(crd.spec.group, DNS_GROUP);
    }

    #[test]
    fn dns_entry_spec_camel_case_wire_format() {
        let spec = DnsEntrySpec {
            dns_name: "api.cluster-one.example.org".to_string(),
            targets: vec!["203.0.113.10".to_string()],
            text: vec![],
            ttl: Some(120),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["dnsName"], "api.cluster-one.example.org");
        assert_eq!(json["ttl"], 120);
        // empty text still serializes; only Option fields are omitted
        assert!(json.get("text").is_some());
    }
}
