//! Schema registry composition and owned CRD installation
//!
//! Every API kind the operator touches is declared up front by a fixed-order
//! list of contributors and composed into one immutable [`SchemaRegistry`]
//! before the manager exists. Composition is all-or-nothing: every contributor
//! failure and duplicate registration is collected and reported together, and
//! no partial registry is ever handed out.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::discovery::{ApiResource, Scope};
use kube::{Client, CustomResourceExt, Resource};
use tracing::{debug, info};

use crate::crd::{Cluster, DnsEntry, DnsProvider, Extension, ZoneState};
use crate::{Error, Result, FIELD_MANAGER};

// =============================================================================
// Registry Types
// =============================================================================

/// Group/kind pair identifying an API type independent of version
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupKind {
    /// API group; empty for the core group
    pub group: String,
    /// Kind name as it appears on the wire
    pub kind: String,
}

impl GroupKind {
    /// Build a group/kind pair from explicit strings
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// The group/kind pair of a statically typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// One registered API type: enough to build a dynamic client for it and to
/// answer scope questions without discovery round-trips
#[derive(Clone, Debug)]
pub struct SchemaEntry {
    /// Wire-level identity (group, version, kind, plural)
    pub resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub scope: Scope,
    /// Name of the contributor that registered the kind; stamped during
    /// composition
    pub contributor: &'static str,
}

impl SchemaEntry {
    /// Entry for a namespaced kind
    pub fn namespaced<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            scope: Scope::Namespaced,
            contributor: "",
        }
    }

    /// Entry for a cluster-scoped kind
    pub fn cluster_scoped<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            scope: Scope::Cluster,
            contributor: "",
        }
    }

    /// The group/kind key this entry registers under
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.resource.group.clone(), self.resource.kind.clone())
    }
}

/// A named source of schema entries
///
/// Contributors are plain functions so composition stays deterministic and
/// free of cluster access; the name is carried into failure messages and into
/// each registered entry.
#[derive(Clone, Copy)]
pub struct SchemaContributor {
    /// Contributor name used in failure messages
    pub name: &'static str,
    /// Produces this contributor's entries, or a reason it cannot
    pub add: fn() -> std::result::Result<Vec<SchemaEntry>, String>,
}

/// Immutable map of every API kind the operator is allowed to touch
///
/// Built once by [`compose`], shared read-only afterwards. Lookups that miss
/// here indicate a programming error (a controller touching an undeclared
/// kind), not a runtime condition.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: BTreeMap<GroupKind, SchemaEntry>,
}

impl SchemaRegistry {
    fn insert(&mut self, entry: SchemaEntry) -> std::result::Result<(), String> {
        let key = entry.group_kind();
        if let Some(existing) = self.entries.get(&key) {
            return Err(format!(
                "duplicate kind {key} (already registered by {})",
                existing.contributor
            ));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Look up a registered kind
    pub fn resolve(&self, key: &GroupKind) -> Option<&SchemaEntry> {
        self.entries.get(key)
    }

    /// Whether the kind is registered
    pub fn contains(&self, key: &GroupKind) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over registered kinds in group/kind order
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKind, &SchemaEntry)> {
        self.entries.iter()
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Compose the standard registry from the fixed contributor order
pub fn compose() -> Result<SchemaRegistry> {
    compose_with(standard_contributors())
}

/// Compose a registry from the given contributors
///
/// Runs every contributor even after a failure so the error lists everything
/// wrong at once. Returns the registry only if no contributor failed and no
/// kind was registered twice.
pub fn compose_with(
    contributors: impl IntoIterator<Item = SchemaContributor>,
) -> Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::default();
    let mut failures = Vec::new();

    for contributor in contributors {
        match (contributor.add)() {
            Ok(entries) => {
                for mut entry in entries {
                    entry.contributor = contributor.name;
                    if let Err(msg) = registry.insert(entry) {
                        failures.push(format!("{}: {msg}", contributor.name));
                    }
                }
            }
            Err(msg) => failures.push(format!("{}: {msg}", contributor.name)),
        }
    }

    if !failures.is_empty() {
        return Err(Error::schema(failures));
    }
    debug!(kinds = registry.len(), "Composed schema registry");
    Ok(registry)
}

/// The standard contributors in their required order: platform base types
/// first, then the DNS domain, then extension-owned types, then the shared
/// extension types, then API metadata types
pub fn standard_contributors() -> [SchemaContributor; 5] {
    [
        SchemaContributor {
            name: "base-platform",
            add: base_platform_entries,
        },
        SchemaContributor {
            name: "dns",
            add: dns_entries,
        },
        SchemaContributor {
            name: "zonelet",
            add: zonelet_entries,
        },
        SchemaContributor {
            name: "extension-shared",
            add: extension_shared_entries,
        },
        SchemaContributor {
            name: "apiextensions",
            add: apiextensions_entries,
        },
    ]
}

fn base_platform_entries() -> std::result::Result<Vec<SchemaEntry>, String> {
    Ok(vec![
        SchemaEntry::namespaced::<Secret>(),
        SchemaEntry::namespaced::<ConfigMap>(),
        SchemaEntry::cluster_scoped::<Namespace>(),
        SchemaEntry::namespaced::<Deployment>(),
        SchemaEntry::namespaced::<Lease>(),
    ])
}

fn dns_entries() -> std::result::Result<Vec<SchemaEntry>, String> {
    Ok(vec![
        SchemaEntry::namespaced::<DnsEntry>(),
        SchemaEntry::namespaced::<DnsProvider>(),
    ])
}

fn zonelet_entries() -> std::result::Result<Vec<SchemaEntry>, String> {
    Ok(vec![SchemaEntry::namespaced::<ZoneState>()])
}

fn extension_shared_entries() -> std::result::Result<Vec<SchemaEntry>, String> {
    Ok(vec![
        SchemaEntry::namespaced::<Extension>(),
        SchemaEntry::cluster_scoped::<Cluster>(),
    ])
}

fn apiextensions_entries() -> std::result::Result<Vec<SchemaEntry>, String> {
    Ok(vec![SchemaEntry::cluster_scoped::<CustomResourceDefinition>()])
}

// =============================================================================
// Owned CRD Installation
// =============================================================================

/// A CRD this operator owns and installs at startup
pub struct CrdDef {
    /// Metadata name (`plural.group`)
    pub name: &'static str,
    /// Full manifest generated from the Rust type
    pub crd: CustomResourceDefinition,
}

/// Manifests for the CRDs this operator owns
///
/// The shared extension types (`Extension`, `Cluster`) are installed by the
/// platform and deliberately absent here.
pub fn owned_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "dnsentries.dns.arbor.dev",
            crd: DnsEntry::crd(),
        },
        CrdDef {
            name: "dnsproviders.dns.arbor.dev",
            crd: DnsProvider::crd(),
        },
        CrdDef {
            name: "zonestates.zonelet.dev",
            crd: ZoneState::crd(),
        },
    ]
}

/// Apply the owned CRDs via server-side apply
///
/// Idempotent; `force()` lets us take over fields from older operator
/// versions.
pub async fn ensure_crds(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let defs = owned_crds();
    info!(count = defs.len(), "Installing owned CRDs");
    for def in defs {
        api.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|source| Error::CrdInstall {
                name: def.name,
                source,
            })?;
        debug!(crd = def.name, "Applied CRD");
    }
    Ok(())
}
